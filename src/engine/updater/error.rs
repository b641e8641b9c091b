//! Update Orchestration Errors
//!
//! Every stage of a run fails with an `UpdateError`. Its `Display` text is the
//! `message` handed back to the caller, so the wording here is user-facing.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

use super::transfer::TransferError;
use crate::engine::remote::{RemoteError, RemoteResponse};

/// Remote call a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    UpdateCheck,
    MaintenanceTrigger,
    MaintenanceStatus,
    MaintenanceConfirm,
    RuleActivation,
    RulesetStats,
    ConvergenceCheck,
    StartDownload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UpdateCheck => "update check",
            Self::MaintenanceTrigger => "maintenance update trigger",
            Self::MaintenanceStatus => "maintenance status poll",
            Self::MaintenanceConfirm => "maintenance status and logs",
            Self::RuleActivation => "rule activation",
            Self::RulesetStats => "ruleset stats poll",
            Self::ConvergenceCheck => "post-apply update check",
            Self::StartDownload => "start-download confirmation",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Authorization Required")]
    AuthorizationMissing,

    #[error("{stage} failed: {detail}")]
    Transport { stage: Stage, detail: String },

    #[error("{stage} response missing '{key}'")]
    SchemaViolation { stage: Stage, key: &'static str },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("maintenance update still in progress after {waited_secs:.1}s")]
    MaintenanceTimeout { waited_secs: f64 },

    #[error("maintenance update finished with status '{message}'")]
    MaintenanceDirty { message: String },

    #[error("rule activation rejected with HTTP {status}")]
    ActivationRejected { status: u16 },

    /// The appliance answered 200 with its own error object; `body` is kept verbatim
    #[error("rule activation failed: {message}")]
    ActivationError { message: String, body: Value },

    #[error("ruleset not loaded after {waited_secs:.1}s")]
    RulesetLoadTimeout { waited_secs: f64 },

    #[error("{0}")]
    ConvergenceMismatch(String),

    #[error("update run cancelled during {during}")]
    Cancelled { during: String },
}

impl UpdateError {
    pub fn transport(stage: Stage, error: RemoteError) -> Self {
        Self::Transport {
            stage,
            detail: error.to_string(),
        }
    }

    /// Timeout-class failures: the run gave up waiting rather than being refused
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::MaintenanceTimeout { .. } | Self::RulesetLoadTimeout { .. } | Self::Cancelled { .. }
        )
    }
}

/// Collapse a single call into "2xx response or stage failure"
pub(crate) fn require_success(
    stage: Stage,
    outcome: Result<RemoteResponse, RemoteError>,
) -> Result<RemoteResponse, UpdateError> {
    let response = outcome.map_err(|e| UpdateError::transport(stage, e))?;
    if !response.is_success() {
        return Err(UpdateError::Transport {
            stage,
            detail: format!("HTTP {}", response.status),
        });
    }
    Ok(response)
}

/// The two-field result object every entry point returns.
///
/// Serializes as `{"result": "OK"}` or `{"result": "ERROR", "message": ...}`.
/// `Passthrough` carries an appliance error object that must reach the caller
/// untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Ok,
    Error(String),
    Passthrough(Value),
}

impl RunResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Error(message) => Some(message),
            Self::Passthrough(body) => body.get("message").and_then(Value::as_str),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Ok => json!({ "result": "OK" }),
            Self::Error(message) => json!({ "result": "ERROR", "message": message }),
            Self::Passthrough(body) => body.clone(),
        }
    }

    pub fn from_json(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Passthrough(value);
        };
        match object.get("result").and_then(Value::as_str) {
            Some("OK") if object.len() == 1 => Self::Ok,
            Some("ERROR") if object.len() == 2 => match object.get("message").and_then(Value::as_str) {
                Some(message) => Self::Error(message.to_string()),
                None => Self::Passthrough(value),
            },
            _ => Self::Passthrough(value),
        }
    }
}

impl From<UpdateError> for RunResult {
    fn from(error: UpdateError) -> Self {
        match error {
            UpdateError::ActivationError { body, .. } => Self::Passthrough(body),
            other => Self::Error(other.to_string()),
        }
    }
}

impl Serialize for RunResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shapes() {
        assert_eq!(RunResult::Ok.to_json(), json!({ "result": "OK" }));
        assert_eq!(
            RunResult::error("boom").to_json(),
            json!({ "result": "ERROR", "message": "boom" })
        );
    }

    #[test]
    fn test_authorization_message() {
        let result = RunResult::from(UpdateError::AuthorizationMissing);
        assert_eq!(result.message(), Some("Authorization Required"));
    }

    #[test]
    fn test_activation_error_is_passed_through() {
        let body = json!({ "result": "ERROR", "message": "x", "code": 17 });
        let result = RunResult::from(UpdateError::ActivationError {
            message: "x".to_string(),
            body: body.clone(),
        });
        assert_eq!(result.to_json(), body);
        assert_eq!(result.message(), Some("x"));
    }

    #[test]
    fn test_from_json_recognises_plain_shapes() {
        assert_eq!(RunResult::from_json(json!({ "result": "OK" })), RunResult::Ok);
        assert_eq!(
            RunResult::from_json(json!({ "result": "ERROR", "message": "nope" })),
            RunResult::error("nope")
        );
        let extra = json!({ "result": "ERROR", "message": "m", "detail": [] });
        assert_eq!(RunResult::from_json(extra.clone()), RunResult::Passthrough(extra));
    }

    #[test]
    fn test_transport_message_names_stage() {
        let err = UpdateError::transport(
            Stage::RulesetStats,
            RemoteError::Timeout {
                url: "https://fw/api/stats".to_string(),
            },
        );
        assert!(err.to_string().starts_with("ruleset stats poll failed"));
        assert!(!err.is_timeout());
    }
}
