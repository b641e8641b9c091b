//! Maintenance Activator
//!
//! Pushes the staged update into the appliance's configuration pipeline and
//! waits for it to settle.
//!
//! Per attempt: `Triggered -> Polling -> Settled -> Confirming -> Clean | Dirty`,
//! or `Polling -> Timeout`. Only `Clean` lets the run continue.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::endpoints;
use super::error::{require_success, Stage, UpdateError};
use super::poll::{CancelHandle, PollSettings};
use crate::engine::config::UpdaterConfig;
use crate::engine::remote::{Credential, RemoteCall, RemoteRequest};

/// Status value reported while the appliance is still absorbing the change
pub const IN_PROGRESS: &str = "updating";

/// Message the status-and-logs endpoint reports after a clean settle
pub const CLEAN_MESSAGE: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenancePhase {
    Idle,
    Triggered,
    Polling,
    Settled,
    Confirming,
    Clean,
    Dirty,
    Timeout,
}

pub struct MaintenanceActivator<'a> {
    config: &'a UpdaterConfig,
    remote: &'a dyn RemoteCall,
    credential: &'a Credential,
    phase: MaintenancePhase,
}

impl<'a> MaintenanceActivator<'a> {
    pub fn new(config: &'a UpdaterConfig, remote: &'a dyn RemoteCall, credential: &'a Credential) -> Self {
        Self {
            config,
            remote,
            credential,
            phase: MaintenancePhase::Idle,
        }
    }

    pub fn phase(&self) -> MaintenancePhase {
        self.phase
    }

    /// Trigger, wait for settle, then confirm
    pub fn run(&mut self, settings: &PollSettings, cancel: &CancelHandle) -> Result<(), UpdateError> {
        self.activate()?;
        self.await_settled(settings, cancel)?;
        self.confirm_clean()
    }

    /// POST the maintenance update. Not retried here.
    pub fn activate(&mut self) -> Result<(), UpdateError> {
        let request = RemoteRequest::post(
            self.config.endpoint(endpoints::MAINTENANCE_UPDATE),
            self.config.request_timeout(),
        )
        .authorized(self.credential);

        require_success(Stage::MaintenanceTrigger, self.remote.call(&request))?;
        self.phase = MaintenancePhase::Triggered;
        tracing::info!("maintenance update triggered");
        Ok(())
    }

    /// Poll until the status leaves the in-progress sentinel.
    ///
    /// Returns the instant a poll reports anything other than `updating`.
    /// Failed or non-2xx polls count as still in progress; only the overall
    /// budget ends the loop.
    pub fn await_settled(&mut self, settings: &PollSettings, cancel: &CancelHandle) -> Result<(), UpdateError> {
        let request = RemoteRequest::get(
            self.config.endpoint(endpoints::MAINTENANCE_STATUS),
            settings.request_timeout,
        )
        .authorized(self.credential);

        self.phase = MaintenancePhase::Polling;
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            cancel.check(Stage::MaintenanceStatus)?;
            polls += 1;

            match self.remote.call(&request) {
                Ok(response) if response.is_success() => {
                    let message = response.str_field("message").unwrap_or_default();
                    if message != IN_PROGRESS {
                        self.phase = MaintenancePhase::Settled;
                        tracing::info!(
                            polls,
                            status_message = message,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "maintenance update settled"
                        );
                        return Ok(());
                    }
                    tracing::debug!(polls, "maintenance update still in progress");
                }
                Ok(response) => {
                    tracing::warn!(polls, status = response.status, "maintenance status poll rejected");
                }
                Err(e) => {
                    tracing::warn!(polls, error = %e, "maintenance status poll failed");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= settings.max_wait {
                self.phase = MaintenancePhase::Timeout;
                tracing::error!(polls, elapsed_ms = elapsed.as_millis() as u64, "maintenance update timed out");
                return Err(UpdateError::MaintenanceTimeout {
                    waited_secs: elapsed.as_secs_f64(),
                });
            }
            cancel.sleep(settings.interval.min(settings.max_wait - elapsed));
        }
    }

    /// One GET against status-and-logs; anything but `OK` is dirty
    pub fn confirm_clean(&mut self) -> Result<(), UpdateError> {
        self.phase = MaintenancePhase::Confirming;
        let request = RemoteRequest::get(
            self.config.endpoint(endpoints::MAINTENANCE_STATUS_AND_LOGS),
            self.config.request_timeout(),
        )
        .authorized(self.credential);

        let response = require_success(Stage::MaintenanceConfirm, self.remote.call(&request))?;
        let Some(message) = response.str_field("message") else {
            self.phase = MaintenancePhase::Dirty;
            return Err(UpdateError::SchemaViolation {
                stage: Stage::MaintenanceConfirm,
                key: "message",
            });
        };

        if message != CLEAN_MESSAGE {
            self.phase = MaintenancePhase::Dirty;
            tracing::error!(status_message = message, "maintenance update finished dirty");
            return Err(UpdateError::MaintenanceDirty {
                message: message.to_string(),
            });
        }

        self.phase = MaintenancePhase::Clean;
        tracing::info!("maintenance update confirmed clean");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::remote::{Method, RemoteError};
    use crate::engine::updater::fakes::ScriptedRemote;
    use serde_json::json;
    use std::time::Duration;

    fn fast_settings(max_wait_ms: u64) -> PollSettings {
        PollSettings::new(
            Duration::from_millis(5),
            Duration::from_millis(max_wait_ms),
            Duration::from_millis(100),
        )
    }

    fn credential() -> Credential {
        Credential::parse(Some("Bearer test")).unwrap()
    }

    #[test]
    fn test_settle_stops_on_first_changed_status() {
        let remote = ScriptedRemote::new()
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "updating" }))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "updating" }))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "done" }))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "updating" }));
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        activator
            .await_settled(&fast_settings(5_000), &CancelHandle::new())
            .unwrap();

        assert_eq!(activator.phase(), MaintenancePhase::Settled);
        assert_eq!(remote.calls_to(endpoints::MAINTENANCE_STATUS), 3);
    }

    #[test]
    fn test_settle_treats_failed_polls_as_in_progress() {
        let remote = ScriptedRemote::new()
            .reply_error(
                Method::GET,
                endpoints::MAINTENANCE_STATUS,
                RemoteError::Timeout {
                    url: "status".to_string(),
                },
            )
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 502, json!({}))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "idle" }));
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        assert!(activator
            .await_settled(&fast_settings(5_000), &CancelHandle::new())
            .is_ok());
        assert_eq!(remote.calls_to(endpoints::MAINTENANCE_STATUS), 3);
    }

    #[test]
    fn test_settle_times_out() {
        let remote = ScriptedRemote::new().reply(
            Method::GET,
            endpoints::MAINTENANCE_STATUS,
            200,
            json!({ "message": "updating" }),
        );
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        let started = Instant::now();
        let err = activator
            .await_settled(&fast_settings(60), &CancelHandle::new())
            .unwrap_err();

        assert!(matches!(err, UpdateError::MaintenanceTimeout { .. }));
        assert_eq!(activator.phase(), MaintenancePhase::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_settle_honours_cancellation() {
        let remote = ScriptedRemote::new().reply(
            Method::GET,
            endpoints::MAINTENANCE_STATUS,
            200,
            json!({ "message": "updating" }),
        );
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = activator.await_settled(&fast_settings(5_000), &cancel).unwrap_err();

        assert!(matches!(err, UpdateError::Cancelled { .. }));
        assert!(err.is_timeout());
        assert_eq!(remote.call_count(), 0);
    }

    #[test]
    fn test_trigger_failure_is_not_retried() {
        let remote = ScriptedRemote::new().reply(Method::POST, endpoints::MAINTENANCE_UPDATE, 500, json!({}));
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        let err = activator.run(&fast_settings(1_000), &CancelHandle::new()).unwrap_err();
        assert_eq!(err.to_string(), "maintenance update trigger failed: HTTP 500");
        assert_eq!(remote.call_count(), 1);
        assert_eq!(activator.phase(), MaintenancePhase::Idle);
    }

    #[test]
    fn test_confirm_clean_and_dirty() {
        let remote = ScriptedRemote::new()
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS_AND_LOGS, 200, json!({ "message": "OK" }))
            .reply(
                Method::GET,
                endpoints::MAINTENANCE_STATUS_AND_LOGS,
                200,
                json!({ "message": "ERROR: rules rejected" }),
            );
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        activator.confirm_clean().unwrap();
        assert_eq!(activator.phase(), MaintenancePhase::Clean);

        let err = activator.confirm_clean().unwrap_err();
        assert!(matches!(err, UpdateError::MaintenanceDirty { .. }));
        assert_eq!(activator.phase(), MaintenancePhase::Dirty);
    }

    #[test]
    fn test_confirm_requires_message_key() {
        let remote = ScriptedRemote::new().reply(
            Method::GET,
            endpoints::MAINTENANCE_STATUS_AND_LOGS,
            200,
            json!({ "logs": [] }),
        );
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        let err = activator.confirm_clean().unwrap_err();
        assert!(matches!(err, UpdateError::SchemaViolation { key: "message", .. }));
    }

    #[test]
    fn test_full_run_reaches_clean() {
        let remote = ScriptedRemote::new()
            .reply(Method::POST, endpoints::MAINTENANCE_UPDATE, 200, json!({}))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "updating" }))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS, 200, json!({ "message": "finished" }))
            .reply(Method::GET, endpoints::MAINTENANCE_STATUS_AND_LOGS, 200, json!({ "message": "OK" }));
        let config = UpdaterConfig::default();
        let credential = credential();
        let mut activator = MaintenanceActivator::new(&config, &remote, &credential);

        activator.run(&fast_settings(5_000), &CancelHandle::new()).unwrap();
        assert_eq!(activator.phase(), MaintenancePhase::Clean);

        let calls = remote.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls
            .iter()
            .all(|call| call.header("Authorization") == Some("Bearer test")));
    }
}
