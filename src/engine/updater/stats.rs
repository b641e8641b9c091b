//! Ruleset Stats Poller
//!
//! Confirms the appliance actually loaded the newly activated ruleset.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use super::endpoints;
use super::error::{Stage, UpdateError};
use super::poll::{CancelHandle, PollSettings};
use crate::engine::config::UpdaterConfig;
use crate::engine::remote::{Credential, RemoteCall, RemoteRequest, RemoteResponse};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetStats {
    #[serde(default)]
    pub loaded: i64,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RulesetStats {
    /// `loaded > 0` with no error; `"error": null` counts as no error
    pub fn is_ready(&self) -> bool {
        self.loaded > 0 && self.error.as_ref().map_or(true, Value::is_null)
    }

    /// `None` for non-200 or malformed responses, which the poller treats as not ready
    pub fn from_response(response: &RemoteResponse) -> Option<Self> {
        if response.status != 200 {
            return None;
        }
        serde_json::from_value(response.body.clone()).ok()
    }
}

pub struct RulesetStatsPoller<'a> {
    config: &'a UpdaterConfig,
    remote: &'a dyn RemoteCall,
    credential: &'a Credential,
}

impl<'a> RulesetStatsPoller<'a> {
    pub fn new(config: &'a UpdaterConfig, remote: &'a dyn RemoteCall, credential: &'a Credential) -> Self {
        Self {
            config,
            remote,
            credential,
        }
    }

    /// Poll on a fixed interval until the ruleset reports loaded, or the budget runs out
    pub fn await_loaded(&self, settings: &PollSettings, cancel: &CancelHandle) -> Result<RulesetStats, UpdateError> {
        let request = RemoteRequest::get(
            self.config.endpoint(endpoints::RULESET_STATS),
            settings.request_timeout,
        )
        .authorized(self.credential);

        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            cancel.check(Stage::RulesetStats)?;
            polls += 1;

            match self.remote.call(&request) {
                Ok(response) => match RulesetStats::from_response(&response) {
                    Some(stats) if stats.is_ready() => {
                        tracing::info!(
                            polls,
                            loaded = stats.loaded,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "ruleset loaded"
                        );
                        return Ok(stats);
                    }
                    Some(stats) => {
                        tracing::debug!(polls, loaded = stats.loaded, error = ?stats.error, "ruleset not ready");
                    }
                    None => {
                        tracing::debug!(polls, status = response.status, "ruleset stats unavailable");
                    }
                },
                Err(e) => tracing::warn!(polls, error = %e, "ruleset stats poll failed"),
            }

            let elapsed = started.elapsed();
            if elapsed >= settings.max_wait {
                tracing::error!(polls, elapsed_ms = elapsed.as_millis() as u64, "ruleset load timed out");
                return Err(UpdateError::RulesetLoadTimeout {
                    waited_secs: elapsed.as_secs_f64(),
                });
            }
            cancel.sleep(settings.interval.min(settings.max_wait - elapsed));
        }
    }
}
