//! Update Orchestrator
//!
//! Sequences one ruleset update run:
//!
//! 1. validate the credential
//! 2. ask the appliance whether an update is already staged
//! 3. if not, stage the artifact pair and push it through maintenance
//! 4. make the rules live
//! 5. wait for the ruleset to load
//! 6. confirm convergence (variant dependent)
//!
//! Every stage either completes or ends the run with its own error. There is
//! no compensation; re-running the whole pipeline is the recovery path.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::endpoints;
use super::error::{require_success, RunResult, Stage, UpdateError};
use super::maintenance::MaintenanceActivator;
use super::poll::CancelHandle;
use super::state::{RunPhase, RunReport};
use super::stats::RulesetStatsPoller;
use super::transfer::{ArtifactRequest, ArtifactTransfer};
use crate::engine::config::UpdaterConfig;
use crate::engine::remote::{Credential, RemoteCall, RemoteRequest};

/// Final confirmation step of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Convergence {
    /// Re-query availability; expects nothing left pending
    CheckForUpdates,
    /// Ask the start-download endpoint; expects `ok == 1`
    StartDownload,
}

/// How the appliance answered the "make it live" call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// 200 without an error payload
    Applied,
    /// 204
    AppliedNoContent,
    /// 422: the appliance had nothing to apply
    NothingToApply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAvailability {
    pub found: bool,
}

pub struct UpdateOrchestrator<'a> {
    config: &'a UpdaterConfig,
    remote: &'a dyn RemoteCall,
    transfer: &'a dyn ArtifactTransfer,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(config: &'a UpdaterConfig, remote: &'a dyn RemoteCall, transfer: &'a dyn ArtifactTransfer) -> Self {
        Self {
            config,
            remote,
            transfer,
        }
    }

    /// Entry behavior ending in a re-check that no update is pending
    pub fn check_for_updates(&self, authorization: Option<&str>, cancel: &CancelHandle) -> RunResult {
        self.execute(authorization, Convergence::CheckForUpdates, cancel).outcome()
    }

    /// Entry behavior ending in the start-download acknowledgement
    pub fn start_download(&self, authorization: Option<&str>, cancel: &CancelHandle) -> RunResult {
        self.execute(authorization, Convergence::StartDownload, cancel).outcome()
    }

    /// Run the shared pipeline and return the full report. Never fails; the
    /// outcome is in `report.result`.
    pub fn execute(&self, authorization: Option<&str>, convergence: Convergence, cancel: &CancelHandle) -> RunReport {
        let mut report = RunReport::begin(convergence);
        let span = tracing::info_span!("update_run", run_id = %report.run_id, variant = ?convergence);
        let _guard = span.enter();

        let result = match self.pipeline(authorization, convergence, cancel, &mut report) {
            Ok(()) => {
                tracing::info!("ruleset update completed");
                RunResult::Ok
            }
            Err(e) => {
                tracing::error!(phase = %report.phase, error = %e, "ruleset update failed");
                RunResult::from(e)
            }
        };
        report.finish(result);

        if let Some(path) = &self.config.state_path {
            if let Err(e) = report.save(path) {
                tracing::warn!(path = %path.display(), error = %e, "could not persist run report");
            }
        }
        report
    }

    fn pipeline(
        &self,
        authorization: Option<&str>,
        convergence: Convergence,
        cancel: &CancelHandle,
        report: &mut RunReport,
    ) -> Result<(), UpdateError> {
        let credential = Credential::parse(authorization).ok_or(UpdateError::AuthorizationMissing)?;

        step(report, cancel, RunPhase::Checking)?;
        let availability = self.query_availability(&credential, Stage::UpdateCheck)?;

        if availability.found {
            tracing::info!("update already staged; skipping transfer and maintenance");
            report.staging_skipped = true;
        } else {
            let staging_dir = &self.config.artifact.staging_dir;
            let request = ArtifactRequest::from_config(self.config);

            step(report, cancel, RunPhase::Staging)?;
            self.transfer.prepare(staging_dir)?;

            step(report, cancel, RunPhase::Transferring)?;
            let pair = self.transfer.fetch(&request, staging_dir)?;

            step(report, cancel, RunPhase::Verifying)?;
            self.transfer.verify(staging_dir, &pair)?;
            tracing::info!(
                payload = %pair.payload_path.display(),
                bytes = pair.payload_bytes,
                sha256 = %pair.payload_sha256,
                "artifact staged"
            );
            report.artifacts = Some(pair);

            step(report, cancel, RunPhase::Maintenance)?;
            MaintenanceActivator::new(self.config, self.remote, &credential)
                .run(&self.config.maintenance.settings(), cancel)?;
        }

        step(report, cancel, RunPhase::Activating)?;
        report.activation = Some(self.activate_rules(&credential)?);

        step(report, cancel, RunPhase::AwaitingRuleset)?;
        let stats = RulesetStatsPoller::new(self.config, self.remote, &credential)
            .await_loaded(&self.config.stats.settings(), cancel)?;
        report.loaded_rules = Some(stats.loaded);

        step(report, cancel, RunPhase::Converging)?;
        match convergence {
            Convergence::CheckForUpdates => self.confirm_nothing_pending(&credential),
            Convergence::StartDownload => self.confirm_start_download(&credential),
        }
    }

    fn query_availability(&self, credential: &Credential, stage: Stage) -> Result<UpdateAvailability, UpdateError> {
        let body = json!({
            "login": self.config.update.login,
            "password": self.config.update.password,
            "channel": self.config.update.channel,
        });
        let request = RemoteRequest::post(
            self.config.endpoint(endpoints::CHECK_FOR_UPDATES),
            self.config.request_timeout(),
        )
        .authorized(credential)
        .json(body);

        let response = require_success(stage, self.remote.call(&request))?;
        let found = response
            .field("found")
            .and_then(Value::as_bool)
            .ok_or(UpdateError::SchemaViolation { stage, key: "found" })?;

        tracing::info!(found, %stage, "update availability");
        Ok(UpdateAvailability { found })
    }

    /// The final "make it live" call. 200, 204 and 422 are all accepted but
    /// logged as distinct outcomes; a 200 carrying `result: ERROR` is passed
    /// back verbatim.
    fn activate_rules(&self, credential: &Credential) -> Result<ActivationOutcome, UpdateError> {
        let request = RemoteRequest::post(
            self.config.endpoint(endpoints::DOWNLOAD_AND_APPLY),
            self.config.request_timeout(),
        )
        .authorized(credential);

        let response = self
            .remote
            .call(&request)
            .map_err(|e| UpdateError::transport(Stage::RuleActivation, e))?;

        match response.status {
            200 => {
                if response.str_field("result") == Some("ERROR") {
                    let message = response
                        .str_field("message")
                        .unwrap_or("appliance reported an error")
                        .to_string();
                    return Err(UpdateError::ActivationError {
                        message,
                        body: response.body,
                    });
                }
                tracing::info!(outcome = "applied", "rule activation accepted");
                Ok(ActivationOutcome::Applied)
            }
            204 => {
                tracing::info!(outcome = "applied-no-content", "rule activation accepted");
                Ok(ActivationOutcome::AppliedNoContent)
            }
            422 => {
                tracing::warn!(outcome = "nothing-to-apply", body = %response.body, "rule activation had nothing to apply");
                Ok(ActivationOutcome::NothingToApply)
            }
            status => Err(UpdateError::ActivationRejected { status }),
        }
    }

    fn confirm_nothing_pending(&self, credential: &Credential) -> Result<(), UpdateError> {
        let availability = self.query_availability(credential, Stage::ConvergenceCheck)?;
        if availability.found {
            return Err(UpdateError::ConvergenceMismatch(
                "post-apply check expected found=false".to_string(),
            ));
        }
        Ok(())
    }

    fn confirm_start_download(&self, credential: &Credential) -> Result<(), UpdateError> {
        let request = RemoteRequest::post(
            self.config.endpoint(endpoints::START_DOWNLOAD),
            self.config.request_timeout(),
        )
        .authorized(credential);

        let response = require_success(Stage::StartDownload, self.remote.call(&request))?;
        let ok = response.field("ok").ok_or(UpdateError::SchemaViolation {
            stage: Stage::StartDownload,
            key: "ok",
        })?;

        if ok.as_i64() != Some(1) {
            return Err(UpdateError::ConvergenceMismatch(
                "start-download confirmation expected ok=1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage boundary: honour cancellation, then record the phase
fn step(report: &mut RunReport, cancel: &CancelHandle, phase: RunPhase) -> Result<(), UpdateError> {
    cancel.check(phase)?;
    report.enter(phase);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::remote::Method;
    use crate::engine::updater::fakes::{MemoryTransfer, ScriptedRemote};

    fn config() -> UpdaterConfig {
        let mut config = UpdaterConfig::default();
        config.local_base = "https://fw.test/api".to_string();
        config.stats.interval_secs = 0.005;
        config.stats.timeout_secs = 2.0;
        config
    }

    #[test]
    fn test_activation_outcomes_are_distinct() {
        for (status, expected) in [
            (200, ActivationOutcome::Applied),
            (204, ActivationOutcome::AppliedNoContent),
            (422, ActivationOutcome::NothingToApply),
        ] {
            let remote = ScriptedRemote::new().reply(
                Method::POST,
                endpoints::DOWNLOAD_AND_APPLY,
                status,
                json!({}),
            );
            let config = config();
            let transfer = MemoryTransfer::new();
            let orchestrator = UpdateOrchestrator::new(&config, &remote, &transfer);
            let credential = Credential::parse(Some("Bearer t")).unwrap();

            assert_eq!(orchestrator.activate_rules(&credential).unwrap(), expected);
        }
    }

    #[test]
    fn test_activation_rejects_other_statuses() {
        let remote = ScriptedRemote::new().reply(Method::POST, endpoints::DOWNLOAD_AND_APPLY, 409, json!({}));
        let config = config();
        let transfer = MemoryTransfer::new();
        let orchestrator = UpdateOrchestrator::new(&config, &remote, &transfer);
        let credential = Credential::parse(Some("Bearer t")).unwrap();

        let err = orchestrator.activate_rules(&credential).unwrap_err();
        assert!(matches!(err, UpdateError::ActivationRejected { status: 409 }));
    }

    #[test]
    fn test_availability_requires_found_key() {
        let remote = ScriptedRemote::new().reply(
            Method::POST,
            endpoints::CHECK_FOR_UPDATES,
            200,
            json!({ "available": true }),
        );
        let config = config();
        let transfer = MemoryTransfer::new();
        let orchestrator = UpdateOrchestrator::new(&config, &remote, &transfer);

        let result = orchestrator.check_for_updates(Some("Bearer t"), &CancelHandle::new());
        assert_eq!(result.message(), Some("update check response missing 'found'"));
        assert_eq!(remote.call_count(), 1);
    }

    #[test]
    fn test_check_body_carries_configured_credentials() {
        let remote = ScriptedRemote::new().reply(Method::POST, endpoints::CHECK_FOR_UPDATES, 500, json!({}));
        let mut config = config();
        config.update.login = "svc".to_string();
        config.update.password = "pw".to_string();
        let transfer = MemoryTransfer::new();
        let orchestrator = UpdateOrchestrator::new(&config, &remote, &transfer);

        let result = orchestrator.check_for_updates(Some("Bearer t"), &CancelHandle::new());
        assert_eq!(result.message(), Some("update check failed: HTTP 500"));

        let calls = remote.calls();
        assert_eq!(calls[0].url, "https://fw.test/api/update/rules/check-for-updates");
        assert_eq!(
            calls[0].body,
            Some(json!({ "login": "svc", "password": "pw", "channel": "stable" }))
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let remote = ScriptedRemote::new();
        let config = config();
        let transfer = MemoryTransfer::new();
        let orchestrator = UpdateOrchestrator::new(&config, &remote, &transfer);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let report = orchestrator.execute(Some("Bearer t"), Convergence::CheckForUpdates, &cancel);

        assert_eq!(
            report.outcome().message(),
            Some("update run cancelled during update check")
        );
        assert_eq!(remote.call_count(), 0);
    }
}
