//! Run Report
//!
//! Records the phase progression of one orchestration run and persists the
//! last report to disk so operators can see where a run stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::error::RunResult;
use super::orchestrator::{ActivationOutcome, Convergence};
use super::transfer::ArtifactPair;

/// Pipeline phase of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Checking,
    Staging,
    Transferring,
    Verifying,
    Maintenance,
    Activating,
    AwaitingRuleset,
    Converging,
    Completed,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Checking => "update check",
            Self::Staging => "staging",
            Self::Transferring => "artifact transfer",
            Self::Verifying => "artifact verification",
            Self::Maintenance => "maintenance update",
            Self::Activating => "rule activation",
            Self::AwaitingRuleset => "ruleset load",
            Self::Converging => "convergence check",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase: RunPhase,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub convergence: Convergence,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Current phase; after a failure, the phase that failed stays in `history`
    pub phase: RunPhase,
    pub history: Vec<PhaseRecord>,
    /// True when the update was already staged and transfer/maintenance were skipped
    pub staging_skipped: bool,
    pub artifacts: Option<ArtifactPair>,
    pub activation: Option<ActivationOutcome>,
    pub loaded_rules: Option<i64>,
    pub result: Option<RunResult>,
}

impl RunReport {
    pub fn begin(convergence: Convergence) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            convergence,
            started_at: Utc::now(),
            finished_at: None,
            phase: RunPhase::Pending,
            history: Vec::new(),
            staging_skipped: false,
            artifacts: None,
            activation: None,
            loaded_rules: None,
            result: None,
        }
    }

    pub fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.history.push(PhaseRecord {
            phase,
            entered_at: Utc::now(),
        });
    }

    /// Last phase entered before the run finished
    pub fn last_active_phase(&self) -> RunPhase {
        self.history
            .iter()
            .rev()
            .map(|record| record.phase)
            .find(|phase| !matches!(phase, RunPhase::Completed | RunPhase::Failed))
            .unwrap_or(RunPhase::Pending)
    }

    pub fn finish(&mut self, result: RunResult) {
        self.enter(if result.is_ok() {
            RunPhase::Completed
        } else {
            RunPhase::Failed
        });
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Outcome of a finished run; an unfinished report is an error
    pub fn outcome(&self) -> RunResult {
        self.result
            .clone()
            .unwrap_or_else(|| RunResult::error("update run did not finish"))
    }

    pub fn entered(&self, phase: RunPhase) -> bool {
        self.history.iter().any(|record| record.phase == phase)
    }

    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| StateError::ReadError(e.to_string()))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::ParseError(e.to_string()))
    }

    /// Save atomically: temp file, then rename
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::SerializeError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::WriteError(e.to_string()))?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|e| StateError::WriteError(e.to_string()))?;
        fs::rename(&temp_path, path).map_err(|e| StateError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Report persistence errors
#[derive(Debug, Clone)]
pub enum StateError {
    ReadError(String),
    WriteError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadError(e) => write!(f, "Failed to read run report: {}", e),
            Self::WriteError(e) => write!(f, "Failed to write run report: {}", e),
            Self::ParseError(e) => write!(f, "Failed to parse run report: {}", e),
            Self::SerializeError(e) => write!(f, "Failed to serialize run report: {}", e),
        }
    }
}

impl std::error::Error for StateError {}
