//! Ruleset Update System
//!
//! Fetches a versioned ruleset artifact and activates it on a managed appliance.
//!
//! Components:
//! - `transfer` - Staging directory and artifact download
//! - `maintenance` - Maintenance push and settle polling
//! - `stats` - Ruleset load polling
//! - `orchestrator` - The update pipeline and its two entry behaviors
//! - `state` - Per-run phase report
//! - `poll` - Poll budgets and cancellation
//! - `fakes` - In-memory collaborators for tests

pub mod error;
pub mod fakes;
pub mod maintenance;
pub mod orchestrator;
pub mod poll;
pub mod state;
pub mod stats;
pub mod transfer;

pub use error::{RunResult, Stage, UpdateError};
pub use orchestrator::{ActivationOutcome, Convergence, UpdateOrchestrator};
pub use poll::{CancelHandle, PollSettings};
pub use state::{RunPhase, RunReport};
pub use transfer::{ArtifactPair, ArtifactTransfer, HttpArtifactTransfer};

/// Appliance API paths, relative to the configured local base
pub mod endpoints {
    pub const CHECK_FOR_UPDATES: &str = "/update/rules/check-for-updates";
    pub const DOWNLOAD_AND_APPLY: &str = "/update/rules/download-and-apply";
    pub const START_DOWNLOAD: &str = "/update/rules/start-download";
    pub const MAINTENANCE_UPDATE: &str = "/manager/maintenanceUpdateBrp";
    pub const MAINTENANCE_STATUS: &str = "/manager/maintenanceUpdateBrpStatus";
    pub const MAINTENANCE_STATUS_AND_LOGS: &str = "/manager/maintenanceUpdateBrpStatusAndLogs";
    pub const RULESET_STATS: &str = "/service/remote/ngfw/ids/call/status/ruleset-stats";
}
