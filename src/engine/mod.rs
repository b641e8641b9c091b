// Updater Engine - Core module structure
pub mod api;
pub mod cli;
pub mod config;
pub mod remote;
pub mod updater;

pub use config::UpdaterConfig;
pub use updater::UpdateOrchestrator;
