//! Updater CLI Module
//! Command-line interface for running and inspecting ruleset updates

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::engine::config::{ConfigError, UpdaterConfig};

#[derive(Parser, Debug)]
#[command(name = "ngfw-updater")]
#[command(version)]
#[command(about = "Fetch and activate ruleset updates on a managed NGFW appliance", long_about = None)]
pub struct Cli {
    /// JSON config file (defaults to NGFW_* environment variables)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the update pipeline and confirm no update is left pending
    CheckForUpdates {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Run the update pipeline and confirm through the start-download endpoint
    StartDownload {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Serve the update entry points over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8089")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Show the report of the last run
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Value sent as the Authorization header to the appliance
    #[arg(short, long, env = "NGFW_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Abort the run after this many seconds
    #[arg(long)]
    pub deadline: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write the effective configuration to a file
    Init {
        /// Destination path
        path: PathBuf,
    },
}

impl Cli {
    /// Effective configuration: the file when given, otherwise the environment
    pub fn load_config(&self) -> Result<UpdaterConfig, ConfigError> {
        match &self.config {
            Some(path) => UpdaterConfig::load(path),
            None => UpdaterConfig::from_env(),
        }
    }
}

/// Level used when `RUST_LOG` is unset or unparseable
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Log filter from `RUST_LOG`, falling back to `info`
pub fn log_filter() -> EnvFilter {
    log_filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

pub fn log_filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "ngfw-updater",
            "--format",
            "json",
            "start-download",
            "--token",
            "Bearer abc",
            "--deadline",
            "900",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::StartDownload { run } => {
                assert_eq!(run.token.as_deref(), Some("Bearer abc"));
                assert_eq!(run.deadline, Some(900));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_defaults() {
        let cli = Cli::try_parse_from(["ngfw-updater", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { port, host } => {
                assert_eq!(port, 8089);
                assert_eq!(host, "127.0.0.1");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_file_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.json");
        std::fs::write(&path, r#"{ "local_base": "https://fw.example/api" }"#).unwrap();

        let cli = Cli::try_parse_from([
            "ngfw-updater",
            "--config",
            path.to_str().unwrap(),
            "status",
        ])
        .unwrap();
        assert_eq!(cli.load_config().unwrap().local_base, "https://fw.example/api");
    }

    #[test]
    fn test_log_filter_honours_global_level() {
        assert_eq!(log_filter_from(Some("debug")).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter_from(Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(log_filter_from(None).max_level_hint(), Some(LevelFilter::INFO));
    }
}
