//! ngfw-updater CLI - Main entry point
//!
//! Runs the ruleset update pipeline once, or serves it over HTTP.

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use ngfw_updater::engine::{
    api::{create_router, ApiState},
    cli::{log_filter, Cli, Commands, ConfigAction, OutputFormat, RunArgs},
    config::UpdaterConfig,
    remote::HttpRemoteClient,
    updater::{CancelHandle, Convergence, HttpArtifactTransfer, RunReport, UpdateOrchestrator},
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run_cli(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded
fn run_cli(cli: Cli) -> anyhow::Result<bool> {
    let config = cli.load_config().context("failed to load configuration")?;
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::CheckForUpdates { run } => cmd_run(&config, run, Convergence::CheckForUpdates, json_output),
        Commands::StartDownload { run } => cmd_run(&config, run, Convergence::StartDownload, json_output),
        Commands::Serve { port, host } => cmd_serve(config, &host, port).map(|_| true),
        Commands::Status => cmd_status(&config, json_output),
        Commands::Config { action } => cmd_config(action, &config, json_output).map(|_| true),
    }
}

fn cmd_run(config: &UpdaterConfig, args: RunArgs, convergence: Convergence, json: bool) -> anyhow::Result<bool> {
    let remote = HttpRemoteClient::new(config.accept_invalid_certs)?;
    let transfer = HttpArtifactTransfer::new(config.accept_invalid_certs)?;
    let cancel = match args.deadline {
        Some(secs) => CancelHandle::with_timeout(Duration::from_secs(secs)),
        None => CancelHandle::new(),
    };

    let orchestrator = UpdateOrchestrator::new(config, &remote, &transfer);
    let report = orchestrator.execute(args.token.as_deref(), convergence, &cancel);
    let result = report.outcome();

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print_report(&report);
    }
    Ok(result.is_ok())
}

fn cmd_serve(config: UpdaterConfig, host: &str, port: u16) -> anyhow::Result<()> {
    // Blocking clients are built outside the async runtime
    let remote = Arc::new(HttpRemoteClient::new(config.accept_invalid_certs)?);
    let transfer = Arc::new(HttpArtifactTransfer::new(config.accept_invalid_certs)?);
    let state = ApiState::new(config, remote, transfer);

    let addr = format!("{}:{}", host, port);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        tracing::info!(%addr, "ngfw-updater listening");
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_status(config: &UpdaterConfig, json: bool) -> anyhow::Result<bool> {
    let Some(path) = &config.state_path else {
        anyhow::bail!("no state path configured (set NGFW_STATE_PATH or state_path in the config file)");
    };

    match RunReport::load(path)? {
        Some(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(report.outcome().is_ok())
        }
        None => {
            if json {
                println!("null");
            } else {
                println!("No update run recorded at {}", path.display());
            }
            Ok(true)
        }
    }
}

fn cmd_config(action: ConfigAction, config: &UpdaterConfig, json: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = config.clone();
            if !shown.update.password.is_empty() {
                shown.update.password = "********".to_string();
            }
            if !shown.artifact.password.is_empty() {
                shown.artifact.password = "********".to_string();
            }
            if json {
                println!("{}", serde_json::to_string(&shown)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            }
        }
        ConfigAction::Init { path } => {
            if path.exists() {
                anyhow::bail!("refusing to overwrite {}", path.display());
            }
            config.save(&path)?;
            if json {
                println!("{}", serde_json::json!({ "success": true, "path": path.display().to_string() }));
            } else {
                println!("Wrote configuration to {}", path.display());
            }
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let result = report.outcome();
    let variant = match report.convergence {
        Convergence::CheckForUpdates => "check-for-updates",
        Convergence::StartDownload => "start-download",
    };

    println!("{} {}", "Run".bold(), report.run_id);
    println!("   variant:  {}", variant);
    println!("   started:  {}", report.started_at.to_rfc3339());
    if report.staging_skipped {
        println!("   staging:  skipped (update already staged)");
    } else if let Some(pair) = &report.artifacts {
        println!(
            "   payload:  {} ({} bytes, sha256 {})",
            pair.payload_path.display(),
            pair.payload_bytes,
            pair.payload_sha256
        );
    }
    if let Some(activation) = report.activation {
        println!("   activation: {:?}", activation);
    }
    if let Some(loaded) = report.loaded_rules {
        println!("   rules loaded: {}", loaded);
    }

    match result.message() {
        None if result.is_ok() => println!("{}", "OK".green().bold()),
        message => println!(
            "{} during {}: {}",
            "ERROR".red().bold(),
            report.last_active_phase(),
            message.unwrap_or("appliance returned an error")
        ),
    }
}
