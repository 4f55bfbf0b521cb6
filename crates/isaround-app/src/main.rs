// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Is Around connector — prints attendance documents for due observances.
//
// Entry point. Parses the command line, initialises logging, wires the
// backend services and runs the requested command.

mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::DispatchStatus;
use isaround_core::ConnectorConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};

use services::connector_services::{
    ConnectorServices, PASSWORD_ENV, config_path, health_writer, load_config, persist_config,
    read_health, with_password_override, write_health,
};
use services::data_dir;

#[derive(Parser)]
#[command(
    name = "isaround-connector",
    version,
    about = "Poll Is Around for observances and print their documents exactly once",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to config.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the dispatch database and health file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll until interrupted
    Run,

    /// Run a single poll cycle and exit
    Once,

    /// Show health, dispatch records and upcoming occurrences
    Status,

    /// Put a failed occurrence back to pending
    Reset {
        /// Observance id as reported by Is Around
        observance_id: String,

        /// Occurrence time (RFC 3339), as shown by `status`
        occurrence_time: DateTime<Utc>,
    },

    /// Check that Is Around and the printer are reachable
    TestConnection,

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective config (password redacted)
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let dir = match data_dir::data_dir(cli.data_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("cannot create data directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let path = config_path(cli.config.as_deref(), &dir);
    let loaded = load_config(&path);

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        match &loaded {
            Ok(Some(config)) => config.log_level.clone(),
            _ => "info".to_string(),
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let result = match loaded {
        Ok(stored) => {
            let config = with_password_override(
                stored.clone().unwrap_or_default(),
                std::env::var(PASSWORD_ENV).ok(),
            );
            dispatch(cli.command, config, stored.is_some(), &path, &dir).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(
    command: Commands,
    config: ConnectorConfig,
    config_exists: bool,
    config_file: &std::path::Path,
    dir: &std::path::Path,
) -> Result<ExitCode> {
    let require_config = || {
        if config_exists {
            Ok(())
        } else {
            Err(ConnectorError::Config(format!(
                "no config at {}; run `isaround-connector config init` first",
                config_file.display()
            )))
        }
    };

    match command {
        Commands::Run => {
            require_config()?;
            run(ConnectorServices::init(config, dir)?).await
        }
        Commands::Once => {
            require_config()?;
            once(ConnectorServices::init(config, dir)?).await
        }
        Commands::Status => {
            require_config()?;
            status(ConnectorServices::init(config, dir)?).await
        }
        Commands::Reset {
            observance_id,
            occurrence_time,
        } => {
            require_config()?;
            let services = ConnectorServices::init(config, dir)?;
            let record = services.reset(&observance_id, occurrence_time)?;
            if record.status == DispatchStatus::Pending {
                println!("{} reset to pending", record.key);
            } else {
                println!("{} is {:?}; nothing to reset", record.key, record.status);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::TestConnection => {
            require_config()?;
            test_connection(ConnectorServices::init(config, dir)?).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_exists && !force {
                    return Err(ConnectorError::Config(format!(
                        "{} already exists (use --force to overwrite)",
                        config_file.display()
                    )));
                }
                persist_config(config_file, &ConnectorConfig::default())?;
                println!("wrote default config to {}", config_file.display());
                Ok(ExitCode::SUCCESS)
            }
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config.redacted())?);
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

async fn run(services: ConnectorServices) -> Result<ExitCode> {
    let scheduler = services.scheduler()?;
    services.authenticate().await;

    let health_path = services.health_path();
    let writer = tokio::spawn(health_writer(scheduler.subscribe(), health_path.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(std::sync::Arc::clone(&scheduler).run(shutdown_rx));

    info!(data_dir = %services.data_dir().display(), "Is Around connector running");
    shutdown_signal().await;
    info!("shutdown signal received, finishing current cycle");

    // The receiver only goes away if the poll loop already ended.
    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        error!(error = %e, "poll loop panicked");
    }

    writer.abort();
    if let Err(e) = write_health(&health_path, &scheduler.health()) {
        warn!(error = %e, "failed to write final health file");
    }
    info!("Is Around connector stopped");
    Ok(ExitCode::SUCCESS)
}

async fn once(services: ConnectorServices) -> Result<ExitCode> {
    let scheduler = services.scheduler()?;
    services.authenticate().await;

    let outcome = scheduler.run_cycle().await;
    write_health(&services.health_path(), &scheduler.health())?;

    match outcome? {
        Some(report) => println!(
            "cycle {}: {} observances, {} due, {} dispatched, {} retrying, {} failed, {} stale, {} deferred",
            report.cycle_id,
            report.observances,
            report.due,
            report.dispatched,
            report.retryable,
            report.failed,
            report.stale,
            report.deferred
        ),
        None => println!("another cycle is already running"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(services: ConnectorServices) -> Result<ExitCode> {
    match read_health(&services.health_path()) {
        Some(health) => {
            println!("health:        {:?}", health.status);
            println!("store:         {}", if health.store_available { "ok" } else { "unavailable" });
            println!("source errors: {}", health.consecutive_source_failures);
            if let Some(at) = health.last_success_at {
                println!("last success:  {}", at.to_rfc3339());
            }
            if let Some(err) = &health.last_error {
                println!("last error:    {err}");
            }
            println!(
                "totals:        {} dispatched, {} failed",
                health.dispatched_total, health.failed_total
            );
        }
        None => println!("health:        unknown (connector has not run yet)"),
    }
    match services.last_poll_time()? {
        Some(at) => println!("last poll:     {}", at.to_rfc3339()),
        None => println!("last poll:     never"),
    }

    let records = services.records()?;
    println!("\ndispatch records ({}):", records.len());
    for record in &records {
        println!(
            "  {:<9} {:<40} attempts={}{}",
            format!("{:?}", record.status).to_lowercase(),
            record.key.to_string(),
            record.attempts,
            record
                .last_error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }

    services.authenticate().await;
    println!(
        "\nupcoming (next {} days):",
        services.config().recurrence_lookahead_days
    );
    match services.upcoming().await {
        Ok(list) if list.is_empty() => println!("  none"),
        Ok(list) => {
            for (id, title, at) in list {
                println!("  {}  {:<24} {}", at.to_rfc3339(), id, title);
            }
        }
        Err(e) => println!("  unavailable: {e}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn test_connection(services: ConnectorServices) -> Result<ExitCode> {
    let source_ok = services.client().test_connection().await;
    println!(
        "Is Around ({}): {}",
        services.client().base_url(),
        if source_ok { "reachable" } else { "unreachable" }
    );

    let printer_ok = match services.printer_attributes().await {
        Ok(attrs) => {
            let state = attrs
                .get("printer-state")
                .map(String::as_str)
                .unwrap_or("unknown");
            let name = attrs
                .get("printer-make-and-model")
                .or_else(|| attrs.get("printer-name"))
                .map(String::as_str)
                .unwrap_or("unnamed printer");
            println!("printer: reachable ({name}, state {state})");
            true
        }
        Err(ConnectorError::NoPrinterConfigured) => {
            println!("printer: not configured");
            false
        }
        Err(e) => {
            println!("printer: unreachable ({e})");
            false
        }
    };

    Ok(if source_ok && printer_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn reset_parses_rfc3339_time() {
        let cli = Cli::try_parse_from([
            "isaround-connector",
            "reset",
            "sun-1",
            "2026-06-07T10:00:00Z",
        ])
        .expect("parse");
        match cli.command {
            Commands::Reset {
                observance_id,
                occurrence_time,
            } => {
                assert_eq!(observance_id, "sun-1");
                assert_eq!(occurrence_time.to_rfc3339(), "2026-06-07T10:00:00+00:00");
            }
            _ => panic!("expected reset"),
        }
    }

    #[test]
    fn global_options_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "isaround-connector",
            "once",
            "--data-dir",
            "/tmp/isaround",
            "-v",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/isaround")));
        assert!(matches!(cli.command, Commands::Once));
    }
}
