//! CLI entry point for the CRF search daemon
//!
//! Parses command line arguments, sets up logging and runs the daemon or one
//! of the administrative subcommands.

use clap::{Parser, Subcommand};
use crf_search_daemon::{open_database, Config, Daemon, DaemonError, FailureLedger, StateMachine};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CRF search daemon - quality search and AV1 encoding for a video library
#[derive(Parser, Debug)]
#[command(name = "crf-search-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply when missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Skip binary checks; the database is still opened. For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Send every failed video back to needs_analysis
    ResetFailed,
    /// Print the failure history of one video as JSON
    Failures {
        video_id: i64,
    },
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let command = args.command.unwrap_or(Command::Run { skip_checks: false });
    match command {
        Command::Run { skip_checks } => run(config, skip_checks).await,
        Command::ResetFailed => reset_failed(&config),
        Command::Failures { video_id } => failures(&config, video_id),
    }
}

async fn run(config: Config, skip_checks: bool) -> ExitCode {
    info!(database = %config.database.path.display(), "crf search daemon starting");

    let daemon: Result<Daemon, DaemonError> = if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks)");
        open_database(&config)
            .map(|store| Daemon::with_store(config, store))
            .map_err(Into::into)
    } else {
        Daemon::with_config(config)
    };

    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };
    info!(
        crf_searchers = daemon.plan.crf_searchers,
        encoders = daemon.plan.encoders,
        admin = %daemon.config.admin.bind,
        "daemon initialized"
    );

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}

fn reset_failed(config: &Config) -> ExitCode {
    let result = open_database(config)
        .map_err(|e| e.to_string())
        .and_then(|store| {
            StateMachine::new(store)
                .reset_failed_to_needs_analysis()
                .map_err(|e| e.to_string())
        });
    match result {
        Ok(count) => {
            println!("{} failed video(s) reset to needs_analysis", count);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "reset failed");
            ExitCode::FAILURE
        }
    }
}

fn failures(config: &Config, video_id: i64) -> ExitCode {
    let result = open_database(config)
        .map_err(|e| e.to_string())
        .and_then(|store| {
            FailureLedger::new(store)
                .failures_for_video(video_id)
                .map_err(|e| e.to_string())
        })
        .and_then(|records| serde_json::to_string_pretty(&records).map_err(|e| e.to_string()));
    match result {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(video_id, error = %e, "failed to read failures");
            ExitCode::FAILURE
        }
    }
}
