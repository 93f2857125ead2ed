//! `ssm-sender`: send every message queued for the broker, then exit.
//! Option surface matches `bin/sender.py` (`-c/--config` defaulting to
//! `/etc/apel/sender.cfg`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ssm_core::agent::sender::run_sender;
use ssm_core::config::SenderConfig;
use ssm_core::logging;

#[derive(Parser)]
#[command(name = "ssm-sender", version, about = "Send queued APEL accounting messages")]
struct Args {
    #[arg(short, long, default_value = "/etc/apel/sender.cfg")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let logging_config = match SenderConfig::load(&args.config).map(|c| c.logging) {
        Ok(logging_config) => logging_config,
        Err(e) => {
            eprintln!("Error reading configuration file: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };
    let _guard = match logging::init(&logging_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error configuring logging: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("========================================");
    tracing::info!("Starting sending SSM version {}.", env!("CARGO_PKG_VERSION"));

    match run_sender(&args.config).await {
        Ok(()) => {
            tracing::info!("SSM has shut down.");
            tracing::info!("========================================");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("SSM failed to complete successfully.  See log file for details.");
            tracing::error!("SSM failed to complete successfully: {}", e);
            tracing::info!("========================================");
            ExitCode::FAILURE
        }
    }
}
