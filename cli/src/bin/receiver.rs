//! `ssm-receiver`: long-lived daemon that verifies and files incoming
//! accounting messages. Option surface matches `bin/receiver.py`
//! (`-c/--config` defaulting to `/etc/apel/receiver.cfg`, `-d/--dn_file`
//! defaulting to `/etc/apel/dns`).
//!
//! The pidfile existence pre-check and the fork into the background both
//! happen here, before `ssm-core` is ever asked to do anything — the
//! library only writes/removes the pidfile it's given, it never inspects
//! whether a stale one already exists (see DESIGN.md).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use daemonize::Daemonize;
use ssm_core::agent::receiver::run_receiver;
use ssm_core::config::ReceiverConfig;
use ssm_core::logging;

#[derive(Parser)]
#[command(name = "ssm-receiver", version, about = "Receive and file APEL accounting messages")]
struct Args {
    #[arg(short, long, default_value = "/etc/apel/receiver.cfg")]
    config: PathBuf,
    #[arg(short, long, default_value = "/etc/apel/dns")]
    dn_file: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ReceiverConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration file: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };

    if config.pidfile.exists() {
        eprintln!(
            "Pidfile {} already exists. Is the receiver already running?",
            config.pidfile.display()
        );
        return ExitCode::FAILURE;
    }

    // Fork into the background before spawning any threads — the
    // non-blocking log writer and the tokio runtime both start a thread,
    // and threads do not survive a fork.
    if let Err(e) = Daemonize::new().start() {
        eprintln!("Failed to daemonize: {e}");
        return ExitCode::FAILURE;
    }

    let _guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error configuring logging: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("========================================");
    tracing::info!("Starting receiving SSM version {}.", env!("CARGO_PKG_VERSION"));
    tracing::info!("The SSM will run as a daemon.");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run_receiver(&args.config, &args.dn_file));

    match result {
        Ok(()) => {
            tracing::info!("Receiving SSM has shut down.");
            tracing::info!("========================================");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Unexpected exception in SSM: {}", e);
            tracing::error!("The SSM will exit.");
            tracing::info!("========================================");
            ExitCode::FAILURE
        }
    }
}
