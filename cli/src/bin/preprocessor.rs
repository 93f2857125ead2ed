//! `ssm-preprocessor`: fold consecutive same-header records of the
//! outbound queue into a `combined_queue` sibling. Option surface matches
//! `bin/preprocessor.py` (`-c/--config` only, no `dn_file`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ssm_core::coalescer::coalesce;
use ssm_core::config::SenderConfig;
use ssm_core::logging;

#[derive(Parser)]
#[command(name = "ssm-preprocessor", version, about = "Coalesce queued APEL accounting messages")]
struct Args {
    #[arg(short, long, default_value = "/etc/apel/sender.cfg")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match SenderConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration file: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };
    let _guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error configuring logging: {e}");
            eprintln!("The system will exit.");
            return ExitCode::FAILURE;
        }
    };

    match coalesce(&config.path, config.path_type) {
        Ok(combined_path) => {
            tracing::info!("Combined queue written to {}", combined_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Preprocessing failed.  See log file for details.");
            tracing::error!("Preprocessing failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
