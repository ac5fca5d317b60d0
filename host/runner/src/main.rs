//! Host pipeline runner
//!
//! Usage: `pipeline-runner [config.json]`
//!
//! Runs one session against the in-memory card and prints the report as
//! JSON on stdout. Log level comes from `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use env_logger::Env;
use log::{error, info};
use pipeline_runner::{run_session, RunnerConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("pipeline runner v{}", adc_pipeline::VERSION);

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match RunnerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => RunnerConfig::default(),
    };

    let report = match run_session(&config).await {
        Ok(report) => report,
        Err(e) => {
            error!("session failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("statistics:\n{}", report.statistics);

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to encode report: {}", e);
            ExitCode::FAILURE
        }
    }
}
