// ========================================================================================
//
//                      THE BENCHMARK DRIVER: SURVBENCH
//
// ========================================================================================
//
// Resolves the configuration, then evaluates every model and selector in the catalog
// with repeated stratified cross-validation. All tunables are fixed constants; the only
// external input is the optional TOML file naming the data and report directories.

use std::process;
use survbench::config::{AppConfig, RunSettings};
use survbench::orchestrator::{self, RunError};
use survbench::progress::ConsoleProgress;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), RunError> {
    let config = AppConfig::resolve()?;
    log::info!(
        "Benchmarking '{}', reports go to '{}'",
        config.dataset_path().display(),
        config.reports_dir.display()
    );
    orchestrator::run_benchmark(&config, RunSettings::default(), &mut ConsoleProgress)
}
