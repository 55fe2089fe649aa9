//! Helm CLI - binary entry point.
//!
//! ```text
//! main() -> Args::parse -> HelmConfig::load -> setup::build_engine
//!                                                  |
//!                                                  v
//!                                  repl::one_shot | repl::interactive
//! ```
//!
//! Logs go to a file so they never interleave with streamed output.

mod args;
mod repl;
mod setup;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use helm_config::HelmConfig;

use crate::args::Args;

/// Send events to the first log file that can be opened. With none, the
/// filter is installed alone and nothing is printed over the conversation.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut problems = Vec::new();
    let log_file = log_file_candidates()
        .into_iter()
        .find_map(|path| match open_append(&path) {
            Ok(file) => Some((path, file)),
            Err(problem) => {
                problems.push(problem);
                None
            }
        });

    let Some((path, file)) = log_file else {
        tracing_subscriber::registry().with(filter).init();
        return;
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(filter)
        .init();
    tracing::info!(path = %path.display(), "Logging initialized");
    for problem in problems {
        tracing::warn!("{problem}");
    }
}

fn open_append(path: &Path) -> Result<fs::File, String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| format!("cannot create log directory {}: {e}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open log file {}: {e}", path.display()))
}

/// `~/.helm/logs/helm.log`, then the same layout under the working directory.
fn log_file_candidates() -> Vec<PathBuf> {
    let relative = Path::new(".helm").join("logs").join("helm.log");
    let mut candidates: Vec<PathBuf> = dirs::home_dir()
        .map(|home| home.join(&relative))
        .into_iter()
        .collect();
    candidates.push(relative);
    candidates
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {

    let config = HelmConfig::load()?.unwrap_or_default();
    tracing::debug!(api_keys = ?config.api_keys, "Config loaded");

    let (provider, params) = setup::resolve(&args, &config)?;
    let engine = setup::build_engine(&config, provider, &params.model)?;

    match args.prompt() {
        Some(prompt) => Ok(repl::one_shot(&engine, &params, prompt).await),
        None => {
            repl::interactive(&engine, &params).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "Exiting with error");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{log_file_candidates, open_append};

    #[test]
    fn working_directory_is_the_last_resort() {
        let candidates = log_file_candidates();
        let last = candidates.last().unwrap();
        assert!(last.is_relative());
        assert!(last.ends_with(".helm/logs/helm.log"));
    }

    #[test]
    fn open_append_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("helm.log");
        open_append(&path).unwrap();
        assert!(path.exists());
    }
}
