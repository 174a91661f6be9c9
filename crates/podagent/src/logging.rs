//! Tracing setup for the agent.
//!
//! The agent normally runs as a DaemonSet pod and logs to stdout, where the
//! container runtime collects and rotates them. `PODAGENT_LOG_FILE` sends
//! the stream to an append-only file instead, for running the agent as a
//! bare host service. `PODAGENT_LOG` carries the filter directives
//! (default `info`).

use std::env;
use std::fs;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV_VAR: &str = "PODAGENT_LOG";
const LOG_FILE_ENV_VAR: &str = "PODAGENT_LOG_FILE";

// keeps the non-blocking writer thread alive for the process lifetime
static LOG_WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Must run before the first log line.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_FILTER_ENV_VAR)
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match env::var(LOG_FILE_ENV_VAR) {
        Ok(path) if !path.is_empty() => {
            match fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    let (writer, guard) = tracing_appender::non_blocking(file);
                    let _ = LOG_WRITER_GUARD.set(guard);
                    builder.with_writer(writer).with_ansi(false).init();
                }
                Err(err) => {
                    builder.init();
                    tracing::warn!("Could not open log file {path}: {err}; logging to stdout");
                }
            }
        }
        _ => builder.init(),
    }
}
