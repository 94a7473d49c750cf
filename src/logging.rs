//! Logging setup, powered by tracing-subscriber.
//!
//! Console output goes to stderr because stdout carries the machine-readable
//! results of the CLI. An optional daily-rolling file layer is written through
//! `tracing-appender`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable holding a filter directive; takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "JOBTRAIL_LOG";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directive used when no environment filter is set.
    pub level: String,
    pub json: bool,
    /// Verbose raises the default directive to `debug`.
    pub verbose: bool,
    /// Daily-rolling file name inside `log_dir`.
    pub file: Option<String>,
}

/// Build the filter: `JOBTRAIL_LOG`, then `RUST_LOG`, then `default_level`.
/// Noisy HTTP internals are capped at `warn`.
fn build_env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    let base = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());
    filter_from(&base)
}

fn filter_from(base: &str) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![base.to_string()];
    for target in ["hyper", "hyper_util", "reqwest", "rustls", "h2"] {
        directives.push(format!("{}=warn", target));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file layer on drop; keep it alive for the
/// whole process and drop it before `process::exit`.
pub fn init_logging(options: &LogOptions, log_dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if options.verbose {
        "debug"
    } else if options.level.is_empty() {
        "info"
    } else {
        options.level.as_str()
    };

    let console_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(build_env_filter(level)?)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(build_env_filter(level)?)
            .boxed()
    };

    let (file_layer, guard) = match options.file.as_deref() {
        Some(file_name) => {
            std::fs::create_dir_all(log_dir)?;
            let appender = tracing_appender::rolling::daily(log_dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(build_env_filter(level)?)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::trace!(level, json = options.json, file = ?options.file, "logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_levels_and_directives() {
        assert!(filter_from("info").is_ok());
        assert!(filter_from("jobtrail=debug,warn").is_ok());
        assert!(filter_from("jobtrail::orchestrator=trace").is_ok());
    }
}
