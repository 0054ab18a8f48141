//! Tracing subscriber setup.
//!
//! Logs go to stderr so command output on stdout stays machine readable.

use anyhow::{Result, anyhow};
use shared::config::client::{Config, LogFormat};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt};

/// Initializes the tracing subscriber for logging using the provided configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn initialize_tracing(config: &Config) -> Result<()> {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.log_format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn default_level(config: &Config) -> LevelFilter {
    config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO)
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = default_level(config);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}
