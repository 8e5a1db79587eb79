use anyhow::Result;
use std::io;
use tracing_subscriber::EnvFilter;
use trellis_config::{LogFormat, LoggingConfig};

/// Filter from a level plus optional extra directives
///
/// Falls back to `RUST_LOG`, then `info`, when the directives do not parse.
pub fn build_filter(level: &str, extra: Option<&str>) -> EnvFilter {
    let directives = match extra {
        Some(extra) => format!("{},{}", level, extra),
        None => level.to_string(),
    };
    EnvFilter::try_new(directives)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from configuration
///
/// Logs go to stderr so reporters own stdout.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level.to_string(), config.filter.as_deref());

    // Use try_init to avoid panic if global subscriber already set
    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .with_target(false)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .json()
            .with_current_span(false)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_filter(log_level, None);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing inside a process context
///
/// Output goes to stderr without colours; stdout belongs to the IPC link.
pub fn init_worker_tracing(log_level: &str, context_id: &str) -> Result<()> {
    let env_filter = build_filter(log_level, None);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .try_init()
        .is_err()
    {
        return Ok(());
    }
    tracing::debug!("Logging initialized for context {}", context_id);

    Ok(())
}
