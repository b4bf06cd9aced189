use tracing_subscriber::{filter::ParseError, EnvFilter};

use crate::config::LoggingConfig;

/// `RUST_LOG` when it is set, otherwise the configured directives.
pub fn build_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok(), directives)
}

fn filter_from(env: Option<String>, directives: &str) -> Result<EnvFilter, ParseError> {
    match env {
        Some(env) if !env.trim().is_empty() => EnvFilter::try_new(env),
        _ => EnvFilter::try_new(directives),
    }
}

pub fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&cfg.directives)
        .map_err(|e| anyhow::anyhow!("invalid logging.directives '{}': {e}", cfg.directives))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cfg.with_target)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {e}"))
}
