//! Tracing subscriber setup for processes embedding a warm-standby group.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing_subscriber::util::TryInitError;

/// Builds the filter directive for `level`, keeping third-party crates at `warn`.
#[must_use]
pub fn default_directive(level: &str) -> String {
    format!("warn,tandem_core={level},tests={level}")
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins when set; the shorthands `debug` and `trace` widen only this
/// crate's targets. Otherwise `config.level` applies.
///
/// # Errors
///
/// Returns [`TryInitError`] if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env_filter) if env_filter == "debug" || env_filter == "trace" => {
            EnvFilter::new(default_directive(&env_filter))
        }
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level))),
        Err(_) => EnvFilter::new(default_directive(&config.level)),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).try_init()
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).try_init()
    }
}
