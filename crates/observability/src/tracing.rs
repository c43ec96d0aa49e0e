//! Tracing/logging initialization.
//!
//! `RUST_LOG` controls filtering (default `info`); `COINVAULT_LOG_FORMAT=pretty`
//! switches from JSON lines to human-readable output.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let format = match std::env::var("COINVAULT_LOG_FORMAT").as_deref() {
            Ok("pretty") | Ok("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (the call is then a no-op).
pub fn init(config: &TracingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    match config.format {
        LogFormat::Json => builder.json().with_target(false).try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
