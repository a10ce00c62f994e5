//! Log subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging options read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directives, e.g. `wecache_storage=debug,info`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl LogConfig {
    /// `WECACHE_LOG` then `RUST_LOG` for the filter, `WECACHE_LOG_FORMAT=json`
    /// for structured output.
    pub fn from_env() -> Self {
        let filter = std::env::var("WECACHE_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());
        let json = std::env::var("WECACHE_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        Self { filter, json }
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays parseable.
pub fn init(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| format!("invalid log filter {:?}: {}", config.filter, e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| format!("failed to init subscriber: {}", e))
}
