//! Logging setup
//!
//! Human-readable output by default; `--log-format json` switches to
//! structured JSON lines for log collectors. `RUST_LOG` overrides the level.

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::{Error, Result};

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct LogConfig {
    /// Debug level instead of info
    pub verbose: bool,
    pub format: LogFormat,
}

impl LogConfig {
    fn default_directives(&self) -> &'static str {
        if self.verbose {
            "debug,kube=info,tower=warn,hyper=warn,rustls=warn"
        } else {
            "info,kube=warn,tower=warn,hyper=warn"
        }
    }
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::config(format!("failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_the_default_level() {
        let quiet = LogConfig::default();
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert!(quiet.default_directives().starts_with("info"));
        assert!(verbose.default_directives().starts_with("debug"));
    }

    #[test]
    fn second_initialization_is_an_error_not_a_panic() {
        let _ = init_logging(LogConfig::default());
        assert!(init_logging(LogConfig::default()).is_err());
    }
}
