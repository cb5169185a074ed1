//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output style of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line, abbreviated events
    #[default]
    Compact,
    /// Default tracing-subscriber formatting with targets and thread names
    Full,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "full" => Ok(LogFormat::Full),
            other => Err(crate::Error::Config(format!(
                "Invalid log format '{}', must be 'compact' or 'full'",
                other
            ))),
        }
    }
}

/// Options for the fmt layer
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            ansi: true,
        }
    }
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` overrides `default_level` when set.
pub fn setup_logging(default_level: &str, options: LogOptions) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match options.format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_ansi(options.ansi),
            )
            .try_init(),
        LogFormat::Full => registry
            .with(
                fmt::layer()
                    .with_thread_names(true)
                    .with_ansi(options.ansi),
            )
            .try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}
