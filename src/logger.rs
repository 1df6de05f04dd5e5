use std::str::FromStr;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidValue {
                field: "log-level",
                value: other.to_string(),
                valid: "debug, info, warn, error",
            }),
        }
    }
}

impl LogLevel {
    fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn log(self, message: &str) {
        match self {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogEncoding {
    Json,
    Console,
}

impl FromStr for LogEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogEncoding::Json),
            "console" => Ok(LogEncoding::Console),
            other => Err(ConfigError::InvalidValue {
                field: "log-encoding",
                value: other.to_string(),
                valid: "json, console",
            }),
        }
    }
}

/// Installs the global tracing subscriber for the process. Must be called
/// exactly once, before any pipeline stage logs.
pub fn init(level: LogLevel, encoding: LogEncoding) {
    let filter = EnvFilter::new(level.as_filter_str());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match encoding {
        LogEncoding::Json => subscriber.json().with_current_span(false).init(),
        LogEncoding::Console => subscriber.init(),
    }
}
