//! Run mode selection
//!
//! The gateway has no command line flags. The environment picks the mode,
//! which in turn picks the logging preset.

use std::fmt;

use crate::logging::LogConfig;

/// Environment variable holding the run mode
pub const MODE_ENV: &str = "VTYTOUSB_ENV";

/// Process run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    Development,
    #[default]
    Production,
    Test,
}

impl RunMode {
    /// Read the mode from `VTYTOUSB_ENV`, defaulting to production
    pub fn from_env() -> Self {
        std::env::var(MODE_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    /// Parse a mode name; unknown names fall back to production
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Self::Development,
            "test" => Self::Test,
            _ => Self::Production,
        }
    }

    /// Logging preset for this mode
    pub fn log_config(self) -> LogConfig {
        match self {
            Self::Development => LogConfig::development(),
            Self::Production => LogConfig::production(),
            Self::Test => LogConfig::test(),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}
