//! Logging setup
//!
//! Drivers and logic modules log through `tracing` with structured fields
//! (`module = %name`, `device = ...`). This module installs the global
//! `tracing-subscriber` from the `[application]` section:
//!
//! ```toml
//! [application]
//! log_level = "info"     # fallback when RUST_LOG is unset
//! log_format = "compact" # pretty, compact or json
//! ```
//!
//! Installing twice is not an error, so tests and embedding frontends can
//! call [`init`] freely.
//!
//! # Example
//! ```no_run
//! use daq_modules::{config::AppConfig, tracing_setup};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//!
//! info!("Modules starting");
//! warn!(device = "lm510", "Level sensor did not answer, retrying");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Shape of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line with colours, for interactive sessions
    Pretty,
    /// One line per event, for long unattended runs
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// What [`init`] installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// Add source file and line to every event
    pub with_location: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_location: false,
        }
    }
}

impl LogSettings {
    /// Level and format from `[application]`.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Self::default()
        })
    }
}

/// Install the subscriber described by `config`'s `[application]` section.
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(LogSettings::from_app_config(config)?)
}

/// Install the global subscriber. A subscriber that is already installed is
/// kept and `Ok(())` returned.
pub fn init(settings: LogSettings) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_ascii_lowercase()));
    let layer = fmt::layer()
        .with_file(settings.with_location)
        .with_line_number(settings.with_location)
        .with_target(false);

    let layer = match settings.format {
        LogFormat::Pretty => layer.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_filter(filter).boxed(),
    };

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
    Ok(())
}

/// Parse a level name, case-insensitive.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn settings_follow_application_section() {
        let app = AppConfig::from_toml_str(
            "[application]\nname = \"Test\"\nlog_level = \"debug\"\nlog_format = \"JSON\"\n",
        )
        .unwrap();
        let settings = LogSettings::from_app_config(&app).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);

        let defaults = AppConfig::from_toml_str("[application]\nname = \"Test\"\n").unwrap();
        assert_eq!(
            LogSettings::from_app_config(&defaults).unwrap(),
            LogSettings::default()
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let app = AppConfig::from_toml_str("[application]\nname = \"T\"\nlog_format = \"xml\"\n").unwrap();
        assert!(LogSettings::from_app_config(&app).is_err());
        assert!(app.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn init_twice_is_ok() {
        assert!(init(LogSettings::default()).is_ok());
        assert!(init(LogSettings {
            level: Level::DEBUG,
            format: LogFormat::Json,
            with_location: true,
        })
        .is_ok());
    }
}
