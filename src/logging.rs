// 📝 Logging - tracing subscriber setup for the CLI
//
// Environment:
// - LOG_LEVEL: trace, debug, info, warn, error (default info)
// - LOG_FORMAT: text or json (default text)
// - LOG_FILTER: extra directives, e.g. "account_import::sink=debug"

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines on stderr
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Comma-separated EnvFilter directives added on top of `level`
    pub filter_directives: Option<String>,
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(level) = lookup("LOG_LEVEL") {
            config.level = level.parse()?;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(filter) = lookup("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }

        Ok(config)
    }

    /// `from_env`, falling back to the defaults when a variable is invalid.
    /// `on_invalid` gets the error, since no subscriber is installed yet.
    pub fn from_env_or_default(on_invalid: impl FnOnce(&anyhow::Error)) -> Self {
        Self::from_lookup_or_default(|key| std::env::var(key).ok(), on_invalid)
    }

    pub fn from_lookup_or_default(
        lookup: impl Fn(&str) -> Option<String>,
        on_invalid: impl FnOnce(&anyhow::Error),
    ) -> Self {
        Self::from_lookup(lookup).unwrap_or_else(|e| {
            on_invalid(&e);
            Self::default()
        })
    }

    pub fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::new(self.level.to_string());

        if let Some(ref directives) = self.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                filter = filter.add_directive(
                    directive
                        .parse()
                        .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
                );
            }
        }

        Ok(filter)
    }
}

/// Install the global subscriber. Call once, at startup.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = LogConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.filter_directives.is_none());
    }

    #[test]
    fn test_reads_level_format_and_filter() {
        let config = LogConfig::from_lookup(lookup(&[
            ("LOG_LEVEL", "WARNING"),
            ("LOG_FORMAT", "json"),
            ("LOG_FILTER", "account_import::sink=debug, rusqlite=warn"),
        ]))
        .unwrap();

        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(LogConfig::from_lookup(lookup(&[("LOG_LEVEL", "loud")])).is_err());
        assert!(LogConfig::from_lookup(lookup(&[("LOG_FORMAT", "xml")])).is_err());

        let config = LogConfig {
            filter_directives: Some("account_import=loudest".to_string()),
            ..LogConfig::default()
        };
        assert!(config.env_filter().is_err());
    }

    #[test]
    fn test_invalid_environment_falls_back_with_warning() {
        let mut warnings = Vec::new();
        let config = LogConfig::from_lookup_or_default(
            lookup(&[("LOG_LEVEL", "verbose"), ("LOG_FORMAT", "json")]),
            |e| warnings.push(e.to_string()),
        );

        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("verbose"), "{}", warnings[0]);

        let mut called = false;
        let config = LogConfig::from_lookup_or_default(lookup(&[("LOG_LEVEL", "debug")]), |_| called = true);
        assert_eq!(config.level, LogLevel::Debug);
        assert!(!called);
    }
}
