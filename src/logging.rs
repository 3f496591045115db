//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; applications embedding it
//! call [`init`] once to install a subscriber.
//!
//! ## Environment Variables
//!
//! - `ORCHESTRA_RPC_LOG` or `RUST_LOG`: log filter (e.g. `orchestra_rpc=debug,warn`)
//! - `ORCHESTRA_RPC_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)

use anyhow::{Result, anyhow};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const DEFAULT_FILTER: &str = "orchestra_rpc=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// For log aggregation
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive), falling back to pretty.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file/line
    pub with_file: bool,
    pub with_thread_ids: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
            with_spans: false,
            with_file: false,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let filter = std::env::var("ORCHESTRA_RPC_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var("ORCHESTRA_RPC_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    pub fn debug() -> Self {
        Self {
            filter: "orchestra_rpc=debug,info".to_string(),
            with_file: true,
            ..Default::default()
        }
    }

    /// JSON output with span events, for agents running unattended.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            with_spans: true,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed or the
/// filter does not parse.
pub fn try_init(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| anyhow!("invalid log filter {:?}: {}", config.filter, e))?;

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_file(config.with_file)
                    .with_line_number(config.with_file)
                    .with_thread_ids(config.with_thread_ids)
                    .with_target(config.with_target),
            ),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_file(config.with_file)
                    .with_line_number(config.with_file)
                    .with_thread_ids(config.with_thread_ids)
                    .with_target(config.with_target),
            ),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_file(config.with_file)
                    .with_line_number(config.with_file)
                    .with_thread_ids(config.with_thread_ids)
                    .with_target(config.with_target),
            ),
        ),
    };
    result.map_err(|e| anyhow!("logging already initialised: {}", e))
}

/// Install the global subscriber. Subsequent calls are ignored, and an
/// unparseable filter falls back to the default one.
pub fn init(config: LogConfig) {
    let config = if EnvFilter::try_new(&config.filter).is_ok() {
        config
    } else {
        LogConfig {
            filter: DEFAULT_FILTER.to_string(),
            ..config
        }
    };
    let _ = try_init(config);
}

pub fn init_from_env() {
    init(LogConfig::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_presets() {
        assert!(LogConfig::debug().filter.contains("debug"));
        assert!(LogConfig::debug().with_file);
        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert!(prod.with_spans);
        assert_eq!(prod.filter, DEFAULT_FILTER);
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let config = LogConfig {
            filter: "orchestra_rpc=notalevel".to_string(),
            ..Default::default()
        };
        assert!(try_init(config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LogConfig::default());
        init(LogConfig::default());
        assert!(try_init(LogConfig::default()).is_err());
    }
}
