//! Structured logging initialization.
//!
//! Console logs go to stderr so stdout stays free for the JSON result.

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, fmt,
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    util::SubscriberInitExt,
};

use crate::config::EnvParser;

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error, off).
    pub level: String,
    pub format: LogFormat,
    /// Optional file path for daily-rotated logs.
    pub file_path: Option<PathBuf>,
    /// Per-target log level overrides.
    pub targets: BTreeMap<String, String>,
    pub with_target: bool,
    pub with_file_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            file_path: None,
            targets: BTreeMap::new(),
            with_target: true,
            with_file_line: false,
        }
    }
}

impl LogConfig {
    /// Build a logging configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - SBR_LOG_LEVEL
    /// - SBR_LOG_FORMAT (pretty|json|compact)
    /// - SBR_LOG_FILE (path to rotating log file)
    /// - SBR_LOG_TARGETS (comma-separated target=level list)
    ///
    /// Invalid values fall back to defaults.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let mut config = Self {
            level: parser.get_log_level("LOG_LEVEL", default_level).value,
            ..Self::default()
        };

        if let Some(format) = parser
            .get_optional_string("LOG_FORMAT")
            .value
            .and_then(|f| LogFormat::parse(&f))
        {
            config.format = format;
        }
        config.file_path = parser.get_optional_path("LOG_FILE").value;
        if let Some(targets) = parser.get_optional_string("LOG_TARGETS").value {
            config.targets = parse_target_overrides(&targets);
        }

        config
    }

    /// Override the base log level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Build the effective EnvFilter, honoring RUST_LOG if set.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some()
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return filter;
        }

        let mut filter = self.level.clone();
        for (target, level) in &self.targets {
            filter.push_str(&format!(",{}={}", target, level));
        }
        EnvFilter::new(filter)
    }
}

/// Keeps the background file writer alive.
pub struct LoggingGuards {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing-based logging for the current process.
///
/// The returned guards must live as long as the program when file logging
/// is enabled. Calling this twice is not an error.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = config.env_filter();
    let (writer, file_guard) = build_writer(config);
    let ansi = file_guard.is_none();

    let builder = fmt::Subscriber::builder()
        .with_writer(writer)
        .with_target(config.with_target)
        .with_file(config.with_file_line)
        .with_line_number(config.with_file_line)
        .with_env_filter(filter);

    match config.format {
        LogFormat::Pretty => finish_subscriber(builder.with_ansi(ansi).pretty().finish(), file_guard),
        LogFormat::Json => finish_subscriber(builder.with_ansi(false).json().finish(), file_guard),
        LogFormat::Compact => {
            finish_subscriber(builder.with_ansi(ansi).compact().finish(), file_guard)
        }
    }
}

fn build_writer(
    config: &LogConfig,
) -> (
    BoxMakeWriter,
    Option<tracing_appender::non_blocking::WorkerGuard>,
) {
    let Some(path) = config.file_path.as_ref() else {
        return (BoxMakeWriter::new(std::io::stderr), None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("sbr.log"));
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let console = BoxMakeWriter::new(std::io::stderr);
    (BoxMakeWriter::new(console.and(non_blocking)), Some(guard))
}

fn finish_subscriber<S>(
    subscriber: S,
    file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
) -> Result<LoggingGuards>
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = subscriber.try_init()
        && !err.to_string().contains("already initialized")
    {
        return Err(err.into());
    }

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

fn parse_target_overrides(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let Some((target, level)) = entry.trim().split_once('=') else {
            continue;
        };
        let target = target.trim();
        let level = level.trim().to_lowercase();
        if target.is_empty() || !is_valid_level(&level) {
            continue;
        }
        map.insert(target.to_string(), level);
    }
    map
}

fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off")
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    #[test]
    fn test_parse_targets() {
        let targets = parse_target_overrides("sbr_common::winrm=trace,reqwest=warn,invalid,x=loud");
        assert_eq!(targets.get("sbr_common::winrm"), Some(&"trace".to_string()));
        assert_eq!(targets.get("reqwest"), Some(&"warn".to_string()));
        assert!(!targets.contains_key("invalid"));
        assert!(!targets.contains_key("x"));
    }

    #[test]
    fn test_env_filter_builds_overrides() {
        let _guard = env_test_lock();
        let mut config = LogConfig::default().with_level("info");
        config
            .targets
            .insert("sbr_common::bridge".to_string(), "debug".to_string());
        let filter_str = format!("{}", config.env_filter());
        assert!(filter_str.contains("info"));
        assert!(filter_str.contains("sbr_common::bridge=debug"));
    }

    #[test]
    fn test_from_env_reads_sbr_variables() {
        let _guard = env_test_lock();
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            std::env::set_var("SBR_LOG_LEVEL", "debug");
            std::env::set_var("SBR_LOG_FORMAT", "json");
            std::env::set_var("SBR_LOG_TARGETS", "sbr_common=trace");
            std::env::remove_var("SBR_LOG_FILE");
        }
        let config = LogConfig::from_env("warn");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.targets.get("sbr_common"), Some(&"trace".to_string()));
        assert!(config.file_path.is_none());

        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            std::env::set_var("SBR_LOG_FORMAT", "fancy");
            std::env::remove_var("SBR_LOG_LEVEL");
            std::env::remove_var("SBR_LOG_TARGETS");
        }
        let config = LogConfig::from_env("warn");
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Compact);
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe { std::env::remove_var("SBR_LOG_FORMAT") };
    }
}
