//! Environment variable parsing with type safety.
//!
//! Parses `SBR_` variables with validation, error collection and source
//! tracking. Values from `.env` files sit below the real environment.

use super::source::{ConfigSource, Sourced};
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Secret, TransportMode};

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
    dotenv: HashMap<String, String>,
}

impl EnvParser {
    /// Create a new parser with the SBR_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "SBR_",
            errors: Vec::new(),
            dotenv: HashMap::new(),
        }
    }

    /// Fall back to pairs loaded by [`super::load_dotenv`] for unset variables.
    pub fn with_dotenv(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.dotenv.extend(pairs);
        self
    }

    /// Raw value and where it came from.
    fn lookup(&self, var_name: &str) -> Option<(String, ConfigSource)> {
        match env::var(var_name) {
            Ok(value) => Some((value, ConfigSource::Environment)),
            Err(_) => self
                .dotenv
                .get(var_name)
                .map(|value| (value.clone(), ConfigSource::DotEnv)),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name with prefix.
    pub fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => found(value, source, var_name),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Optional string; unset and empty both read as `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if value.is_empty() => found(None, source, var_name),
            Some((value, source)) => found(Some(value), source, var_name),
            None => Sourced::default_value(None),
        }
    }

    /// Optional credential; never echoed in errors.
    pub fn get_secret(&mut self, name: &str) -> Sourced<Option<Secret>> {
        self.get_optional_string(name).map(|v| v.map(Secret::new))
    }

    /// Boolean with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                found(parsed, source, var_name)
            }
            None => Sourced::default_value(default),
        }
    }

    pub fn get_u16_range(&mut self, name: &str, default: u16, min: u16, max: u16) -> Sourced<u16> {
        self.get_range(name, default, min, max, "unsigned 16-bit integer")
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.get_range(name, default, min, max, "unsigned 32-bit integer")
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        self.get_range(name, default, min, max, "unsigned 64-bit integer")
    }

    pub fn get_usize_range(
        &mut self,
        name: &str,
        default: usize,
        min: usize,
        max: usize,
    ) -> Sourced<usize> {
        self.get_range(name, default, min, max, "unsigned integer")
    }

    fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => match value.trim().parse::<T>() {
                Ok(n) if n >= min && n <= max => found(n, source, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    found(default, source, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Optional human-readable duration such as `90s` or `3m`.
    pub fn get_duration(&mut self, name: &str) -> Sourced<Option<Duration>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if value.trim().is_empty() => found(None, source, var_name),
            Some((value, source)) => match humantime::parse_duration(value.trim()) {
                Ok(duration) => found(Some(duration), source, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(None)
                }
            },
            None => Sourced::default_value(None),
        }
    }

    pub fn get_transport(&mut self, name: &str, default: TransportMode) -> Sourced<TransportMode> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => match value.parse::<TransportMode>() {
                Ok(mode) => found(mode, source, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "basic or ssh".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Path with `~/` expansion.
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if value.is_empty() => found(None, source, var_name),
            Some((value, source)) => found(Some(expand_tilde(&value)), source, var_name),
            None => Sourced::default_value(None),
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        found(lower, source, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        found(default.to_string(), source, var_name)
                    }
                }
            }
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Comma-separated list of strings.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if value.is_empty() => found(Vec::new(), source, var_name),
            Some((value, source)) => {
                let items: Vec<String> = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                found(items, source, var_name)
            }
            None => Sourced::default_value(default),
        }
    }
}

fn found<T>(value: T, source: ConfigSource, var_name: String) -> Sourced<T> {
    Sourced {
        value,
        source,
        env_var: Some(var_name),
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn expand_tilde(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped),
        _ => PathBuf::from(value),
    }
}
