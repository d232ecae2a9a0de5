//! Configuration source tracking.
//!
//! Tracks where each configuration value came from so `sbr config` style
//! output and error messages can name the culprit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a configuration value originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default value.
    Default,
    /// TOML config file (`--config` or `~/.config/sbr/config.toml`).
    ConfigFile,
    /// Loaded from `.sbr.env` or `.env`.
    DotEnv,
    /// Environment variable.
    Environment,
    /// Command-line argument (highest precedence).
    CommandLine,
}

impl ConfigSource {
    /// Precedence level; higher wins.
    pub fn precedence(&self) -> u8 {
        match self {
            ConfigSource::Default => 0,
            ConfigSource::ConfigFile => 1,
            ConfigSource::DotEnv => 2,
            ConfigSource::Environment => 3,
            ConfigSource::CommandLine => 4,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ConfigSource::Default => "default",
            ConfigSource::ConfigFile => "config file",
            ConfigSource::DotEnv => ".env file",
            ConfigSource::Environment => "environment",
            ConfigSource::CommandLine => "command line",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A configuration value with its source.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when the value came from the environment.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self {
            value,
            source,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var_name: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var_name.into()),
        }
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, ConfigSource::Default)
    }

    /// Map the value while preserving source.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
        }
    }

    /// Keep whichever value has the higher precedence; ties go to `other`.
    pub fn merge(self, other: Self) -> Self {
        if other.source.precedence() >= self.source.precedence() {
            other
        } else {
            self
        }
    }

    /// Whether anything other than the built-in default supplied the value.
    pub fn is_explicit(&self) -> bool {
        self.source != ConfigSource::Default
    }
}

impl<T: Default> Default for Sourced<T> {
    fn default() -> Self {
        Self::default_value(T::default())
    }
}
