//! Configuration loading for the sbr CLI.
//!
//! Precedence, lowest first: built-in defaults, TOML config file, `.sbr.env`
//! / `.env`, environment, command line.

use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use sbr_common::action::ActionError;
use sbr_common::config::load_dotenv;
use sbr_common::mock::is_mock_host;
use sbr_common::types::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use sbr_common::{
    BridgeConfig, ChannelConfig, ConfigSource, EnvError, EnvParser, ErrorCode, RunAsIdentity,
    Secret, Sourced, TransportMode,
};

/// Local configuration problems, reported before anything touches the host.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load .env files: {0:#}")]
    DotEnv(anyhow::Error),

    #[error("invalid environment:\n{}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("no target host configured (use --host or SBR_HOST)")]
    MissingHost,

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("no action script configured (use --script or SBR_ACTION_SCRIPT)")]
    NoActionScript,

    #[error("cannot read action script {}: {source}", path.display())]
    ActionScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } | Self::DotEnv(_) => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
            Self::MissingHost => ErrorCode::ConfigMissingHost,
            Self::MissingCredentials(_) => ErrorCode::ConfigMissingCredentials,
            Self::NoActionScript | Self::ActionScript { .. } => ErrorCode::ActionScriptNotFound,
            Self::Action(_) => ErrorCode::InvalidActionField,
        }
    }
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[channel]` table of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileChannel {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: Option<TransportMode>,
    pub use_ssl: Option<bool>,
    pub validate_certs: Option<bool>,
    pub user: Option<String>,
    pub password: Option<Secret>,
    pub operation_timeout_secs: Option<u64>,
}

/// `[run_as]` table of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileRunAs {
    pub user: Option<String>,
    pub password: Option<Secret>,
}

/// On-disk configuration (`~/.config/sbr/config.toml` or `--config`).
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Path to the action script, relative to the working directory.
    pub action_script: Option<PathBuf>,
    pub channel: FileChannel,
    pub run_as: FileRunAs,
    pub bridge: BridgeConfig,
    /// Keys written under `[bridge]`, so defaults filled in by serde are not
    /// reported as coming from the file.
    #[serde(skip)]
    pub bridge_keys: HashSet<String>,
}

impl FileConfig {
    /// Parse file content, remembering which `[bridge]` keys it sets.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: FileConfig = toml::from_str(content)?;
        let table: toml::Table = toml::from_str(content)?;
        if let Some(bridge) = table.get("bridge").and_then(toml::Value::as_table) {
            config.bridge_keys = bridge.keys().cloned().collect();
        }
        Ok(config)
    }

    fn sets_bridge(&self, key: &str) -> bool {
        self.bridge_keys.contains(key)
    }
}

/// Get the user config directory.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sbr"))
}

/// Load a config file. An explicit path must exist; the user default may not.
pub fn load_file(explicit: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>, ConfigError> {
    let path = match explicit {
        Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
        Some(path) => path.to_path_buf(),
        None => match config_dir().map(|dir| dir.join("config.toml")) {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    debug!("Loading config from {:?}", path);
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = FileConfig::parse(&content).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    Ok(Some((path, config)))
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: Option<TransportMode>,
    pub use_ssl: Option<bool>,
    pub validate_certs: Option<bool>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub run_as_user: Option<String>,
    pub run_as_password: Option<String>,
    pub action_script: Option<PathBuf>,
    pub workspace_dir: Option<String>,
    pub per_invocation_workspace: Option<bool>,
    pub chunk_size: Option<usize>,
    pub deadline: Option<Duration>,
}

/// One row of `sbr config show --sources`.
#[derive(Debug, Clone)]
pub struct SettingEntry {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
    pub env_var: Option<String>,
}

/// Fully resolved settings for one CLI run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub channel: ChannelConfig,
    pub run_as_user: Option<String>,
    pub run_as_password: Option<Secret>,
    pub bridge: BridgeConfig,
    pub action_script: Option<PathBuf>,
    /// Deadline override for this invocation.
    pub deadline: Option<Duration>,
    pub config_file: Option<PathBuf>,
    pub entries: Vec<SettingEntry>,
}

/// Stack the layers for one value.
fn pick<T>(default: T, file: Option<T>, env: Sourced<Option<T>>, cli: Option<T>) -> Sourced<T> {
    let mut value = Sourced::default_value(default);
    if let Some(v) = file {
        value = value.merge(Sourced::new(v, ConfigSource::ConfigFile));
    }
    if let Sourced {
        value: Some(v),
        source,
        env_var,
    } = env
    {
        value = value.merge(Sourced {
            value: v,
            source,
            env_var,
        });
    }
    if let Some(v) = cli {
        value = value.merge(Sourced::new(v, ConfigSource::CommandLine));
    }
    value
}

/// Treat a defaulted env lookup as "not set".
fn explicit<T>(sourced: Sourced<T>) -> Sourced<Option<T>> {
    if sourced.is_explicit() {
        sourced.map(Some)
    } else {
        Sourced::default_value(None)
    }
}

/// File value only when the file actually sets the key.
fn from_file<T>(value: T, present: bool) -> Option<T> {
    present.then_some(value)
}

struct Recorder(Vec<SettingEntry>);

impl Recorder {
    fn record<T>(&mut self, key: &'static str, sourced: Sourced<T>, render: impl Fn(&T) -> String) -> T {
        self.0.push(SettingEntry {
            key,
            value: render(&sourced.value),
            source: sourced.source,
            env_var: sourced.env_var,
        });
        sourced.value
    }
}

fn show_secret(secret: &Option<Secret>) -> String {
    match secret {
        Some(s) if !s.is_empty() => "********".to_string(),
        _ => "<unset>".to_string(),
    }
}

fn show_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<unset>".to_string())
}

impl Settings {
    /// Resolve every layer from the process environment and `dotenv_dir`.
    pub fn resolve(overrides: &Overrides, dotenv_dir: &Path) -> Result<Self, ConfigError> {
        let dotenv = load_dotenv(dotenv_dir).map_err(ConfigError::DotEnv)?;
        let mut parser = EnvParser::new().with_dotenv(dotenv);

        let config_path = pick(
            None,
            None,
            parser.get_optional_path("CONFIG").map(|p| p.map(Some)),
            overrides.config.clone().map(Some),
        )
        .value;
        let (config_file, file) = match load_file(config_path.as_deref())? {
            Some((path, file)) => (Some(path), file),
            None => (None, FileConfig::default()),
        };
        let defaults = BridgeConfig::default();
        let mut rec = Recorder(Vec::new());

        let host = rec.record(
            "channel.host",
            pick(
                None,
                file.channel.host.map(Some),
                parser.get_optional_string("HOST").map(|v| v.map(Some)),
                overrides.host.clone().map(Some),
            ),
            show_opt,
        );
        let port = rec.record(
            "channel.port",
            pick(
                None,
                file.channel.port.map(Some),
                explicit(parser.get_u16_range("PORT", 5985, 1, u16::MAX)).map(|v| v.map(Some)),
                overrides.port.map(Some),
            ),
            show_opt,
        );
        let transport = rec.record(
            "channel.transport",
            pick(
                TransportMode::default(),
                file.channel.transport,
                explicit(parser.get_transport("TRANSPORT", TransportMode::default())),
                overrides.transport,
            ),
            ToString::to_string,
        );
        let use_ssl = rec.record(
            "channel.use_ssl",
            pick(
                false,
                file.channel.use_ssl,
                explicit(parser.get_bool("USE_SSL", false)),
                overrides.use_ssl,
            ),
            ToString::to_string,
        );
        let validate_certs = rec.record(
            "channel.validate_certs",
            pick(
                false,
                file.channel.validate_certs,
                explicit(parser.get_bool("VALIDATE_CERTS", false)),
                overrides.validate_certs,
            ),
            ToString::to_string,
        );
        let operation_timeout_secs = rec.record(
            "channel.operation_timeout_secs",
            pick(
                20,
                file.channel.operation_timeout_secs,
                explicit(parser.get_u64_range("OPERATION_TIMEOUT_SECS", 20, 1, 3600)),
                None,
            ),
            ToString::to_string,
        );
        let user = rec.record(
            "channel.user",
            pick(
                None,
                file.channel.user.map(Some),
                parser.get_optional_string("USER").map(|v| v.map(Some)),
                overrides.user.clone().map(Some),
            ),
            show_opt,
        );
        let password = rec.record(
            "channel.password",
            pick(
                None,
                file.channel.password.map(Some),
                parser.get_secret("PASSWORD").map(|v| v.map(Some)),
                overrides.password.clone().map(|p| Some(Secret::new(p))),
            ),
            show_secret,
        );
        let run_as_user = rec.record(
            "run_as.user",
            pick(
                None,
                file.run_as.user.map(Some),
                parser.get_optional_string("RUN_AS_USER").map(|v| v.map(Some)),
                overrides.run_as_user.clone().map(Some),
            ),
            show_opt,
        );
        let run_as_password = rec.record(
            "run_as.password",
            pick(
                None,
                file.run_as.password.map(Some),
                parser.get_secret("RUN_AS_PASSWORD").map(|v| v.map(Some)),
                overrides.run_as_password.clone().map(|p| Some(Secret::new(p))),
            ),
            show_secret,
        );
        let action_script = rec.record(
            "action_script",
            pick(
                None,
                file.action_script.map(Some),
                parser.get_optional_path("ACTION_SCRIPT").map(|v| v.map(Some)),
                overrides.action_script.clone().map(Some),
            ),
            |p| show_opt(&p.as_ref().map(|p| p.display())),
        );

        let mut bridge = file.bridge;
        bridge.workspace_dir = rec.record(
            "bridge.workspace_dir",
            pick(
                defaults.workspace_dir.clone(),
                from_file(bridge.workspace_dir.clone(), file.bridge_keys.contains("workspace_dir")),
                parser.get_optional_string("WORKSPACE_DIR"),
                overrides.workspace_dir.clone(),
            ),
            Clone::clone,
        );
        bridge.per_invocation_workspace = rec.record(
            "bridge.per_invocation_workspace",
            pick(
                defaults.per_invocation_workspace,
                from_file(
                    bridge.per_invocation_workspace,
                    file.bridge_keys.contains("per_invocation_workspace"),
                ),
                explicit(parser.get_bool("PER_INVOCATION_WORKSPACE", false)),
                overrides.per_invocation_workspace,
            ),
            ToString::to_string,
        );
        bridge.chunk_size = rec.record(
            "bridge.chunk_size",
            pick(
                defaults.chunk_size,
                from_file(bridge.chunk_size, file.bridge_keys.contains("chunk_size")),
                explicit(parser.get_usize_range(
                    "CHUNK_SIZE",
                    defaults.chunk_size,
                    MIN_CHUNK_SIZE,
                    MAX_CHUNK_SIZE,
                )),
                overrides.chunk_size,
            ),
            ToString::to_string,
        );
        let deadline = rec.record(
            "deadline",
            pick(
                None,
                None,
                parser.get_duration("DEADLINE").map(|v| v.map(Some)),
                overrides.deadline.map(Some),
            ),
            |d| {
                d.map(|d| humantime::format_duration(d).to_string())
                    .unwrap_or_else(|| "<per action>".to_string())
            },
        );

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        let mut channel = ChannelConfig::new(
            host.unwrap_or_default(),
            user.unwrap_or_default(),
            password.unwrap_or_default(),
        );
        channel.port = port;
        channel.transport = transport;
        channel.use_ssl = use_ssl;
        channel.validate_certs = validate_certs;
        channel.operation_timeout_secs = operation_timeout_secs;

        Ok(Self {
            channel,
            run_as_user,
            run_as_password,
            bridge: bridge.normalized(),
            action_script,
            deadline,
            config_file,
            entries: rec.0,
        })
    }

    pub fn is_mock(&self) -> bool {
        is_mock_host(&self.channel.host)
    }

    /// Ensure a host and usable credentials, prompting for a password when
    /// `interactive` is set and stdin is a terminal.
    pub fn require_credentials(&mut self, interactive: bool) -> Result<(), ConfigError> {
        if self.channel.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.is_mock() {
            return Ok(());
        }
        if self.channel.username.trim().is_empty() {
            return Err(ConfigError::MissingCredentials(
                "no user configured (use --user or SBR_USER)".to_string(),
            ));
        }
        // OpenSSH authenticates with keys; the password only feeds the run-as fallback.
        let needs_channel_password = self.channel.transport.is_winrm()
            || self.run_as_password.as_ref().is_none_or(Secret::is_empty);
        if needs_channel_password && self.channel.password.is_empty() {
            let user = self.channel.username.clone();
            self.channel.password = prompt_password(&user, interactive)?;
        }
        Ok(())
    }

    /// Run-as identity, falling back to the channel credentials.
    pub fn run_as(&self) -> RunAsIdentity {
        RunAsIdentity::or_channel(
            self.run_as_user.clone(),
            self.run_as_password.clone(),
            &self.channel,
        )
    }

    /// Read the action script named by the configuration.
    pub fn read_action_script(&self) -> Result<Vec<u8>, ConfigError> {
        let path = self.action_script.as_ref().ok_or(ConfigError::NoActionScript)?;
        std::fs::read(path).map_err(|source| ConfigError::ActionScript {
            path: path.clone(),
            source,
        })
    }
}

fn prompt_password(user: &str, interactive: bool) -> Result<Secret, ConfigError> {
    if !interactive || !std::io::stdin().is_terminal() {
        return Err(ConfigError::MissingCredentials(format!(
            "no password for {user} (use --password or SBR_PASSWORD)"
        )));
    }
    dialoguer::Password::new()
        .with_prompt(format!("Password for {user}"))
        .interact()
        .map(Secret::new)
        .map_err(|e| ConfigError::MissingCredentials(format!("password prompt failed: {e}")))
}

/// Example config file written by `sbr config init`.
pub fn example_config() -> String {
    r#"# sbr configuration
# Values here are overridden by .env files, SBR_* variables and flags.

action_script = "uia_run.ps1"

[channel]
host = "10.0.0.42"
# port = 5985
transport = "basic"   # basic | ssh
use_ssl = false
validate_certs = false
user = "LAB\\operator"
# password = "..."     # prefer SBR_PASSWORD or the interactive prompt

[run_as]
# user = "LAB\\desk"   # defaults to channel.user
# password = "..."     # defaults to channel.password

[bridge]
workspace_dir = 'C:\Windows\Temp\winrm-uia'
per_invocation_workspace = false
chunk_size = 2000
poll_interval_ms = 250
default_deadline_secs = 30
slow_deadline_secs = 180
"#
    .to_string()
}
