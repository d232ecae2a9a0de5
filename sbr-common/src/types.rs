//! Common types used across session bridge components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::action::ActionKind;

/// Unique identifier for one bridge invocation.
///
/// Used to derive the scheduled task name and, when enabled, a private
/// workspace directory on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl InvocationId {
    /// Generate a fresh 8-hex-digit identifier.
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..8].to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A credential that never shows up in Debug output or logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value. Only call this where the secret is sent.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "Secret(<empty>)")
        } else {
            write!(f, "Secret(***)")
        }
    }
}

/// Authentication mechanism / transport used for the remote command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// WinRM with HTTP Basic authentication.
    #[default]
    Basic,
    /// Windows OpenSSH server running PowerShell.
    Ssh,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Ssh => "ssh",
        }
    }

    /// Whether this mode talks WS-Management.
    pub fn is_winrm(&self) -> bool {
        !matches!(self, Self::Ssh)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "ssh" => Ok(Self::Ssh),
            other @ ("ntlm" | "kerberos" | "negotiate") => Err(format!(
                "transport '{other}' is not supported (use basic over HTTPS, or ssh)"
            )),
            other => Err(format!("unknown transport '{other}' (expected basic or ssh)")),
        }
    }
}

/// Connection settings for the remote command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Target host name or IP address.
    pub host: String,
    /// Explicit port. Defaults depend on transport and TLS.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: TransportMode,
    /// Use HTTPS for WinRM.
    #[serde(default)]
    pub use_ssl: bool,
    /// Validate the server certificate when `use_ssl` is set.
    #[serde(default)]
    pub validate_certs: bool,
    pub username: String,
    #[serde(default)]
    pub password: Secret,
    /// WS-Management operation timeout in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl ChannelConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: Secret) -> Self {
        Self {
            host: host.into(),
            port: None,
            transport: TransportMode::default(),
            use_ssl: false,
            validate_certs: false,
            username: username.into(),
            password,
            operation_timeout_secs: default_operation_timeout(),
        }
    }

    /// Port actually used, honoring transport and TLS defaults.
    pub fn effective_port(&self) -> u16 {
        match (self.port, self.transport, self.use_ssl) {
            (Some(port), _, _) => port,
            (None, TransportMode::Ssh, _) => 22,
            (None, _, true) => 5986,
            (None, _, false) => 5985,
        }
    }

    /// WS-Management endpoint URL.
    pub fn winrm_endpoint(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.effective_port())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Identity the scheduled task runs as inside the interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAsIdentity {
    pub user: String,
    pub password: Secret,
}

impl RunAsIdentity {
    pub fn new(user: impl Into<String>, password: Secret) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    /// Fall back to the channel credentials for whichever part is missing.
    pub fn or_channel(user: Option<String>, password: Option<Secret>, channel: &ChannelConfig) -> Self {
        Self {
            user: user
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| channel.username.clone()),
            password: password
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| channel.password.clone()),
        }
    }
}

/// Bridge behavior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Remote directory holding the invocation artifacts.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Give every invocation its own subdirectory of `workspace_dir`.
    #[serde(default)]
    pub per_invocation_workspace: bool,
    #[serde(default = "default_action_script_name")]
    pub action_script_name: String,
    #[serde(default = "default_wrapper_script_name")]
    pub wrapper_script_name: String,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default = "default_log_name")]
    pub log_name: String,
    /// Scheduled task names are `<prefix>-<invocation id>`.
    #[serde(default = "default_task_name_prefix")]
    pub task_name_prefix: String,
    /// Base64 characters per upload chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for ordinary actions.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
    /// Deadline for actions that start slow desktop applications.
    #[serde(default = "default_slow_deadline_secs")]
    pub slow_deadline_secs: u64,
    /// Lines of the wrapper log included in diagnostics.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            per_invocation_workspace: false,
            action_script_name: default_action_script_name(),
            wrapper_script_name: default_wrapper_script_name(),
            input_name: default_input_name(),
            output_name: default_output_name(),
            log_name: default_log_name(),
            task_name_prefix: default_task_name_prefix(),
            chunk_size: default_chunk_size(),
            poll_interval_ms: default_poll_interval_ms(),
            default_deadline_secs: default_deadline_secs(),
            slow_deadline_secs: default_slow_deadline_secs(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Smallest accepted upload chunk.
pub const MIN_CHUNK_SIZE: usize = 256;
/// Largest accepted upload chunk. The encoded PowerShell command for a chunk
/// must stay below the 32767-character process command line that WinRM
/// uses when it skips the cmd shell.
pub const MAX_CHUNK_SIZE: usize = 6000;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_POLL_INTERVAL_MS: u64 = 500;

impl BridgeConfig {
    /// Clamp values into their supported ranges.
    ///
    /// The chunk size is rounded down to a multiple of 4 so every chunk is a
    /// self-contained base64 quantum that decodes on its own.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE) / 4 * 4;
        self.poll_interval_ms = self
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        self.default_deadline_secs = self.default_deadline_secs.max(1);
        self.slow_deadline_secs = self.slow_deadline_secs.max(self.default_deadline_secs);
        self.log_tail_lines = self.log_tail_lines.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Completion deadline for an action.
    pub fn deadline_for(&self, kind: ActionKind) -> Duration {
        if kind.is_slow() {
            Duration::from_secs(self.slow_deadline_secs)
        } else {
            Duration::from_secs(self.default_deadline_secs)
        }
    }

    pub fn task_name_for(&self, id: &InvocationId) -> String {
        format!("{}-{}", self.task_name_prefix, id)
    }
}

fn default_operation_timeout() -> u64 {
    20
}

fn default_workspace_dir() -> String {
    r"C:\Windows\Temp\winrm-uia".to_string()
}

fn default_action_script_name() -> String {
    "uia_run.ps1".to_string()
}

fn default_wrapper_script_name() -> String {
    "run_task.ps1".to_string()
}

fn default_input_name() -> String {
    "input.json".to_string()
}

fn default_output_name() -> String {
    "output.json".to_string()
}

fn default_log_name() -> String {
    "task.log".to_string()
}

fn default_task_name_prefix() -> String {
    "SBR-UIA".to_string()
}

fn default_chunk_size() -> usize {
    2000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_deadline_secs() -> u64 {
    30
}

fn default_slow_deadline_secs() -> u64 {
    180
}

fn default_log_tail_lines() -> u32 {
    200
}

/// Join Windows path segments with a single backslash.
pub fn windows_join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches(['\\', '/']);
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", dir, name)
    }
}

/// Remote paths for the five artifacts of one invocation.
///
/// Built fresh for every invocation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteWorkspace {
    pub dir: String,
    /// Opaque action script uploaded by the caller.
    pub action_script: String,
    /// Wrapper generated by the bridge; the scheduled task runs this.
    pub wrapper_script: String,
    pub input: String,
    pub output: String,
    pub log: String,
}

impl RemoteWorkspace {
    /// Lay out artifacts inside `dir` using the configured file names.
    pub fn in_dir(dir: impl Into<String>, config: &BridgeConfig) -> Self {
        let dir = dir.into();
        Self {
            action_script: windows_join(&dir, &config.action_script_name),
            wrapper_script: windows_join(&dir, &config.wrapper_script_name),
            input: windows_join(&dir, &config.input_name),
            output: windows_join(&dir, &config.output_name),
            log: windows_join(&dir, &config.log_name),
            dir,
        }
    }

    /// Workspace for a specific invocation.
    pub fn for_invocation(config: &BridgeConfig, id: &InvocationId) -> Self {
        if config.per_invocation_workspace {
            Self::in_dir(windows_join(&config.workspace_dir, id.as_str()), config)
        } else {
            Self::in_dir(config.workspace_dir.clone(), config)
        }
    }

    /// File name of the action script (used in synthesized error messages).
    pub fn action_script_file_name(&self) -> &str {
        self.action_script
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.action_script)
    }
}
