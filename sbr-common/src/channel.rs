//! Remote command channel abstraction.
//!
//! Every other component talks to the target host through
//! [`CommandChannel::execute`]: one PowerShell script in, exit code plus
//! captured streams out. Each call is a single attempt with no retry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ChannelError, RemoteStepError};
use crate::mock::{MockHost, is_mock_host};
use crate::types::{ChannelConfig, TransportMode};
use crate::util::{mask_sensitive_script, truncate_for_log};

/// Result of a remote command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code of the script.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// Synchronous script execution against one remote host.
///
/// A non-zero exit code is returned in [`CommandResult`]; `Err` means the
/// transport or authentication itself failed.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Human-readable endpoint, used in logs and errors.
    fn endpoint(&self) -> &str;

    /// Run one PowerShell script and wait for it to finish.
    async fn execute(&self, script: &str) -> Result<CommandResult, ChannelError>;
}

/// Longest script or stderr text written to a single log field.
const LOG_TEXT_LIMIT: usize = 2000;

/// Run a script and treat a non-zero exit code as an error.
pub async fn execute_checked(
    channel: &dyn CommandChannel,
    script: &str,
) -> Result<CommandResult, RemoteStepError> {
    debug!(
        endpoint = channel.endpoint(),
        script = %truncate_for_log(&mask_sensitive_script(script), LOG_TEXT_LIMIT),
        "executing remote script"
    );
    let result = channel.execute(script).await?;
    if result.success() {
        Ok(result)
    } else {
        debug!(
            endpoint = channel.endpoint(),
            exit_code = result.exit_code,
            stderr = %truncate_for_log(result.stderr.trim(), LOG_TEXT_LIMIT),
            "remote script failed"
        );
        Err(RemoteStepError::Failed {
            exit_code: result.exit_code,
            stderr: result.stderr,
        })
    }
}

/// Build the channel selected by `config.transport`.
pub async fn connect_channel(config: &ChannelConfig) -> Result<Arc<dyn CommandChannel>, ChannelError> {
    if is_mock_host(&config.host) {
        return Ok(Arc::new(MockHost::from_env(&config.host)));
    }
    match config.transport {
        TransportMode::Basic => Ok(Arc::new(crate::winrm::WinRmChannel::new(config)?)),
        #[cfg(unix)]
        TransportMode::Ssh => Ok(Arc::new(crate::ssh::SshChannel::connect(config).await?)),
        #[cfg(not(unix))]
        TransportMode::Ssh => Err(ChannelError::UnsupportedTransport {
            transport: TransportMode::Ssh,
            reason: "the ssh transport requires a unix client".to_string(),
        }),
    }
}
