//! OpenSSH command channel for Windows hosts running the OpenSSH server.
//!
//! Authentication uses the local ssh client configuration (agent, keys,
//! `~/.ssh/config`); the channel password is only used as the run-as
//! fallback. The server's default shell is cmd.exe, so the encoded command
//! line must fit its 8191-character limit.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::channel::{CommandChannel, CommandResult};
use crate::errors::ChannelError;
use crate::powershell::powershell_command_line;
use crate::types::ChannelConfig;
use crate::winrm::clean_clixml;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// cmd.exe refuses longer command lines.
pub const MAX_SSH_COMMAND_LEN: usize = 8000;

pub struct SshChannel {
    session: Session,
    endpoint: String,
    command_timeout: Duration,
}

impl SshChannel {
    /// Open a multiplexed session to `user@host:port`.
    pub async fn connect(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let endpoint = format!(
            "ssh://{}@{}:{}",
            config.username,
            config.host,
            config.effective_port()
        );
        let destination = format!("{}@{}", config.username, config.host);
        debug!(endpoint = %endpoint, "connecting via SSH");

        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(CONNECT_TIMEOUT)
            .port(config.effective_port());

        let session = builder
            .connect(&destination)
            .await
            .map_err(|e| classify_connect_error(&endpoint, &e.to_string()))?;

        info!(endpoint = %endpoint, "connected");
        Ok(Self {
            session,
            endpoint,
            command_timeout: config.operation_timeout().max(Duration::from_secs(60)),
        })
    }
}

fn classify_connect_error(endpoint: &str, message: &str) -> ChannelError {
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("host key verification failed") {
        ChannelError::Auth {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    } else {
        ChannelError::Connect {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }
}

/// Reject scripts whose command line cmd.exe would truncate.
fn checked_command_line(script: &str) -> Result<String, ChannelError> {
    let command_line = powershell_command_line(script);
    if command_line.len() > MAX_SSH_COMMAND_LEN {
        return Err(ChannelError::Protocol(format!(
            "encoded command is {} characters, over the {} allowed by the remote shell; lower chunk_size",
            command_line.len(),
            MAX_SSH_COMMAND_LEN
        )));
    }
    Ok(command_line)
}

#[async_trait]
impl CommandChannel for SshChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, script: &str) -> Result<CommandResult, ChannelError> {
        let command_line = checked_command_line(script)?;
        let start = Instant::now();
        let io_error = |e: std::io::Error| ChannelError::Protocol(format!("ssh stream error: {e}"));

        let mut child = self
            .session
            .raw_command(&command_line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| ChannelError::Connect {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;

        let execution = async {
            let stdout_handle = child.stdout().take();
            let stderr_handle = child.stderr().take();

            // Drain both pipes together so neither can fill and stall the child.
            let stdout_fut = async {
                let mut buf = Vec::new();
                if let Some(out) = stdout_handle {
                    BufReader::new(out).read_to_end(&mut buf).await?;
                }
                Ok::<Vec<u8>, std::io::Error>(buf)
            };
            let stderr_fut = async {
                let mut buf = Vec::new();
                if let Some(err) = stderr_handle {
                    BufReader::new(err).read_to_end(&mut buf).await?;
                }
                Ok::<Vec<u8>, std::io::Error>(buf)
            };
            let (stdout, stderr) = tokio::try_join!(stdout_fut, stderr_fut).map_err(io_error)?;

            let status = child.wait().await.map_err(|e| ChannelError::Connect {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;
            Ok::<_, ChannelError>((status, stdout, stderr))
        };

        match tokio::time::timeout(self.command_timeout, execution).await {
            Ok(result) => {
                let (status, stdout, stderr) = result?;
                let duration_ms = start.elapsed().as_millis() as u64;
                let exit_code = status.code().unwrap_or(-1);
                debug!(endpoint = %self.endpoint, exit_code, duration_ms, "ssh command completed");
                Ok(CommandResult {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: clean_clixml(&String::from_utf8_lossy(&stderr)),
                    duration_ms,
                })
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, timeout = ?self.command_timeout, "ssh command timed out");
                Err(ChannelError::Timeout {
                    endpoint: self.endpoint.clone(),
                    timeout: self.command_timeout,
                })
            }
        }
    }
}
