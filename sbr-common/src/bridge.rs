//! Invocation orchestration.
//!
//! One invocation is a fixed sequence of round trips over the command
//! channel: upload the action script, write the input file, write the
//! wrapper, schedule and trigger the session task, poll for the output, and
//! decode it (or collect diagnostics on timeout). The session task is
//! cleaned up after every invocation, whatever the outcome.
//!
//! Invocations sharing a workspace directory must not overlap; callers that
//! need parallelism enable `per_invocation_workspace`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, info, info_span, warn};

use crate::action::{ActionOutcome, ActionRequest, decode_output};
use crate::channel::{CommandChannel, execute_checked};
use crate::diagnostics;
use crate::errors::{BridgeError, BridgeStage, TimeoutError, UploadError, UploadStep};
use crate::launcher::{LaunchSpec, ScheduledTaskLauncher, SessionLauncher};
use crate::poller::{self, PollOutcome, PollSettings};
use crate::powershell;
use crate::transfer::{self, UploadReport};
use crate::types::{BridgeConfig, InvocationId, RemoteWorkspace, RunAsIdentity};

/// Everything needed for one round trip.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request: ActionRequest,
    /// Opaque action script, uploaded verbatim.
    pub action_script: Vec<u8>,
    pub run_as: RunAsIdentity,
    /// Overrides the per-action deadline.
    pub deadline: Option<Duration>,
}

impl Invocation {
    pub fn new(request: ActionRequest, action_script: Vec<u8>, run_as: RunAsIdentity) -> Self {
        Self {
            request,
            action_script,
            run_as,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationTimings {
    pub upload_ms: u64,
    pub schedule_ms: u64,
    pub wait_ms: u64,
    pub total_ms: u64,
}

/// Result of an invocation that produced output.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub invocation_id: InvocationId,
    pub task_name: String,
    pub workspace: RemoteWorkspace,
    pub outcome: ActionOutcome,
    pub upload: UploadReport,
    pub poll_attempts: u32,
    pub timings: InvocationTimings,
}

/// Session bridge bound to one command channel.
pub struct Bridge {
    channel: Arc<dyn CommandChannel>,
    launcher: Arc<dyn SessionLauncher>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(channel: Arc<dyn CommandChannel>, config: BridgeConfig) -> Self {
        Self {
            channel,
            launcher: Arc::new(ScheduledTaskLauncher::new()),
            config: config.normalized(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn SessionLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    /// Connectivity check: returns the identity the channel runs as.
    pub async fn check(&self) -> Result<String, BridgeError> {
        let result = self
            .channel
            .execute(&powershell::whoami())
            .await
            .map_err(|e| BridgeError::channel(BridgeStage::Connect, e))?;
        if !result.success() {
            return Err(BridgeError::Check {
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        let identity = result.stdout.trim().to_string();
        info!(endpoint = self.channel.endpoint(), identity = %identity, "connectivity check passed");
        Ok(identity)
    }

    /// Run one invocation with a fresh identifier.
    pub async fn invoke(&self, invocation: &Invocation) -> Result<InvocationReport, BridgeError> {
        self.invoke_with_id(invocation, InvocationId::generate()).await
    }

    pub async fn invoke_with_id(
        &self,
        invocation: &Invocation,
        id: InvocationId,
    ) -> Result<InvocationReport, BridgeError> {
        let workspace = RemoteWorkspace::for_invocation(&self.config, &id);
        let task_name = self.config.task_name_for(&id);
        let span = info_span!(
            "invocation",
            id = %id,
            action = %invocation.request.action,
            task = %task_name
        );

        async {
            let result = self.run_stages(invocation, &id, &workspace, &task_name).await;
            self.launcher
                .cleanup(self.channel.as_ref(), &task_name)
                .await;
            match &result {
                Ok(report) => info!(
                    total_ms = report.timings.total_ms,
                    success = report.outcome.is_success(),
                    "invocation finished"
                ),
                Err(e) => warn!(stage = %e.stage(), code = %e.code().code_string(), "invocation failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        invocation: &Invocation,
        id: &InvocationId,
        workspace: &RemoteWorkspace,
        task_name: &str,
    ) -> Result<InvocationReport, BridgeError> {
        let channel = self.channel.as_ref();
        let start = Instant::now();

        info!(path = %workspace.action_script, "stage: upload");
        let upload = transfer::upload(
            channel,
            &workspace.action_script,
            &invocation.action_script,
            self.config.chunk_size,
        )
        .await?;

        let input = invocation.request.encode();
        execute_checked(channel, &powershell::write_input(workspace, &input))
            .await
            .map_err(|e| UploadError::new(&workspace.input, UploadStep::Input, e))?;

        execute_checked(
            channel,
            &powershell::write_text_file(
                &workspace.wrapper_script,
                &powershell::wrapper_script(workspace),
            ),
        )
        .await
        .map_err(|e| UploadError::new(&workspace.wrapper_script, UploadStep::Wrapper, e))?;
        let upload_ms = start.elapsed().as_millis() as u64;

        info!(launcher = self.launcher.name(), "stage: schedule");
        let schedule_start = Instant::now();
        let spec = LaunchSpec {
            task_name: task_name.to_string(),
            run_as: invocation.run_as.clone(),
            wrapper_path: workspace.wrapper_script.clone(),
        };
        self.launcher.schedule_and_run(channel, &spec).await?;
        let schedule_ms = schedule_start.elapsed().as_millis() as u64;

        let settings = PollSettings::new(
            self.config.poll_interval(),
            invocation
                .deadline
                .unwrap_or_else(|| self.config.deadline_for(invocation.request.action)),
        );
        info!(deadline_secs = settings.deadline.as_secs_f64(), "stage: poll");
        let polled = poller::await_output(channel, &workspace.output, settings)
            .await
            .map_err(|e| BridgeError::channel(BridgeStage::Poll, e))?;

        match polled {
            PollOutcome::Ready {
                content,
                waited,
                attempts,
            } => {
                let outcome = decode_output(&content);
                if let ActionOutcome::Malformed(m) = &outcome {
                    warn!(stage = %BridgeStage::Parse, reason = %m.reason, "output is not well-formed");
                }
                Ok(InvocationReport {
                    invocation_id: id.clone(),
                    task_name: task_name.to_string(),
                    workspace: workspace.clone(),
                    outcome,
                    upload,
                    poll_attempts: attempts,
                    timings: InvocationTimings {
                        upload_ms,
                        schedule_ms,
                        wait_ms: waited.as_millis() as u64,
                        total_ms: start.elapsed().as_millis() as u64,
                    },
                })
            }
            PollOutcome::DeadlineExceeded { waited, attempts } => {
                warn!(waited_ms = waited.as_millis() as u64, attempts, "no output before deadline");
                let diagnostics = diagnostics::collect(
                    channel,
                    self.launcher.as_ref(),
                    workspace,
                    task_name,
                    self.config.log_tail_lines,
                )
                .await;
                Err(TimeoutError {
                    task_name: task_name.to_string(),
                    output_path: workspace.output.clone(),
                    waited,
                    attempts,
                    diagnostics,
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::mock::{MockHost, ScriptKind, TaskBehavior};
    use crate::types::Secret;

    fn invocation() -> Invocation {
        Invocation::new(
            ActionRequest::new(ActionKind::ListTopWindows),
            b"param($InputJsonPath, $OutputJsonPath)\n".to_vec(),
            RunAsIdentity::new(r"DOMAIN\desk", Secret::new("pw")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_success_path() {
        let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::echo_success()));
        let bridge = Bridge::new(host.clone(), BridgeConfig::default());
        let report = bridge
            .invoke_with_id(&invocation(), InvocationId::new("00c0ffee"))
            .await
            .unwrap();

        assert!(report.outcome.is_success());
        assert_eq!(report.task_name, "SBR-UIA-00c0ffee");
        assert_eq!(report.poll_attempts, 1);
        assert_eq!(
            host.file_text(&report.workspace.input).unwrap(),
            r#"{"action":"listTopWindows"}"#
        );
        assert!(!host.task_exists("SBR-UIA-00c0ffee"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_returns_identity() {
        let host = Arc::new(MockHost::new());
        let bridge = Bridge::new(host, BridgeConfig::default());
        assert_eq!(bridge.check().await.unwrap(), r"winhost\operator");
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_maps_channel_failure_to_connect_stage() {
        let host = Arc::new(MockHost::new());
        host.fail_channel(ScriptKind::Whoami);
        let err = Bridge::new(host, BridgeConfig::default()).check().await.unwrap_err();
        assert_eq!(err.stage(), BridgeStage::Connect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_is_normalized() {
        let host = Arc::new(MockHost::new());
        let bridge = Bridge::new(
            host,
            BridgeConfig {
                chunk_size: 3,
                ..BridgeConfig::default()
            },
        );
        assert_eq!(bridge.config().chunk_size, 256);
    }
}
