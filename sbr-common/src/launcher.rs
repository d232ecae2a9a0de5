//! Bridging into the interactive desktop session.
//!
//! [`SessionLauncher`] is the seam: transfer, polling and diagnostics do not
//! care how the wrapper ends up running in the user's session. The only
//! implementation today is [`ScheduledTaskLauncher`], which uses a one-shot
//! Task Scheduler entry flagged to run only in the interactive session.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channel::{CommandChannel, execute_checked};
use crate::errors::{RemoteStepError, ScheduleError, ScheduleStep};
use crate::powershell::{self, POWERSHELL_EXE};
use crate::types::RunAsIdentity;

/// `schtasks /TR` rejects commands longer than this.
pub const MAX_TASK_COMMAND_LEN: usize = 261;

/// What to launch and as whom.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_name: String,
    pub run_as: RunAsIdentity,
    /// Path of the wrapper script on the remote host.
    pub wrapper_path: String,
}

/// Runs a wrapper script inside the interactive session of a user.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace any stale entry, create a fresh one and start it.
    async fn schedule_and_run(
        &self,
        channel: &dyn CommandChannel,
        spec: &LaunchSpec,
    ) -> Result<(), ScheduleError>;

    /// Best-effort stop and removal. Never fails.
    async fn cleanup(&self, channel: &dyn CommandChannel, task_name: &str);

    /// Scheduler's view of the entry, for diagnostics.
    async fn describe(
        &self,
        channel: &dyn CommandChannel,
        task_name: &str,
    ) -> Result<String, RemoteStepError>;
}

/// Task Scheduler (`schtasks.exe`) based launcher.
#[derive(Debug, Clone)]
pub struct ScheduledTaskLauncher {
    powershell_exe: String,
}

impl Default for ScheduledTaskLauncher {
    fn default() -> Self {
        Self {
            powershell_exe: POWERSHELL_EXE.to_string(),
        }
    }
}

impl ScheduledTaskLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `/TR` command string for a wrapper path.
    pub fn task_command(&self, wrapper_path: &str) -> String {
        let file = if wrapper_path.contains(' ') {
            format!("\"{}\"", wrapper_path)
        } else {
            wrapper_path.to_string()
        };
        format!(
            "{} -NoProfile -ExecutionPolicy Bypass -STA -File {}",
            self.powershell_exe, file
        )
    }

    fn validate(&self, spec: &LaunchSpec) -> Result<String, ScheduleError> {
        let valid_name = !spec.task_name.is_empty()
            && spec
                .task_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_name {
            return Err(ScheduleError::InvalidTaskName {
                task_name: spec.task_name.clone(),
            });
        }

        let command = self.task_command(&spec.wrapper_path);
        if command.len() > MAX_TASK_COMMAND_LEN {
            return Err(ScheduleError::CommandTooLong {
                task_name: spec.task_name.clone(),
                length: command.len(),
                limit: MAX_TASK_COMMAND_LEN,
            });
        }
        Ok(command)
    }
}

#[async_trait]
impl SessionLauncher for ScheduledTaskLauncher {
    fn name(&self) -> &'static str {
        "scheduled-task"
    }

    async fn schedule_and_run(
        &self,
        channel: &dyn CommandChannel,
        spec: &LaunchSpec,
    ) -> Result<(), ScheduleError> {
        let command = self.validate(spec)?;
        let task_name = spec.task_name.as_str();

        if let Err(e) = execute_checked(channel, &powershell::delete_task(task_name)).await {
            debug!(task_name, error = %e, "no stale task removed");
        }

        execute_checked(
            channel,
            &powershell::create_task(
                task_name,
                &spec.run_as.user,
                spec.run_as.password.expose(),
                &command,
            ),
        )
        .await
        .map_err(|source| ScheduleError::Remote {
            task_name: task_name.to_string(),
            step: ScheduleStep::Create,
            source,
        })?;
        info!(task_name, run_as = %spec.run_as.user, "task created");

        execute_checked(channel, &powershell::run_task(task_name))
            .await
            .map_err(|source| ScheduleError::Remote {
                task_name: task_name.to_string(),
                step: ScheduleStep::Trigger,
                source,
            })?;
        info!(task_name, "task triggered");
        Ok(())
    }

    async fn cleanup(&self, channel: &dyn CommandChannel, task_name: &str) {
        if let Err(e) = execute_checked(channel, &powershell::end_task(task_name)).await {
            debug!(task_name, error = %e, "end task failed (task may have finished)");
        }
        match execute_checked(channel, &powershell::delete_task(task_name)).await {
            Ok(_) => info!(task_name, "task deleted"),
            Err(e) => warn!(task_name, error = %e, "failed to delete task"),
        }
    }

    async fn describe(
        &self,
        channel: &dyn CommandChannel,
        task_name: &str,
    ) -> Result<String, RemoteStepError> {
        let result = execute_checked(channel, &powershell::query_task(task_name)).await?;
        Ok(result.stdout)
    }
}
