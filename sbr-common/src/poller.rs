//! Completion polling for the output artifact.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::CommandChannel;
use crate::errors::ChannelError;
use crate::powershell;

/// Poll cadence and deadline for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// How polling ended without a channel failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Non-empty output content, trimmed.
    Ready {
        content: String,
        waited: Duration,
        attempts: u32,
    },
    DeadlineExceeded { waited: Duration, attempts: u32 },
}

/// Wait for `output_path` to exist with non-empty content.
///
/// Returns as soon as a poll sees content. Sleeps `interval` between polls,
/// shortened so the final poll happens at the deadline, and never polls
/// after it. A poll that exits non-zero counts as "not yet"; a channel
/// failure ends polling immediately.
pub async fn await_output(
    channel: &dyn CommandChannel,
    output_path: &str,
    settings: PollSettings,
) -> Result<PollOutcome, ChannelError> {
    let start = Instant::now();
    let deadline = start + settings.deadline;
    let script = powershell::read_if_exists(output_path);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let result = channel.execute(&script).await?;
        if result.success() {
            let content = result.stdout.trim();
            if !content.is_empty() {
                let waited = start.elapsed();
                info!(
                    output_path,
                    attempts,
                    waited_ms = waited.as_millis() as u64,
                    "output ready"
                );
                return Ok(PollOutcome::Ready {
                    content: content.to_string(),
                    waited,
                    attempts,
                });
            }
        } else {
            debug!(
                output_path,
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "poll read failed, retrying"
            );
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::DeadlineExceeded {
                waited: now - start,
                attempts,
            });
        }
        tokio::time::sleep(settings.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHost, ScriptKind};

    const OUT: &str = r"C:\w\output.json";

    fn settings(deadline_secs: u64) -> PollSettings {
        PollSettings::new(Duration::from_millis(250), Duration::from_secs(deadline_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_output_present() {
        let host = MockHost::new();
        host.put_file(OUT, br#"{"ok":true}"#.to_vec());
        let outcome = await_output(&host, OUT, settings(30)).await.unwrap();
        match outcome {
            PollOutcome::Ready { content, attempts, .. } => {
                assert_eq!(content, r#"{"ok":true}"#);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_polling() {
        let host = MockHost::new();
        let outcome = await_output(&host, OUT, settings(30)).await.unwrap();
        match outcome {
            PollOutcome::DeadlineExceeded { waited, attempts } => {
                assert!(waited >= Duration::from_secs(30));
                assert!(waited < Duration::from_secs(30) + Duration::from_millis(250));
                // One poll at t=0 plus one per interval up to and including the deadline.
                assert_eq!(attempts, 121);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(host.count(ScriptKind::ReadOutput), 121);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_is_not_ready() {
        let host = MockHost::new();
        host.put_file(OUT, b"  \r\n".to_vec());
        let outcome = await_output(&host, OUT, settings(1)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_poll_is_retried() {
        let host = MockHost::new();
        host.fail_exit(ScriptKind::ReadOutput, 1);
        let outcome = await_output(&host, OUT, settings(1)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::DeadlineExceeded { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_is_fatal() {
        let host = MockHost::new();
        host.fail_channel(ScriptKind::ReadOutput);
        let err = await_output(&host, OUT, settings(30)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect { .. }));
        assert_eq!(host.count(ScriptKind::ReadOutput), 1);
    }
}
