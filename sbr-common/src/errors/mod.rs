//! Error types and catalog for Session Bridge
//!
//! Every failing stage of an invocation has its own typed error. The umbrella
//! [`BridgeError`] always names the stage that failed and maps to a catalog
//! [`ErrorCode`].
//!
//! Malformed output is deliberately absent here: it is a degraded success
//! carried by [`crate::ActionOutcome::Malformed`].

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::diagnostics::DiagnosticsBundle;
use crate::types::TransportMode;

/// The transport or its authentication handshake could not complete.
///
/// A non-zero exit code is not a `ChannelError`; it is returned in
/// [`crate::CommandResult`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("authentication rejected by {endpoint}: {message}")]
    Auth { endpoint: String, message: String },

    #[error("operation against {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport '{transport}' is not supported: {reason}")]
    UnsupportedTransport {
        transport: TransportMode,
        reason: String,
    },
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connect { .. } => ErrorCode::ChannelConnectFailed,
            Self::Auth { .. } => ErrorCode::ChannelAuthFailed,
            Self::Timeout { .. } => ErrorCode::ChannelTimeout,
            Self::Protocol(_) => ErrorCode::ChannelProtocolError,
            Self::UnsupportedTransport { .. } => ErrorCode::ChannelUnsupportedTransport,
        }
    }
}

/// One remote execution either could not run or exited non-zero.
#[derive(Debug, Error)]
pub enum RemoteStepError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("remote script exited with {exit_code}: {}", stderr_summary(.stderr))]
    Failed { exit_code: i32, stderr: String },
}

impl RemoteStepError {
    /// Underlying channel failure, when that is what went wrong.
    pub fn channel_error(&self) -> Option<&ChannelError> {
        match self {
            Self::Channel(err) => Some(err),
            Self::Failed { .. } => None,
        }
    }
}

fn stderr_summary(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "<no stderr>"
    } else {
        trimmed
    }
}

/// Which remote write of the upload stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum UploadStep {
    /// Creating the parent directory and truncating the target.
    Setup,
    /// Appending chunk `index` (1-based) of `total`.
    Chunk { index: usize, total: usize },
    Input,
    Wrapper,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Chunk { index, total } => write!(f, "chunk {} of {}", index, total),
            Self::Input => write!(f, "input"),
            Self::Wrapper => write!(f, "wrapper"),
        }
    }
}

/// Writing an artifact to the remote workspace failed.
#[derive(Debug, Error)]
#[error("writing {path} failed at {step}: {source}")]
pub struct UploadError {
    pub path: String,
    pub step: UploadStep,
    #[source]
    pub source: RemoteStepError,
}

impl UploadError {
    pub fn new(path: impl Into<String>, step: UploadStep, source: impl Into<RemoteStepError>) -> Self {
        Self {
            path: path.into(),
            step,
            source: source.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self.step {
            UploadStep::Setup => ErrorCode::UploadSetupFailed,
            UploadStep::Chunk { .. } => ErrorCode::UploadChunkFailed,
            UploadStep::Input => ErrorCode::UploadInputFailed,
            UploadStep::Wrapper => ErrorCode::UploadWrapperFailed,
        }
    }
}

/// Which part of the scheduling stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStep {
    /// Local checks before any remote mutation.
    Validate,
    Create,
    Trigger,
}

impl fmt::Display for ScheduleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validate => write!(f, "validate"),
            Self::Create => write!(f, "create"),
            Self::Trigger => write!(f, "trigger"),
        }
    }
}

/// Creating or triggering the session task failed.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("task command for {task_name} is {length} characters (limit {limit})")]
    CommandTooLong {
        task_name: String,
        length: usize,
        limit: usize,
    },

    #[error("invalid task name '{task_name}'")]
    InvalidTaskName { task_name: String },

    #[error("{step} of task {task_name} failed: {source}")]
    Remote {
        task_name: String,
        step: ScheduleStep,
        #[source]
        source: RemoteStepError,
    },
}

impl ScheduleError {
    pub fn step(&self) -> ScheduleStep {
        match self {
            Self::CommandTooLong { .. } | Self::InvalidTaskName { .. } => ScheduleStep::Validate,
            Self::Remote { step, .. } => *step,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self.step() {
            ScheduleStep::Validate => ErrorCode::ScheduleValidationFailed,
            ScheduleStep::Create => ErrorCode::ScheduleCreateFailed,
            ScheduleStep::Trigger => ErrorCode::ScheduleTriggerFailed,
        }
    }
}

/// No output appeared before the deadline.
///
/// The diagnostics bundle is part of the rendered message so it always
/// reaches whoever reads the error.
#[derive(Debug, Error)]
#[error(
    "no output at {output_path} after {:.1}s ({attempts} polls, task {task_name})\n{diagnostics}",
    waited.as_secs_f64()
)]
pub struct TimeoutError {
    pub task_name: String,
    pub output_path: String,
    pub waited: Duration,
    pub attempts: u32,
    pub diagnostics: DiagnosticsBundle,
}

/// Invocation stage named in every user-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeStage {
    Connect,
    Upload,
    Schedule,
    Poll,
    PollTimeout,
    Parse,
}

impl BridgeStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Upload => "upload",
            Self::Schedule => "schedule",
            Self::Poll => "poll",
            Self::PollTimeout => "poll-timeout",
            Self::Parse => "parse",
        }
    }

    /// Process exit code used by the CLI for a failure at this stage.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Connect => 10,
            Self::Upload => 11,
            Self::Schedule => 12,
            Self::Poll => 13,
            Self::PollTimeout => 14,
            Self::Parse => 15,
        }
    }
}

impl fmt::Display for BridgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one bridge invocation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{stage}: {source}")]
    Channel {
        stage: BridgeStage,
        #[source]
        source: ChannelError,
    },

    #[error("upload: {0}")]
    Upload(#[from] UploadError),

    #[error("schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("poll-timeout: {0}")]
    Timeout(#[from] Box<TimeoutError>),

    /// Connectivity check ran but exited non-zero.
    #[error("connect: connectivity check exited with {exit_code}: {}", stderr_summary(.stderr))]
    Check { exit_code: i32, stderr: String },
}

impl From<TimeoutError> for BridgeError {
    fn from(err: TimeoutError) -> Self {
        Self::Timeout(Box::new(err))
    }
}

impl BridgeError {
    pub fn channel(stage: BridgeStage, source: ChannelError) -> Self {
        Self::Channel { stage, source }
    }

    pub fn stage(&self) -> BridgeStage {
        match self {
            Self::Channel { stage, .. } => *stage,
            Self::Upload(_) => BridgeStage::Upload,
            Self::Schedule(_) => BridgeStage::Schedule,
            Self::Timeout(_) => BridgeStage::PollTimeout,
            Self::Check { .. } => BridgeStage::Connect,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Channel {
                stage: BridgeStage::Poll,
                ..
            } => ErrorCode::PollChannelFailed,
            Self::Channel { source, .. } => source.code(),
            Self::Upload(err) => err.code(),
            Self::Schedule(err) => err.code(),
            Self::Timeout(_) => ErrorCode::PollTimeout,
            Self::Check { .. } => ErrorCode::ChannelCheckFailed,
        }
    }

    /// Diagnostics gathered for this failure, if any.
    pub fn diagnostics(&self) -> Option<&DiagnosticsBundle> {
        match self {
            Self::Timeout(err) => Some(&err.diagnostics),
            _ => None,
        }
    }
}
