//! Session Bridge - Common Library
//!
//! Runs desktop actions inside the interactive session of a remote Windows
//! host when all the caller holds is a service-session command channel
//! (WinRM or OpenSSH). The bridge uploads an opaque action script in small
//! chunks, schedules a one-shot task bound to the interactive user, polls for
//! the result file, collects diagnostics on timeout and always removes the
//! scheduled task afterwards.

// Use deny instead of forbid to allow specific overrides for env var manipulation
// in tests (env::set_var/remove_var are unsafe in Rust 2024)
#![deny(unsafe_code)]

pub mod action;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod launcher;
pub mod logging;
pub mod mock;
pub mod poller;
pub mod powershell;
#[cfg(unix)]
pub mod ssh;
pub mod transfer;
pub mod types;
pub mod util;
pub mod winrm;

pub use action::{
    ActionField, ActionKind, ActionOutcome, ActionRequest, MalformedResult, OutputArtifact,
    decode_output,
};
pub use bridge::{Bridge, Invocation, InvocationReport, InvocationTimings};
pub use channel::{CommandChannel, CommandResult, connect_channel};
pub use diagnostics::{DiagnosticSection, DiagnosticsBundle};
pub use errors::{
    BridgeError, BridgeStage, ChannelError, ErrorCode, RemoteStepError, ScheduleError,
    ScheduleStep, TimeoutError, UploadError, UploadStep,
};
pub use launcher::{LaunchSpec, ScheduledTaskLauncher, SessionLauncher};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use mock::{MockHost, ScriptKind, TaskBehavior};
pub use poller::PollSettings;
pub use transfer::UploadReport;
pub use types::{
    BridgeConfig, ChannelConfig, InvocationId, RemoteWorkspace, RunAsIdentity, Secret,
    TransportMode,
};

// Config module re-exports
pub use config::{ConfigSource, EnvError, EnvParser, Sourced};
