pub mod logging;

pub use logging::init_test_logging;

#[ctor::ctor]
fn setup() {
    init_test_logging();
}

use sbr_common::{ActionKind, ActionRequest, Invocation, RunAsIdentity, Secret};

/// Stand-in for an opaque UI automation script.
pub const ACTION_SCRIPT: &str = "param([string]$InputJsonPath, [string]$OutputJsonPath)\r\n# drives the desktop\r\n";

pub fn invocation(request: ActionRequest) -> Invocation {
    Invocation::new(
        request,
        ACTION_SCRIPT.as_bytes().to_vec(),
        RunAsIdentity::new(r"LAB\desk", Secret::new("desk-pass")),
    )
}

pub fn list_windows() -> Invocation {
    invocation(ActionRequest::new(ActionKind::ListTopWindows))
}
