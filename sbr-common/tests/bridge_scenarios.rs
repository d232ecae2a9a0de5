//! End-to-end bridge scenarios against the in-memory Windows host.

mod common;

use std::sync::Arc;
use std::time::Duration;

use sbr_common::diagnostics::{SECTION_LISTING, SECTION_OUTPUT, SECTION_TASK};
use sbr_common::launcher::SessionLauncher;
use sbr_common::transfer;
use sbr_common::{
    ActionField, ActionKind, ActionOutcome, ActionRequest, Bridge, BridgeConfig, BridgeError,
    BridgeStage, ErrorCode, InvocationId, MockHost, ScheduledTaskLauncher, ScriptKind,
    TaskBehavior, UploadStep,
};
use serde_json::json;

use common::{ACTION_SCRIPT, init_test_logging, invocation, list_windows};

fn bridge(host: &Arc<MockHost>) -> Bridge {
    Bridge::new(host.clone(), BridgeConfig::default())
}

fn windows_behavior() -> TaskBehavior {
    TaskBehavior::Respond(Arc::new(|_input: &str| {
        json!({
            "ok": true,
            "action": "listTopWindows",
            "error": null,
            "data": {"windows": [{"title": "Untitled - Notepad", "handle": 1312}]},
        })
        .to_string()
    }))
}

#[tokio::test(start_paused = true)]
async fn test_list_top_windows_success() {
    init_test_logging();
    crate::test_log!("TEST START: test_list_top_windows_success");

    let host = Arc::new(MockHost::new().with_behavior(windows_behavior()));
    let report = bridge(&host)
        .invoke_with_id(&list_windows(), InvocationId::new("1a2b3c4d"))
        .await
        .expect("invocation should succeed");

    assert_eq!(
        host.file_text(&report.workspace.input).unwrap(),
        r#"{"action":"listTopWindows"}"#
    );
    assert_eq!(
        host.file(&report.workspace.action_script).unwrap(),
        ACTION_SCRIPT.as_bytes()
    );
    match &report.outcome {
        ActionOutcome::Succeeded { artifact } => {
            assert_eq!(artifact.action.as_deref(), Some("listTopWindows"));
            assert_eq!(
                artifact.data,
                Some(json!({"windows": [{"title": "Untitled - Notepad", "handle": 1312}]}))
            );
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(report.task_name, "SBR-UIA-1a2b3c4d");
    assert!(!host.task_exists("SBR-UIA-1a2b3c4d"));
    assert_eq!(host.count(ScriptKind::DiagOutput), 0);

    crate::test_log!("TEST PASS: test_list_top_windows_success");
}

#[tokio::test(start_paused = true)]
async fn test_send_keys_script_failure_is_reported_without_diagnostics() {
    init_test_logging();
    crate::test_log!("TEST START: test_send_keys_script_failure_is_reported_without_diagnostics");

    let host = Arc::new(
        MockHost::new().with_behavior(TaskBehavior::ExitWithoutOutput { exit_code: 1 }),
    );
    let request = ActionRequest::new(ActionKind::SendKeysToWindow)
        .with_field(ActionField::WindowName, Some("Notepad"))
        .unwrap()
        .with_field(ActionField::Keys, Some("Hello{ENTER}"))
        .unwrap();

    let report = bridge(&host)
        .invoke_with_id(&invocation(request), InvocationId::new("5e5e5e5e"))
        .await
        .expect("a failing action is still a completed invocation");

    let input: serde_json::Value =
        serde_json::from_str(&host.file_text(&report.workspace.input).unwrap()).unwrap();
    assert_eq!(
        input,
        json!({"action": "sendKeysToWindow", "windowName": "Notepad", "keys": "Hello{ENTER}"})
    );

    match &report.outcome {
        ActionOutcome::Failed { artifact } => {
            assert!(!artifact.ok);
            assert_eq!(artifact.action, None);
            assert_eq!(artifact.error.as_deref(), Some("uia_run.ps1 exited with 1"));
            assert_eq!(artifact.data, None);
        }
        other => panic!("expected failure artifact, got {other:?}"),
    }
    assert!(!host.task_exists("SBR-UIA-5e5e5e5e"));
    assert_eq!(host.count(ScriptKind::DiagOutput), 0);
    assert_eq!(host.count(ScriptKind::DiagLog), 0);

    crate::test_log!("TEST PASS: test_send_keys_script_failure_is_reported_without_diagnostics");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_collects_diagnostics_and_cleans_up_once() {
    init_test_logging();
    crate::test_log!("TEST START: test_timeout_collects_diagnostics_and_cleans_up_once");

    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::Never));
    let err = bridge(&host)
        .invoke_with_id(
            &list_windows().with_deadline(Duration::from_secs(2)),
            InvocationId::new("deadbeef"),
        )
        .await
        .expect_err("no output should time out");

    assert_eq!(err.stage(), BridgeStage::PollTimeout);
    assert_eq!(err.code(), ErrorCode::PollTimeout);
    let diagnostics = err.diagnostics().expect("timeout carries diagnostics");
    assert!(!diagnostics.is_empty());
    assert!(diagnostics.section(SECTION_OUTPUT).unwrap().starts_with("NO"));
    assert!(diagnostics.section(SECTION_LISTING).unwrap().contains("input.json"));
    assert!(diagnostics.section(SECTION_TASK).unwrap().contains("Running"));
    assert!(
        diagnostics
            .sections
            .iter()
            .any(|s| s.title.starts_with("task log") && s.body.contains("=== START"))
    );
    let rendered = err.to_string();
    assert!(rendered.contains("=== DIAG: output exists ==="));

    // Exactly one delete after the last poll.
    let invocations = host.invocations();
    let last_poll = invocations
        .iter()
        .rposition(|i| i.kind == ScriptKind::ReadOutput)
        .unwrap();
    let deletes_after = invocations[last_poll..]
        .iter()
        .filter(|i| i.kind == ScriptKind::DeleteTask)
        .count();
    assert_eq!(deletes_after, 1);
    assert!(!host.task_exists("SBR-UIA-deadbeef"));

    // A second cleanup of the already-removed task is harmless.
    ScheduledTaskLauncher::new()
        .cleanup(host.as_ref(), "SBR-UIA-deadbeef")
        .await;
    assert!(!host.task_exists("SBR-UIA-deadbeef"));

    crate::test_log!("TEST PASS: test_timeout_collects_diagnostics_and_cleans_up_once");
}

#[tokio::test(start_paused = true)]
async fn test_output_appearing_before_deadline_stops_polling() {
    init_test_logging();

    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::WriteOutput {
        content: r#"{"ok":true,"action":"listTopWindows","error":null,"data":{"windows":[]}}"#
            .to_string(),
        after_polls: 3,
    }));
    let report = bridge(&host).invoke(&list_windows()).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(report.poll_attempts, 4);
    assert_eq!(host.count(ScriptKind::ReadOutput), 4);
    assert_eq!(host.count(ScriptKind::DiagOutput), 0);
    // Three 250 ms sleeps, nothing more.
    assert!(report.timings.wait_ms >= 750 && report.timings.wait_ms < 1000);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_skips_chunks_and_preserves_channel_error() {
    init_test_logging();

    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::echo_success()));
    host.fail_channel(ScriptKind::UploadSetup);

    let err = bridge(&host).invoke(&list_windows()).await.unwrap_err();
    assert_eq!(err.stage(), BridgeStage::Upload);
    assert_eq!(err.code(), ErrorCode::UploadSetupFailed);
    match &err {
        BridgeError::Upload(upload) => {
            assert_eq!(upload.step, UploadStep::Setup);
            assert!(upload.source.channel_error().is_some());
        }
        other => panic!("expected upload error, got {other:?}"),
    }
    assert_eq!(host.count(ScriptKind::UploadChunk), 0);
    assert_eq!(host.count(ScriptKind::CreateTask), 0);
    assert!(host.task_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_chunk_failure_names_position() {
    let host = Arc::new(MockHost::new());
    host.fail_exit_after(ScriptKind::UploadChunk, 5, 1);

    let mut big = list_windows();
    big.action_script = vec![b'x'; 4000];
    let err = bridge(&host).invoke(&big).await.unwrap_err();
    match err {
        BridgeError::Upload(upload) => {
            assert_eq!(upload.step, UploadStep::Chunk { index: 2, total: 3 });
            assert!(upload.to_string().contains("chunk 2 of 3"));
        }
        other => panic!("expected upload error, got {other:?}"),
    }
    assert_eq!(host.count(ScriptKind::UploadChunk), 2);
}

#[tokio::test(start_paused = true)]
async fn test_create_failure_is_schedule_stage() {
    let host = Arc::new(MockHost::new());
    host.fail_exit(ScriptKind::CreateTask, 1);

    let err = bridge(&host).invoke(&list_windows()).await.unwrap_err();
    assert_eq!(err.stage(), BridgeStage::Schedule);
    assert_eq!(err.code(), ErrorCode::ScheduleCreateFailed);
    assert_eq!(host.count(ScriptKind::RunTask), 0);
    assert_eq!(host.count(ScriptKind::ReadOutput), 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_channel_failure_is_fatal() {
    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::Never));
    host.fail_channel_after(ScriptKind::ReadOutput, 2);

    let err = bridge(&host).invoke(&list_windows()).await.unwrap_err();
    assert_eq!(err.stage(), BridgeStage::Poll);
    assert_eq!(err.code(), ErrorCode::PollChannelFailed);
    assert!(err.diagnostics().is_none());
    assert_eq!(host.count(ScriptKind::ReadOutput), 3);
    assert!(host.task_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_garbage_output_is_malformed_not_error() {
    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::write("Exception: oops")));
    let report = bridge(&host).invoke(&list_windows()).await.unwrap();
    match report.outcome {
        ActionOutcome::Malformed(m) => assert_eq!(m.raw, "Exception: oops"),
        other => panic!("expected malformed outcome, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_action_uses_slow_deadline() {
    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::Never));
    let request = ActionRequest::new(ActionKind::OpenOutlookEmail)
        .with_field(ActionField::FolderPath, Some(r"Inbox\RPA"))
        .unwrap();
    let err = bridge(&host).invoke(&invocation(request)).await.unwrap_err();
    match err {
        BridgeError::Timeout(timeout) => {
            assert!(timeout.waited >= Duration::from_secs(180));
            assert!(timeout.waited < Duration::from_secs(181));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_per_invocation_workspaces_run_concurrently() {
    init_test_logging();

    let host = Arc::new(MockHost::new().with_behavior(TaskBehavior::echo_success()));
    let bridge = Bridge::new(
        host.clone(),
        BridgeConfig {
            per_invocation_workspace: true,
            ..BridgeConfig::default()
        },
    );

    let first = list_windows();
    let second = invocation(
        ActionRequest::new(ActionKind::SendKeysToWindow)
            .with_field(ActionField::Keys, Some("^s"))
            .unwrap(),
    );
    let (a, b) = tokio::join!(
        bridge.invoke_with_id(&first, InvocationId::new("aaaa0001")),
        bridge.invoke_with_id(&second, InvocationId::new("bbbb0002")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.workspace.dir, r"C:\Windows\Temp\winrm-uia\aaaa0001");
    assert_eq!(b.workspace.dir, r"C:\Windows\Temp\winrm-uia\bbbb0002");
    assert_eq!(
        a.outcome.artifact().unwrap().action.as_deref(),
        Some("listTopWindows")
    );
    assert_eq!(
        b.outcome.artifact().unwrap().action.as_deref(),
        Some("sendKeysToWindow")
    );
    assert!(host.task_names().is_empty());
}

#[tokio::test]
async fn test_one_megabyte_upload_round_trips() {
    let host = MockHost::new();
    let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i * 31 % 251) as u8).collect();
    let path = r"C:\Windows\Temp\winrm-uia\big.bin";

    let report = transfer::upload(&host, path, &payload, 6000).await.unwrap();

    assert_eq!(host.file(path).unwrap(), payload);
    let encoded_len = payload.len().div_ceil(3) * 4;
    assert_eq!(report.chunks, encoded_len.div_ceil(6000));
    assert_eq!(host.count(ScriptKind::UploadChunk), report.chunks);
    assert_eq!(host.count(ScriptKind::UploadSetup), 1);
}

#[tokio::test]
async fn test_empty_upload_issues_only_setup() {
    let host = MockHost::new();
    let path = r"C:\w\empty.ps1";
    host.put_file(path, b"stale".to_vec());

    let report = transfer::upload(&host, path, &[], 2000).await.unwrap();
    assert_eq!(report.chunks, 0);
    assert_eq!(host.file(path).unwrap(), Vec::<u8>::new());
    assert_eq!(host.count(ScriptKind::UploadChunk), 0);
}
