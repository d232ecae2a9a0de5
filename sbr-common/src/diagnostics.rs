//! Best-effort evidence collection after a timeout.
//!
//! Every query is read-only and independent. A failing query contributes
//! placeholder text instead of an error, so the timeout is never masked.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::channel::{CommandChannel, execute_checked};
use crate::launcher::SessionLauncher;
use crate::powershell;
use crate::types::RemoteWorkspace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSection {
    pub title: String,
    pub body: String,
}

/// Unstructured on-host evidence attached to a timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsBundle {
    pub sections: Vec<DiagnosticSection>,
}

impl DiagnosticsBundle {
    pub fn push(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.sections.push(DiagnosticSection {
            title: title.into(),
            body: body.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.title == title)
            .map(|s| s.body.as_str())
    }
}

impl fmt::Display for DiagnosticsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f, "=== DIAG: {} ===", section.title)?;
            let body = section.body.trim_end();
            if !body.is_empty() {
                writeln!(f, "{}", body)?;
            }
        }
        Ok(())
    }
}

pub const SECTION_OUTPUT: &str = "output exists";
pub const SECTION_LISTING: &str = "workspace listing";
pub const SECTION_LOG: &str = "task log";
pub const SECTION_TASK: &str = "scheduler query";

/// Gather the four diagnostic sections for an invocation.
pub async fn collect(
    channel: &dyn CommandChannel,
    launcher: &dyn SessionLauncher,
    workspace: &RemoteWorkspace,
    task_name: &str,
    log_tail_lines: u32,
) -> DiagnosticsBundle {
    let mut bundle = DiagnosticsBundle::default();

    let output = run_query(channel, &powershell::diag_output_exists(&workspace.output)).await;
    bundle.push(
        SECTION_OUTPUT,
        output.unwrap_or_else(|e| format!("(could not check output file: {e})")),
    );

    let listing = run_query(channel, &powershell::diag_listing(&workspace.dir)).await;
    bundle.push(
        SECTION_LISTING,
        listing.unwrap_or_else(|e| format!("(could not list {}: {e})", workspace.dir)),
    );

    let log = run_query(channel, &powershell::diag_log_tail(&workspace.log, log_tail_lines)).await;
    bundle.push(
        format!("{} (last {} lines)", SECTION_LOG, log_tail_lines),
        log.unwrap_or_else(|e| format!("(could not read log: {e})")),
    );

    let task = launcher
        .describe(channel, task_name)
        .await
        .map_err(|e| e.to_string());
    bundle.push(
        SECTION_TASK,
        task.unwrap_or_else(|e| format!("(scheduler query failed: {e})")),
    );

    info!(task_name, sections = bundle.sections.len(), "diagnostics collected");
    bundle
}

async fn run_query(channel: &dyn CommandChannel, script: &str) -> Result<String, String> {
    match execute_checked(channel, script).await {
        Ok(result) => Ok(result.stdout),
        Err(e) => {
            debug!(error = %e, "diagnostic query failed");
            Err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ScheduledTaskLauncher;
    use crate::mock::{MockHost, ScriptKind};
    use crate::types::BridgeConfig;

    fn workspace() -> RemoteWorkspace {
        RemoteWorkspace::in_dir(r"C:\w", &BridgeConfig::default())
    }

    #[test]
    fn test_display_renders_headers() {
        let mut bundle = DiagnosticsBundle::default();
        bundle.push("output exists", "NO\n");
        bundle.push("empty", "");
        assert_eq!(
            bundle.to_string(),
            "=== DIAG: output exists ===\nNO\n=== DIAG: empty ===\n"
        );
        assert_eq!(bundle.section("output exists"), Some("NO\n"));
    }

    #[tokio::test]
    async fn test_collect_reports_all_sections() {
        let host = MockHost::new();
        host.put_file(r"C:\w\task.log", b"=== START 2026-10-19T10:00:00\r\n".to_vec());
        let bundle = collect(&host, &ScheduledTaskLauncher::new(), &workspace(), "SBR-UIA-1", 200).await;
        assert_eq!(bundle.sections.len(), 4);
        assert_eq!(bundle.section(SECTION_OUTPUT).map(str::trim), Some("NO"));
        assert!(bundle.section("task log (last 200 lines)").unwrap().contains("=== START"));
        assert!(bundle.to_string().contains("=== DIAG: scheduler query ==="));
    }

    #[tokio::test]
    async fn test_failing_queries_become_placeholders() {
        let host = MockHost::new();
        host.fail_channel(ScriptKind::DiagOutput);
        host.fail_channel(ScriptKind::DiagListing);
        host.fail_channel(ScriptKind::DiagLog);
        host.fail_channel(ScriptKind::QueryTask);
        let bundle = collect(&host, &ScheduledTaskLauncher::new(), &workspace(), "SBR-UIA-1", 50).await;
        assert_eq!(bundle.sections.len(), 4);
        assert!(bundle.section(SECTION_OUTPUT).unwrap().starts_with("(could not check"));
        assert!(bundle.section(SECTION_TASK).unwrap().starts_with("(scheduler query failed"));
    }
}
