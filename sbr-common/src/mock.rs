//! In-memory Windows host for testing.
//!
//! [`MockHost`] implements [`CommandChannel`] by interpreting the scripts
//! generated in [`crate::powershell`]: it keeps files, directories and
//! scheduled tasks in memory, records every execution, and runs a
//! configurable [`TaskBehavior`] when a task is triggered.
//!
//! The CLI routes hosts of the form `mock://<name>` here, configured from
//! `SBR_MOCK_TASK` and `SBR_MOCK_FAIL`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::channel::{CommandChannel, CommandResult};
use crate::errors::ChannelError;
use crate::powershell::parse_assignments;

pub use crate::powershell::ScriptKind;

const UTF8_BOM: char = '\u{feff}';
const NOT_FOUND: &str = "ERROR: The system cannot find the file specified.\r\n";

static TAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\$tail = (\d+)").expect("tail regex is valid"));
static EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^exit\s+(-?\d+)$").expect("exit regex is valid"));

/// Check if a host string selects the in-memory host (`mock://`).
pub fn is_mock_host(host: &str) -> bool {
    host.starts_with("mock://")
}

/// What the scheduled task does once triggered.
#[derive(Clone, Default)]
pub enum TaskBehavior {
    /// The wrapper starts but no output ever appears.
    #[default]
    Never,
    /// Output `content` appears after `after_polls` empty output polls.
    WriteOutput { content: String, after_polls: u32 },
    /// The action script exits with `exit_code` without writing output.
    ExitWithoutOutput { exit_code: i32 },
    /// Output computed from the input file content.
    Respond(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl TaskBehavior {
    /// Output written immediately.
    pub fn write(content: impl Into<String>) -> Self {
        Self::WriteOutput {
            content: content.into(),
            after_polls: 0,
        }
    }

    /// Success artifact echoing the requested action.
    pub fn echo_success() -> Self {
        Self::Respond(Arc::new(|input: &str| {
            let action = serde_json::from_str::<serde_json::Value>(input)
                .ok()
                .and_then(|v| v.get("action").cloned())
                .unwrap_or(serde_json::Value::Null);
            serde_json::json!({
                "ok": true,
                "action": action,
                "error": null,
                "data": {"host": "mock"},
            })
            .to_string()
        }))
    }

    /// Parse an `SBR_MOCK_TASK` value: `ok`, `never`, `garbage`, `exit:<code>`.
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.trim() {
            "ok" => Some(Self::echo_success()),
            "never" => Some(Self::Never),
            "garbage" => Some(Self::write("this is not json")),
            other => other
                .strip_prefix("exit:")
                .and_then(|code| code.parse().ok())
                .map(|exit_code| Self::ExitWithoutOutput { exit_code }),
        }
    }
}

impl fmt::Debug for TaskBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::WriteOutput {
                content,
                after_polls,
            } => f
                .debug_struct("WriteOutput")
                .field("content", content)
                .field("after_polls", after_polls)
                .finish(),
            Self::ExitWithoutOutput { exit_code } => f
                .debug_struct("ExitWithoutOutput")
                .field("exit_code", exit_code)
                .finish(),
            Self::Respond(_) => write!(f, "Respond(<fn>)"),
        }
    }
}

/// Recorded execution for verification.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub kind: ScriptKind,
    pub script: String,
    pub timestamp: SystemTime,
}

/// Scheduled task as registered on the mock host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTask {
    pub run_as: String,
    pub command: String,
    pub runs: u32,
    pub last_result: Option<i32>,
    pub running: bool,
}

#[derive(Debug, Clone, Copy)]
enum FaultAction {
    Channel,
    Exit(i32),
}

#[derive(Debug, Clone)]
struct Fault {
    kind: ScriptKind,
    action: FaultAction,
    /// Calls of `kind` that succeed before the fault applies.
    after: usize,
}

#[derive(Debug)]
struct PendingOutput {
    path: String,
    content: String,
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct HostState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    tasks: BTreeMap<String, MockTask>,
    invocations: Vec<MockInvocation>,
    faults: Vec<Fault>,
    behavior: TaskBehavior,
    pending: Option<PendingOutput>,
}

/// In-memory Windows host.
#[derive(Debug)]
pub struct MockHost {
    endpoint: String,
    whoami: String,
    state: Mutex<HostState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('\\').map(|(dir, _)| dir)
}

fn ok(stdout: impl Into<String>) -> CommandResult {
    CommandResult::ok(stdout)
}

impl MockHost {
    pub fn new() -> Self {
        Self::named("mock://winhost")
    }

    pub fn named(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            whoami: "winhost\\operator".to_string(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Build a host for a `mock://` endpoint from `SBR_MOCK_TASK` and `SBR_MOCK_FAIL`.
    ///
    /// `SBR_MOCK_FAIL` is a comma-separated list of script kinds (e.g.
    /// `create-task,read-output`) whose executions fail at the channel level.
    pub fn from_env(endpoint: &str) -> Self {
        let host = Self::named(endpoint);
        let behavior = std::env::var("SBR_MOCK_TASK")
            .ok()
            .and_then(|v| TaskBehavior::parse(&v))
            .unwrap_or_else(TaskBehavior::echo_success);
        host.set_behavior(behavior);
        if let Ok(fail) = std::env::var("SBR_MOCK_FAIL") {
            for kind in fail.split(',').filter_map(ScriptKind::from_tag) {
                host.fail_channel(kind);
            }
        }
        host
    }

    pub fn with_behavior(self, behavior: TaskBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn set_behavior(&self, behavior: TaskBehavior) {
        self.state().behavior = behavior;
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- filesystem -------------------------------------------------------

    pub fn put_file(&self, path: &str, content: Vec<u8>) {
        let mut state = self.state();
        if let Some(dir) = parent_dir(path) {
            state.dirs.insert(dir.to_string());
        }
        state.files.insert(path.to_string(), content);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state().files.contains_key(path)
    }

    pub fn remove_file(&self, path: &str) {
        self.state().files.remove(path);
    }

    // --- tasks ------------------------------------------------------------

    pub fn task_exists(&self, name: &str) -> bool {
        self.state().tasks.contains_key(name)
    }

    pub fn task(&self, name: &str) -> Option<MockTask> {
        self.state().tasks.get(name).cloned()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.state().tasks.keys().cloned().collect()
    }

    // --- recording --------------------------------------------------------

    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.state().invocations.clone()
    }

    pub fn count(&self, kind: ScriptKind) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|i| i.kind == kind)
            .count()
    }

    pub fn clear_invocations(&self) {
        self.state().invocations.clear();
    }

    // --- fault injection --------------------------------------------------

    /// Every execution of `kind` fails at the channel level.
    pub fn fail_channel(&self, kind: ScriptKind) {
        self.fail_channel_after(kind, 0);
    }

    pub fn fail_channel_after(&self, kind: ScriptKind, after: usize) {
        self.state().faults.push(Fault {
            kind,
            action: FaultAction::Channel,
            after,
        });
    }

    /// Every execution of `kind` exits with `exit_code`.
    pub fn fail_exit(&self, kind: ScriptKind, exit_code: i32) {
        self.fail_exit_after(kind, exit_code, 0);
    }

    pub fn fail_exit_after(&self, kind: ScriptKind, exit_code: i32, after: usize) {
        self.state().faults.push(Fault {
            kind,
            action: FaultAction::Exit(exit_code),
            after,
        });
    }

    // --- interpreter ------------------------------------------------------

    fn run(&self, script: &str) -> Result<CommandResult, ChannelError> {
        let kind = ScriptKind::detect(script);
        let mut guard = self.state();
        let state = &mut *guard;
        state.invocations.push(MockInvocation {
            kind,
            script: script.to_string(),
            timestamp: SystemTime::now(),
        });
        let seen = state.invocations.iter().filter(|i| i.kind == kind).count();

        let fault = state
            .faults
            .iter()
            .find(|f| f.kind == kind && seen > f.after)
            .map(|f| f.action);
        match fault {
            Some(FaultAction::Channel) => {
                debug!(kind = %kind, "mock channel failure");
                return Err(ChannelError::Connect {
                    endpoint: self.endpoint.clone(),
                    message: format!("injected failure for {}", kind),
                });
            }
            Some(FaultAction::Exit(code)) => {
                debug!(kind = %kind, code, "mock exit failure");
                return Ok(CommandResult::failed(
                    code,
                    format!("injected exit {} for {}\r\n", code, kind),
                ));
            }
            None => {}
        }

        let vars = parse_assignments(script);
        let var = |name: &str| vars.get(name).cloned().unwrap_or_default();
        let result = match kind {
            ScriptKind::UploadSetup => {
                let path = var("p");
                if let Some(dir) = parent_dir(&path) {
                    state.dirs.insert(dir.to_string());
                }
                state.files.insert(path, Vec::new());
                ok("")
            }
            ScriptKind::UploadChunk => match STANDARD.decode(var("c")) {
                Ok(bytes) => {
                    state.files.entry(var("p")).or_default().extend(bytes);
                    ok("")
                }
                Err(e) => CommandResult::failed(
                    1,
                    format!("Exception calling \"FromBase64String\": {}\r\n", e),
                ),
            },
            ScriptKind::WriteInput => {
                state.dirs.insert(var("dir"));
                state.files.insert(var("inPath"), var("json").into_bytes());
                state.files.remove(&var("outPath"));
                state.files.remove(&var("logPath"));
                ok("")
            }
            ScriptKind::WriteFile => {
                let path = var("p");
                if let Some(dir) = parent_dir(&path) {
                    state.dirs.insert(dir.to_string());
                }
                state.files.insert(path, var("content").into_bytes());
                ok("")
            }
            ScriptKind::CreateTask => {
                let name = var("taskName");
                state.tasks.insert(
                    name.clone(),
                    MockTask {
                        run_as: var("runAsUser"),
                        command: var("tr"),
                        runs: 0,
                        last_result: None,
                        running: false,
                    },
                );
                ok(format!(
                    "SUCCESS: The scheduled task \"{}\" has successfully been created.\r\n",
                    name
                ))
            }
            ScriptKind::RunTask => Self::trigger(state, &var("taskName")),
            ScriptKind::EndTask => {
                let name = var("taskName");
                match state.tasks.get_mut(&name) {
                    Some(task) => {
                        task.running = false;
                        state.pending = None;
                        ok(format!(
                            "SUCCESS: The scheduled task \"{}\" has been terminated successfully.\r\n",
                            name
                        ))
                    }
                    None => CommandResult::failed(1, NOT_FOUND),
                }
            }
            ScriptKind::DeleteTask => {
                let name = var("taskName");
                if state.tasks.remove(&name).is_some() {
                    ok(format!(
                        "SUCCESS: The scheduled task \"{}\" was successfully deleted.\r\n",
                        name
                    ))
                } else {
                    CommandResult::failed(1, NOT_FOUND)
                }
            }
            ScriptKind::QueryTask => {
                let name = var("taskName");
                match state.tasks.get(&name) {
                    Some(task) => ok(format!(
                        "TaskName:       \\{}\r\nStatus:         {}\r\nLast Result:    {}\r\nRun As User:    {}\r\nTask To Run:    {}\r\n",
                        name,
                        if task.running { "Running" } else { "Ready" },
                        task.last_result.map(|c| c.to_string()).unwrap_or_else(|| "267011".to_string()),
                        task.run_as,
                        task.command
                    )),
                    None => CommandResult::failed(1, NOT_FOUND),
                }
            }
            ScriptKind::ReadOutput => {
                let path = var("p");
                let due = match state.pending.as_mut() {
                    Some(pending) if pending.path == path => {
                        if pending.remaining_polls == 0 {
                            true
                        } else {
                            pending.remaining_polls -= 1;
                            false
                        }
                    }
                    _ => false,
                };
                if let Some(pending) = state.pending.take_if(|_| due) {
                    state.files.insert(pending.path, pending.content.into_bytes());
                    if let Some(task) = state.tasks.values_mut().find(|t| t.running) {
                        task.running = false;
                        task.last_result = Some(0);
                    }
                }
                match state.files.get(&path) {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes);
                        let text = text.trim_start_matches(UTF8_BOM);
                        if text.is_empty() {
                            ok("")
                        } else {
                            ok(format!("{}\r\n", text))
                        }
                    }
                    None => ok(""),
                }
            }
            ScriptKind::DiagOutput => {
                let path = var("p");
                match state.files.get(&path) {
                    Some(bytes) => ok(format!(
                        "YES\r\n\r\nFullName      : {}\r\nLength        : {}\r\n",
                        path,
                        bytes.len()
                    )),
                    None => ok("NO\r\n"),
                }
            }
            ScriptKind::DiagListing => {
                let dir = var("dir");
                if state.dirs.contains(&dir) {
                    let mut listing = String::from("Name Length\r\n---- ------\r\n");
                    for (path, bytes) in &state.files {
                        if parent_dir(path) == Some(dir.as_str()) {
                            let name = path.rsplit('\\').next().unwrap_or(path);
                            listing.push_str(&format!("{} {}\r\n", name, bytes.len()));
                        }
                    }
                    ok(listing)
                } else {
                    CommandResult::failed(
                        1,
                        format!(
                            "Get-ChildItem : Cannot find path '{}' because it does not exist.\r\n",
                            dir
                        ),
                    )
                }
            }
            ScriptKind::DiagLog => {
                let tail: usize = TAIL_RE
                    .captures(script)
                    .and_then(|c| c[1].parse().ok())
                    .unwrap_or(200);
                match state.files.get(&var("p")) {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes);
                        let lines: Vec<&str> = text.lines().collect();
                        let start = lines.len().saturating_sub(tail);
                        ok(format!("{}\r\n", lines[start..].join("\r\n")))
                    }
                    None => ok("(no log file)\r\n"),
                }
            }
            ScriptKind::Whoami => ok(format!("{}\r\n", self.whoami)),
            ScriptKind::Other => match EXIT_RE.captures(script.trim()) {
                Some(caps) => {
                    let code = caps[1].parse().unwrap_or(1);
                    CommandResult {
                        exit_code: code,
                        ..CommandResult::default()
                    }
                }
                None => ok(""),
            },
        };
        debug!(kind = %kind, exit_code = result.exit_code, "mock executed");
        Ok(result)
    }

    /// Emulate `schtasks /Run` followed by the wrapper running in the session.
    fn trigger(state: &mut HostState, name: &str) -> CommandResult {
        let Some(task) = state.tasks.get(name) else {
            return CommandResult::failed(1, NOT_FOUND);
        };
        let wrapper_path = task
            .command
            .split_once(" -File ")
            .map(|(_, path)| path.trim().trim_matches('"').to_string())
            .unwrap_or_default();
        let wrapper = state
            .files
            .get(&wrapper_path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

        let response = ok(format!(
            "SUCCESS: Attempted to run the scheduled task \"{}\".\r\n",
            name
        ));
        let Some(wrapper) = wrapper else {
            if let Some(task) = state.tasks.get_mut(name) {
                task.runs += 1;
                task.last_result = Some(1);
            }
            return response;
        };

        let vars = parse_assignments(&wrapper);
        let var = |key: &str| vars.get(key).cloned().unwrap_or_default();
        let (out_path, log_path) = (var("outPath"), var("logPath"));
        let stamp = || chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut log = format!("=== START {}\r\n", stamp());

        let mut running = false;
        let last_result = if !state.files.contains_key(&var("psPath")) {
            let message = format!(
                "The term '{}' is not recognized as the name of a cmdlet, function, script file, or operable program.",
                var("psPath")
            );
            log.push_str(&format!("=== ERROR {}\r\n{}\r\n", stamp(), message));
            state
                .files
                .insert(out_path.clone(), synthesized_failure(&message).into_bytes());
            Some(1)
        } else {
            match state.behavior.clone() {
                TaskBehavior::Never => {
                    running = true;
                    None
                }
                TaskBehavior::WriteOutput {
                    content,
                    after_polls,
                } => {
                    if after_polls == 0 {
                        state.files.insert(out_path.clone(), content.into_bytes());
                        log.push_str(&format!("=== EXIT 0 {}\r\n", stamp()));
                        Some(0)
                    } else {
                        state.pending = Some(PendingOutput {
                            path: out_path.clone(),
                            content,
                            remaining_polls: after_polls,
                        });
                        running = true;
                        None
                    }
                }
                TaskBehavior::ExitWithoutOutput { exit_code } => {
                    log.push_str(&format!("=== EXIT {} {}\r\n", exit_code, stamp()));
                    if exit_code != 0 && !state.files.contains_key(&out_path) {
                        let message = format!("{} exited with {}", var("scriptName"), exit_code);
                        state
                            .files
                            .insert(out_path.clone(), synthesized_failure(&message).into_bytes());
                    }
                    Some(exit_code)
                }
                TaskBehavior::Respond(respond) => {
                    let input = state
                        .files
                        .get(&var("inPath"))
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .unwrap_or_default();
                    state.files.insert(out_path.clone(), respond(&input).into_bytes());
                    log.push_str(&format!("=== EXIT 0 {}\r\n", stamp()));
                    Some(0)
                }
            }
        };

        state.files.insert(log_path, log.into_bytes());
        if let Some(task) = state.tasks.get_mut(name) {
            task.runs += 1;
            task.running = running;
            task.last_result = last_result;
        }
        response
    }
}

/// Failure artifact as the wrapper writes it (`Set-Content -Encoding UTF8` adds a BOM).
fn synthesized_failure(message: &str) -> String {
    let body = serde_json::json!({
        "ok": false,
        "action": null,
        "error": message,
        "data": null,
    });
    format!("{}{}\r\n", UTF8_BOM, body)
}

#[async_trait]
impl CommandChannel for MockHost {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, script: &str) -> Result<CommandResult, ChannelError> {
        self.run(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powershell;
    use crate::types::{BridgeConfig, RemoteWorkspace};

    fn workspace() -> RemoteWorkspace {
        RemoteWorkspace::in_dir(r"C:\w", &BridgeConfig::default())
    }

    async fn prepare(host: &MockHost) {
        let ws = workspace();
        host.put_file(&ws.action_script, b"param($InputJsonPath, $OutputJsonPath)".to_vec());
        host.execute(&powershell::write_input(&ws, r#"{"action":"listTopWindows"}"#))
            .await
            .unwrap();
        host.execute(&powershell::write_text_file(
            &ws.wrapper_script,
            &powershell::wrapper_script(&ws),
        ))
        .await
        .unwrap();
        host.execute(&powershell::create_task(
            "T1",
            r"DOMAIN\desk",
            "pw",
            &format!(r"powershell.exe -File {}", ws.wrapper_script),
        ))
        .await
        .unwrap();
    }

    #[test]
    fn test_is_mock_host() {
        assert!(is_mock_host("mock://lab"));
        assert!(!is_mock_host("10.0.0.42"));
    }

    #[test]
    fn test_behavior_parse() {
        assert!(matches!(TaskBehavior::parse("never"), Some(TaskBehavior::Never)));
        assert!(matches!(
            TaskBehavior::parse("exit:3"),
            Some(TaskBehavior::ExitWithoutOutput { exit_code: 3 })
        ));
        assert!(matches!(TaskBehavior::parse("ok"), Some(TaskBehavior::Respond(_))));
        assert!(TaskBehavior::parse("exit:x").is_none());
    }

    #[tokio::test]
    async fn test_trigger_synthesizes_failure_on_exit_without_output() {
        let host = MockHost::new().with_behavior(TaskBehavior::ExitWithoutOutput { exit_code: 1 });
        prepare(&host).await;
        host.execute(&powershell::run_task("T1")).await.unwrap();

        let out = host.file_text(r"C:\w\output.json").unwrap();
        assert!(out.contains(r#""error":"uia_run.ps1 exited with 1""#));
        let log = host.file_text(r"C:\w\task.log").unwrap();
        assert!(log.starts_with("=== START "));
        assert!(log.contains("=== EXIT 1 "));
        assert_eq!(host.task("T1").unwrap().last_result, Some(1));
    }

    #[tokio::test]
    async fn test_write_output_after_polls() {
        let host = MockHost::new().with_behavior(TaskBehavior::WriteOutput {
            content: "{}".to_string(),
            after_polls: 2,
        });
        prepare(&host).await;
        host.execute(&powershell::run_task("T1")).await.unwrap();

        let read = powershell::read_if_exists(r"C:\w\output.json");
        assert_eq!(host.execute(&read).await.unwrap().stdout, "");
        assert_eq!(host.execute(&read).await.unwrap().stdout, "");
        assert_eq!(host.execute(&read).await.unwrap().stdout.trim(), "{}");
    }

    #[tokio::test]
    async fn test_missing_action_script_fails_inside_wrapper() {
        let host = MockHost::new().with_behavior(TaskBehavior::echo_success());
        prepare(&host).await;
        host.remove_file(r"C:\w\uia_run.ps1");
        host.execute(&powershell::run_task("T1")).await.unwrap();
        let out = host.file_text(r"C:\w\output.json").unwrap();
        assert!(out.contains("is not recognized"));
    }

    #[tokio::test]
    async fn test_run_unknown_task_fails() {
        let host = MockHost::new();
        let result = host.execute(&powershell::run_task("missing")).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("cannot find"));
    }

    #[tokio::test]
    async fn test_fault_after_successes() {
        let host = MockHost::new();
        host.fail_channel_after(ScriptKind::Whoami, 1);
        assert!(host.execute(&powershell::whoami()).await.is_ok());
        assert!(host.execute(&powershell::whoami()).await.is_err());
        assert_eq!(host.count(ScriptKind::Whoami), 2);
    }
}
