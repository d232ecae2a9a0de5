//! PowerShell script builders.
//!
//! Every remote step of an invocation is one small script generated here.
//! Scripts start with a `# sbr:<kind>` marker line and declare their inputs
//! as single-quoted assignments at the top, so a script is self-describing in
//! host logs and in the in-memory test host.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::types::RemoteWorkspace;

/// Full path of Windows PowerShell used in scheduled task commands.
pub const POWERSHELL_EXE: &str = r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe";

/// Which bridge step a generated script performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    UploadSetup,
    UploadChunk,
    WriteInput,
    WriteFile,
    CreateTask,
    RunTask,
    EndTask,
    DeleteTask,
    QueryTask,
    ReadOutput,
    DiagOutput,
    DiagListing,
    DiagLog,
    Whoami,
    /// Anything not produced by this module.
    Other,
}

impl ScriptKind {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::UploadSetup => "upload-setup",
            Self::UploadChunk => "upload-chunk",
            Self::WriteInput => "write-input",
            Self::WriteFile => "write-file",
            Self::CreateTask => "create-task",
            Self::RunTask => "run-task",
            Self::EndTask => "end-task",
            Self::DeleteTask => "delete-task",
            Self::QueryTask => "query-task",
            Self::ReadOutput => "read-output",
            Self::DiagOutput => "diag-output",
            Self::DiagListing => "diag-listing",
            Self::DiagLog => "diag-log",
            Self::Whoami => "whoami",
            Self::Other => "other",
        }
    }

    const ALL: [ScriptKind; 14] = [
        Self::UploadSetup,
        Self::UploadChunk,
        Self::WriteInput,
        Self::WriteFile,
        Self::CreateTask,
        Self::RunTask,
        Self::EndTask,
        Self::DeleteTask,
        Self::QueryTask,
        Self::ReadOutput,
        Self::DiagOutput,
        Self::DiagListing,
        Self::DiagLog,
        Self::Whoami,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag.trim())
    }

    /// Classify a script by its marker line.
    pub fn detect(script: &str) -> Self {
        script
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix("# sbr:"))
            .and_then(Self::from_tag)
            .unwrap_or(Self::Other)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\$(\w+)\s*=\s*'((?:[^']|'')*)'").expect("assignment regex is valid")
});

/// Read the `$name = '<value>'` assignments of a generated script.
///
/// The first assignment of a name wins; quoted values are unescaped.
pub fn parse_assignments(script: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for caps in ASSIGNMENT_RE.captures_iter(script) {
        vars.entry(caps[1].to_string())
            .or_insert_with(|| caps[2].replace("''", "'"));
    }
    vars
}

/// Single-quote a string for PowerShell, doubling embedded quotes.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Encode a script for `powershell -EncodedCommand` (UTF-16LE, base64).
pub fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}

/// Command line that runs an encoded script non-interactively.
pub fn powershell_command_line(script: &str) -> String {
    format!(
        "powershell -NoProfile -NonInteractive -EncodedCommand {}",
        encode_command(script)
    )
}

struct ScriptBuilder {
    body: String,
}

impl ScriptBuilder {
    fn new(kind: ScriptKind, error_action: &str) -> Self {
        let mut body = format!("# sbr:{}\n", kind.tag());
        body.push_str(&format!("$ErrorActionPreference = '{}'\n", error_action));
        Self { body }
    }

    fn var(mut self, name: &str, value: &str) -> Self {
        self.body
            .push_str(&format!("${} = {}\n", name, ps_quote(value)));
        self
    }

    fn line(mut self, line: &str) -> Self {
        self.body.push_str(line);
        self.body.push('\n');
        self
    }

    fn schtasks(self) -> Self {
        self.line("$schtasks = Join-Path $env:WINDIR 'System32\\schtasks.exe'")
    }

    /// Run schtasks and exit with its code, echoing its output to stderr on failure.
    fn schtasks_call(self, args: &str) -> Self {
        self.line(&format!("$out = & $schtasks {} 2>&1 | Out-String", args))
            .line("$code = $LASTEXITCODE")
            .line("if ($code -ne 0) { [Console]::Error.WriteLine($out); exit $code }")
            .line("$out")
    }

    fn build(self) -> String {
        self.body
    }
}

/// Create the parent directory and leave an empty file at `path`.
pub fn upload_setup(path: &str) -> String {
    ScriptBuilder::new(ScriptKind::UploadSetup, "Stop")
        .var("p", path)
        .line("New-Item -ItemType Directory -Force -Path (Split-Path -Parent $p) | Out-Null")
        .line("if (Test-Path -LiteralPath $p) { Remove-Item -Force -LiteralPath $p }")
        .line("[IO.File]::WriteAllBytes($p, [byte[]]@())")
        .build()
}

/// Decode one base64 chunk and append it to `path`.
pub fn upload_chunk(path: &str, chunk: &str) -> String {
    ScriptBuilder::new(ScriptKind::UploadChunk, "Stop")
        .var("p", path)
        .var("c", chunk)
        .line("$b = [Convert]::FromBase64String($c)")
        .line("$fs = [IO.File]::Open($p, [IO.FileMode]::Append, [IO.FileAccess]::Write, [IO.FileShare]::Read)")
        .line("try { $fs.Write($b, 0, $b.Length) } finally { $fs.Close() }")
        .build()
}

/// Write the input JSON and remove stale output and log files.
pub fn write_input(workspace: &RemoteWorkspace, json: &str) -> String {
    ScriptBuilder::new(ScriptKind::WriteInput, "Stop")
        .var("dir", &workspace.dir)
        .var("inPath", &workspace.input)
        .var("outPath", &workspace.output)
        .var("logPath", &workspace.log)
        .var("json", json)
        .line("New-Item -ItemType Directory -Force -Path $dir | Out-Null")
        .line("[IO.File]::WriteAllText($inPath, $json, (New-Object System.Text.UTF8Encoding $false))")
        .line("if (Test-Path -LiteralPath $outPath) { Remove-Item -Force -LiteralPath $outPath }")
        .line("if (Test-Path -LiteralPath $logPath) { Remove-Item -Force -LiteralPath $logPath }")
        .build()
}

/// Write a small text file (UTF-8 with BOM so Windows PowerShell reads it correctly).
pub fn write_text_file(path: &str, content: &str) -> String {
    ScriptBuilder::new(ScriptKind::WriteFile, "Stop")
        .var("p", path)
        .var("content", content)
        .line("New-Item -ItemType Directory -Force -Path (Split-Path -Parent $p) | Out-Null")
        .line("[IO.File]::WriteAllText($p, $content, (New-Object System.Text.UTF8Encoding $true))")
        .build()
}

/// Wrapper run by the scheduled task inside the interactive session.
///
/// Logs start and exit markers, runs the action script, and writes a
/// synthesized failure artifact when the action exits non-zero without
/// output. Exits with the action script's own code.
pub fn wrapper_script(workspace: &RemoteWorkspace) -> String {
    let mut script = String::new();
    script.push_str("$ErrorActionPreference = 'Stop'\n");
    for (name, value) in [
        ("logPath", workspace.log.as_str()),
        ("outPath", workspace.output.as_str()),
        ("psPath", workspace.action_script.as_str()),
        ("inPath", workspace.input.as_str()),
        ("scriptName", workspace.action_script_file_name()),
    ] {
        script.push_str(&format!("${} = {}\n", name, ps_quote(value)));
    }
    script.push_str(WRAPPER_BODY);
    script
}

const WRAPPER_BODY: &str = r#"function Write-Failure([string]$message) {
  $obj = [ordered]@{ ok = $false; action = $null; error = $message; data = $null }
  ($obj | ConvertTo-Json -Compress) | Set-Content -LiteralPath $outPath -Encoding UTF8
}
('=== START ' + (Get-Date).ToString('s')) | Out-File -LiteralPath $logPath -Encoding UTF8
try {
  & $psPath -InputJsonPath $inPath -OutputJsonPath $outPath 2>&1 | Out-File -LiteralPath $logPath -Append -Encoding UTF8
  $code = $LASTEXITCODE
  if ($null -eq $code) { $code = 0 }
  ('=== EXIT ' + $code + ' ' + (Get-Date).ToString('s')) | Out-File -LiteralPath $logPath -Append -Encoding UTF8
  if (($code -ne 0) -and (-not (Test-Path -LiteralPath $outPath))) {
    Write-Failure ($scriptName + ' exited with ' + $code)
  }
  exit $code
} catch {
  ('=== ERROR ' + (Get-Date).ToString('s')) | Out-File -LiteralPath $logPath -Append -Encoding UTF8
  ($_ | Out-String) | Out-File -LiteralPath $logPath -Append -Encoding UTF8
  if (-not (Test-Path -LiteralPath $outPath)) {
    Write-Failure $_.Exception.Message
  }
  exit 1
}
"#;

/// Create a run-once, highest-privilege task bound to the interactive session of `run_as_user`.
pub fn create_task(task_name: &str, run_as_user: &str, run_as_password: &str, command: &str) -> String {
    ScriptBuilder::new(ScriptKind::CreateTask, "Continue")
        .var("taskName", task_name)
        .var("runAsUser", run_as_user)
        .var("runAsPass", run_as_password)
        .var("tr", command)
        .schtasks()
        .line("$sd = (Get-Date).ToString('MM/dd/yyyy')")
        .schtasks_call(
            "/Create /F /TN $taskName /SC ONCE /ST 00:00 /SD $sd /RL HIGHEST /RU $runAsUser /RP $runAsPass /IT /TR $tr",
        )
        .build()
}

pub fn run_task(task_name: &str) -> String {
    ScriptBuilder::new(ScriptKind::RunTask, "Continue")
        .var("taskName", task_name)
        .schtasks()
        .schtasks_call("/Run /TN $taskName")
        .build()
}

pub fn end_task(task_name: &str) -> String {
    ScriptBuilder::new(ScriptKind::EndTask, "Continue")
        .var("taskName", task_name)
        .schtasks()
        .schtasks_call("/End /TN $taskName")
        .build()
}

pub fn delete_task(task_name: &str) -> String {
    ScriptBuilder::new(ScriptKind::DeleteTask, "Continue")
        .var("taskName", task_name)
        .schtasks()
        .schtasks_call("/Delete /TN $taskName /F")
        .build()
}

/// Verbose scheduler report for the task (last run time, last result, status).
pub fn query_task(task_name: &str) -> String {
    ScriptBuilder::new(ScriptKind::QueryTask, "Continue")
        .var("taskName", task_name)
        .schtasks()
        .schtasks_call("/Query /TN $taskName /V /FO LIST")
        .build()
}

/// Print the file content if the file exists, nothing otherwise.
pub fn read_if_exists(path: &str) -> String {
    ScriptBuilder::new(ScriptKind::ReadOutput, "Stop")
        .var("p", path)
        .line("if (Test-Path -LiteralPath $p) { Get-Content -LiteralPath $p -Raw -Encoding UTF8 }")
        .build()
}

pub fn diag_output_exists(path: &str) -> String {
    ScriptBuilder::new(ScriptKind::DiagOutput, "Continue")
        .var("p", path)
        .line("if (Test-Path -LiteralPath $p) {")
        .line("  'YES'")
        .line("  Get-Item -LiteralPath $p | Select-Object FullName,Length,LastWriteTime | Format-List | Out-String")
        .line("} else { 'NO' }")
        .build()
}

pub fn diag_listing(dir: &str) -> String {
    ScriptBuilder::new(ScriptKind::DiagListing, "Stop")
        .var("dir", dir)
        .line("Get-ChildItem -LiteralPath $dir -Force | Select-Object Name,Length,LastWriteTime | Format-Table -AutoSize | Out-String -Width 200")
        .build()
}

pub fn diag_log_tail(path: &str, lines: u32) -> String {
    ScriptBuilder::new(ScriptKind::DiagLog, "Stop")
        .var("p", path)
        .line(&format!("$tail = {}", lines))
        .line("if (Test-Path -LiteralPath $p) { Get-Content -LiteralPath $p -Tail $tail -Encoding UTF8 | Out-String } else { '(no log file)' }")
        .build()
}

/// Connectivity check.
pub fn whoami() -> String {
    ScriptBuilder::new(ScriptKind::Whoami, "Stop")
        .line("whoami")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BridgeConfig;

    fn workspace() -> RemoteWorkspace {
        RemoteWorkspace::in_dir(r"C:\Windows\Temp\winrm-uia", &BridgeConfig::default())
    }

    #[test]
    fn test_ps_quote_doubles_single_quotes() {
        assert_eq!(ps_quote("plain"), "'plain'");
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
        assert_eq!(ps_quote(""), "''");
    }

    #[test]
    fn test_parse_assignments_round_trips_quotes() {
        let script = write_text_file(r"C:\w\run_task.ps1", &wrapper_script(&workspace()));
        let vars = parse_assignments(&script);
        assert_eq!(vars["p"], r"C:\w\run_task.ps1");
        assert_eq!(vars["content"], wrapper_script(&workspace()));
        // Assignments inside the quoted content are not top-level variables.
        assert!(!vars.contains_key("logPath"));

        let vars = parse_assignments(&wrapper_script(&workspace()));
        assert_eq!(vars["logPath"], r"C:\Windows\Temp\winrm-uia\task.log");
        assert_eq!(vars["scriptName"], "uia_run.ps1");
    }

    #[test]
    fn test_encode_command_is_utf16le() {
        // "ab" -> 61 00 62 00
        assert_eq!(encode_command("ab"), "YQBiAA==");
        assert!(powershell_command_line("ab").ends_with("-EncodedCommand YQBiAA=="));
    }

    #[test]
    fn test_detect_kinds() {
        assert_eq!(ScriptKind::detect(&upload_setup("C:\\x")), ScriptKind::UploadSetup);
        assert_eq!(ScriptKind::detect(&upload_chunk("C:\\x", "AAAA")), ScriptKind::UploadChunk);
        assert_eq!(ScriptKind::detect(&write_input(&workspace(), "{}")), ScriptKind::WriteInput);
        assert_eq!(ScriptKind::detect(&create_task("t", "u", "p", "cmd")), ScriptKind::CreateTask);
        assert_eq!(ScriptKind::detect(&query_task("t")), ScriptKind::QueryTask);
        assert_eq!(ScriptKind::detect(&diag_log_tail("C:\\l", 200)), ScriptKind::DiagLog);
        assert_eq!(ScriptKind::detect(&whoami()), ScriptKind::Whoami);
        assert_eq!(ScriptKind::detect("Get-Date"), ScriptKind::Other);
        assert_eq!(ScriptKind::detect("# sbr:unknown\n"), ScriptKind::Other);
    }

    #[test]
    fn test_setup_creates_parent_and_truncates() {
        let script = upload_setup(r"C:\Windows\Temp\winrm-uia\uia_run.ps1");
        assert!(script.contains(r"$p = 'C:\Windows\Temp\winrm-uia\uia_run.ps1'"));
        assert!(script.contains("Split-Path -Parent $p"));
        assert!(script.contains("Remove-Item -Force -LiteralPath $p"));
    }

    #[test]
    fn test_chunk_appends() {
        let script = upload_chunk(r"C:\f.bin", "QUJD");
        assert!(script.contains("$c = 'QUJD'"));
        assert!(script.contains("[IO.FileMode]::Append"));
    }

    #[test]
    fn test_write_input_quotes_json_and_removes_stale_files() {
        let script = write_input(&workspace(), r#"{"action":"sendKeysToWindow","keys":"it's"}"#);
        assert!(script.contains(r#"$json = '{"action":"sendKeysToWindow","keys":"it''s"}'"#));
        assert!(script.contains("Remove-Item -Force -LiteralPath $outPath"));
        assert!(script.contains("Remove-Item -Force -LiteralPath $logPath"));
    }

    #[test]
    fn test_wrapper_script_references_workspace() {
        let script = wrapper_script(&workspace());
        assert!(script.contains(r"$psPath = 'C:\Windows\Temp\winrm-uia\uia_run.ps1'"));
        assert!(script.contains(r"$outPath = 'C:\Windows\Temp\winrm-uia\output.json'"));
        assert!(script.contains("$scriptName = 'uia_run.ps1'"));
        assert!(script.contains("-InputJsonPath $inPath -OutputJsonPath $outPath"));
        assert!(script.contains("' exited with '"));
        assert!(script.contains("exit $code"));
    }

    #[test]
    fn test_create_task_flags() {
        let script = create_task("SBR-UIA-1", r"DOMAIN\user", "p'w", "cmd");
        assert!(script.contains("/SC ONCE"));
        assert!(script.contains("/RL HIGHEST"));
        assert!(script.contains("/IT"));
        assert!(script.contains("$runAsPass = 'p''w'"));
        assert!(script.contains("exit $code"));
    }

    #[test]
    fn test_diag_log_tail_lines() {
        let script = diag_log_tail(r"C:\w\task.log", 200);
        assert!(script.contains("$tail = 200"));
        assert!(script.contains("-Tail $tail"));
    }
}
