//! Shared helpers for sbr binary tests.

#![allow(dead_code)]

pub mod logging;

pub use logging::init_test_logging;

#[ctor::ctor]
fn setup() {
    init_test_logging();
}

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;

/// Get the path to the sbr binary.
pub fn sbr_binary() -> String {
    std::env::var("SBR_BINARY").unwrap_or_else(|_| env!("CARGO_BIN_EXE_sbr").to_string())
}

/// Exit code, stdout and stderr of one run.
#[derive(Debug)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    /// Parse stdout as a single JSON document.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}):\n{}", self.stdout))
    }
}

/// Isolated working directory with an action script and no user config.
pub struct Sandbox {
    pub dir: TempDir,
    env: Vec<(String, String)>,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create sandbox");
        std::fs::write(dir.path().join("uia_run.ps1"), "# action script\r\n").expect("write script");
        Self {
            dir,
            env: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn script(&self) -> PathBuf {
        self.path().join("uia_run.ps1")
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn write(&self, name: &str, content: &str) {
        std::fs::write(self.path().join(name), content).expect("write sandbox file");
    }

    /// Run sbr with a cleared environment rooted in the sandbox.
    pub fn run(&self, args: &[&str]) -> RunOutput {
        let sbr = sbr_binary();
        let output = Command::new(&sbr)
            .args(args)
            .current_dir(self.path())
            .env_clear()
            .env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path().join(".config"))
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .unwrap_or_else(|e| panic!("Failed to run {}: {}", sbr, e));

        RunOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    /// Run against a mock host with the sandbox action script.
    pub fn run_mock(&self, args: &[&str]) -> RunOutput {
        let script = self.script();
        let script = script.to_string_lossy();
        let mut full = vec![
            "--host",
            "mock://lab",
            "--user",
            "LAB\\operator",
            "--script",
            script.as_ref(),
        ];
        full.extend_from_slice(args);
        self.run(&full)
    }
}
