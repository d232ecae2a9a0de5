//! Session Bridge CLI
//!
//! Runs one desktop action inside the interactive session of a remote
//! Windows host and prints the caller-facing result as JSON on stdout.
//! Logs and failure details go to stderr.

#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use config::{ConfigError, Overrides, Settings};
use sbr_common::{
    ActionField, ActionKind, ActionOutcome, ActionRequest, Bridge, BridgeError, BridgeStage,
    ErrorCode, Invocation, InvocationReport, LogConfig, TransportMode, connect_channel,
    init_logging,
};

/// Exit code for local configuration problems.
const EXIT_CONFIG: i32 = 2;
/// Exit code when the action itself reported failure.
const EXIT_ACTION_FAILED: i32 = 1;

#[derive(Parser)]
#[command(name = "sbr")]
#[command(
    author,
    version,
    about = "Session Bridge - run desktop actions in a remote interactive session",
    long_about = "Session Bridge uploads an action script to a Windows host over WinRM or \
                  OpenSSH, runs it as a one-shot scheduled task inside the logged-on user's \
                  interactive session, and returns the JSON result the script writes.",
    after_help = r#"EXAMPLES:
    # Check connectivity and show the remote identity
    sbr --host 10.0.0.42 --user 'LAB\operator' check

    # List top-level windows on the interactive desktop
    sbr --host 10.0.0.42 --script ./uia_run.ps1 list-windows

    # Type into a window
    sbr send-keys --window-name 'Untitled - Notepad' --keys 'hello{ENTER}'

    # Open the newest matching mail (slow action, 180s deadline)
    sbr open-outlook-email --subject-contains invoice

    # Show where config values come from
    sbr config show --sources

EXIT CODES:
    0   action succeeded
    1   action reported failure (ok: false)
    2   configuration error
    10  connect failed         13  channel failed while polling
    11  upload failed          14  no output before the deadline
    12  scheduling failed      15  output was not a well-formed result

ENVIRONMENT VARIABLES:
    SBR_HOST, SBR_PORT, SBR_TRANSPORT (basic|ssh), SBR_USE_SSL, SBR_VALIDATE_CERTS
    SBR_USER, SBR_PASSWORD        Channel credentials
    SBR_RUN_AS_USER, SBR_RUN_AS_PASSWORD
                                  Interactive user (defaults to the channel credentials)
    SBR_ACTION_SCRIPT             Path to the action script
    SBR_WORKSPACE_DIR, SBR_PER_INVOCATION_WORKSPACE, SBR_CHUNK_SIZE, SBR_DEADLINE
    SBR_OPERATION_TIMEOUT_SECS    WS-Management operation timeout
    SBR_CONFIG                    Config file (default ~/.config/sbr/config.toml)
    SBR_LOG_LEVEL, SBR_LOG_FORMAT, SBR_LOG_FILE, SBR_LOG_TARGETS

CONFIG PRECEDENCE (highest to lowest):
    1. Command-line arguments
    2. Environment variables
    3. .sbr.env / .env files in the working directory
    4. Config file
    5. Built-in defaults
"#
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Print the full invocation report instead of the action result
    #[arg(long, global = true)]
    report: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Config file path
    #[arg(long = "config", id = "config_file", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Target host (use mock://<name> for the in-memory test host)
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    /// Channel transport: basic or ssh
    #[arg(long, global = true)]
    transport: Option<TransportMode>,

    /// Use HTTPS for WinRM
    #[arg(long, global = true)]
    ssl: bool,

    /// Validate the server certificate with --ssl
    #[arg(long, global = true)]
    validate_certs: bool,

    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Interactive session user the task runs as
    #[arg(long, global = true)]
    run_as_user: Option<String>,

    #[arg(long, global = true)]
    run_as_password: Option<String>,

    /// Action script to upload
    #[arg(long, global = true, value_name = "PATH")]
    script: Option<PathBuf>,

    /// Remote workspace directory
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// Give each invocation its own workspace subdirectory
    #[arg(long, global = true)]
    per_invocation_workspace: bool,

    /// Base64 characters per upload chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Override the action deadline (e.g. 45s, 3m)
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    deadline: Option<Duration>,
}

impl ConnectionArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            config: self.config.clone(),
            host: self.host.clone(),
            port: self.port,
            transport: self.transport,
            use_ssl: self.ssl.then_some(true),
            validate_certs: self.validate_certs.then_some(true),
            user: self.user.clone(),
            password: self.password.clone(),
            run_as_user: self.run_as_user.clone(),
            run_as_password: self.run_as_password.clone(),
            action_script: self.script.clone(),
            workspace_dir: self.workspace.clone(),
            per_invocation_workspace: self.per_invocation_workspace.then_some(true),
            chunk_size: self.chunk_size,
            deadline: self.deadline,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List top-level windows in the interactive session
    ListWindows,

    /// Send keystrokes to a window
    SendKeys {
        /// Window title to activate
        #[arg(long)]
        window_name: Option<String>,

        /// Keys in SendKeys notation
        #[arg(long)]
        keys: Option<String>,
    },

    /// Open the newest Outlook mail in a folder
    OpenOutlookEmail {
        /// Folder path below the default store
        #[arg(long, default_value = r"Inbox\RPA")]
        folder_path: String,

        /// Only consider mails whose subject contains this text
        #[arg(long)]
        subject_contains: Option<String>,
    },

    /// Run any action with raw fields
    Run {
        /// Action name (listTopWindows, sendKeysToWindow, openOutlookEmail)
        action: String,

        /// Request field as key=value (repeatable)
        #[arg(long = "field", value_name = "KEY=VALUE", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Check connectivity and print the identity the channel runs as
    Check,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective configuration
    Show {
        /// Show where each value came from
        #[arg(long)]
        sources: bool,
    },

    /// Write an example config file to the user config directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_field(value: &str) -> std::result::Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs always go to stderr; stdout carries only the JSON result.
    let mut log_config = LogConfig::from_env("warn");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    } else if cli.quiet {
        log_config = log_config.with_level("error");
    }
    let guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("sbr: logging disabled: {e:#}");
            None
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    drop(guards);
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to determine working directory")?;
    let mut settings = Settings::resolve(&cli.connection.overrides(), &cwd)?;
    debug!(config_file = ?settings.config_file, host = %settings.channel.host, "configuration resolved");

    let request = match cli.command {
        Commands::Config { action } => return config_command(action, &settings),
        Commands::Check => return check(&mut settings).await,
        Commands::ListWindows => ActionRequest::new(ActionKind::ListTopWindows),
        Commands::SendKeys { window_name, keys } => ActionRequest::new(ActionKind::SendKeysToWindow)
            .with_field(ActionField::WindowName, window_name)
            .and_then(|r| r.with_field(ActionField::Keys, keys))
            .map_err(ConfigError::from)?,
        Commands::OpenOutlookEmail {
            folder_path,
            subject_contains,
        } => ActionRequest::new(ActionKind::OpenOutlookEmail)
            .with_field(ActionField::FolderPath, Some(folder_path))
            .and_then(|r| r.with_field(ActionField::SubjectContains, subject_contains))
            .map_err(ConfigError::from)?,
        Commands::Run { action, fields } => {
            let kind: ActionKind = action.parse().map_err(ConfigError::from)?;
            ActionRequest::from_pairs(kind, fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .map_err(ConfigError::from)?
        }
    };

    invoke(&mut settings, request, cli.report).await
}

async fn connect(settings: &Settings) -> Result<Bridge, BridgeError> {
    let channel = connect_channel(&settings.channel)
        .await
        .map_err(|e| BridgeError::channel(BridgeStage::Connect, e))?;
    Ok(Bridge::new(channel, settings.bridge.clone()))
}

async fn check(settings: &mut Settings) -> Result<i32> {
    settings.require_credentials(true)?;
    let bridge = connect(settings).await?;
    let identity = bridge.check().await?;
    let output = json!({
        "ok": true,
        "endpoint": bridge.channel().endpoint(),
        "identity": identity,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}

async fn invoke(settings: &mut Settings, request: ActionRequest, report: bool) -> Result<i32> {
    settings.require_credentials(true)?;
    let script = settings.read_action_script()?;
    let bridge = connect(settings).await?;

    let mut invocation = Invocation::new(request, script, settings.run_as());
    if let Some(deadline) = settings.deadline {
        invocation = invocation.with_deadline(deadline);
    }
    let result = bridge.invoke(&invocation).await?;
    info!(
        task = %result.task_name,
        polls = result.poll_attempts,
        total_ms = result.timings.total_ms,
        "invocation complete"
    );

    let output = if report {
        serde_json::to_string_pretty(&result)?
    } else {
        render_outcome(&result)?
    };
    println!("{output}");
    Ok(outcome_exit_code(&result.outcome))
}

fn render_outcome(result: &InvocationReport) -> Result<String> {
    match &result.outcome {
        ActionOutcome::Succeeded { artifact } | ActionOutcome::Failed { artifact } => {
            Ok(serde_json::to_string_pretty(artifact)?)
        }
        ActionOutcome::Malformed(malformed) => {
            eprintln!(
                "sbr: {}: {}",
                ErrorCode::ResultMalformed.entry().format_brief(),
                malformed.reason
            );
            Ok(serde_json::to_string_pretty(&json!({
                "ok": false,
                "action": null,
                "error": format!("malformed output: {}", malformed.reason),
                "data": { "raw": malformed.raw },
            }))?)
        }
    }
}

fn outcome_exit_code(outcome: &ActionOutcome) -> i32 {
    match outcome {
        ActionOutcome::Succeeded { .. } => 0,
        ActionOutcome::Failed { artifact } => {
            debug!(
                code = %ErrorCode::ActionFailed.code_string(),
                error = artifact.error.as_deref().unwrap_or_default(),
                "action reported failure"
            );
            EXIT_ACTION_FAILED
        }
        ActionOutcome::Malformed(_) => BridgeStage::Parse.exit_code(),
    }
}

fn config_command(action: ConfigAction, settings: &Settings) -> Result<i32> {
    match action {
        ConfigAction::Show { sources } => {
            match &settings.config_file {
                Some(path) => println!("# config file: {}", path.display()),
                None => println!("# config file: <none>"),
            }
            let width = settings.entries.iter().map(|e| e.key.len()).max().unwrap_or(0);
            for entry in &settings.entries {
                if sources {
                    let origin = match &entry.env_var {
                        Some(var) => format!("{} ({})", entry.source, var),
                        None => entry.source.to_string(),
                    };
                    println!("{:width$} = {:<32} # {}", entry.key, entry.value, origin);
                } else {
                    println!("{:width$} = {}", entry.key, entry.value);
                }
            }
            Ok(0)
        }
        ConfigAction::Init { force } => {
            let dir = config::config_dir().context("no user config directory on this platform")?;
            let path = dir.join("config.toml");
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            std::fs::write(&path, config::example_config())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{}", path.display());
            Ok(0)
        }
    }
}

/// Print a failure to stderr and pick the exit code.
fn report_error(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<BridgeError>() {
        eprintln!("sbr: {e}");
        eprintln!("stage: {}", e.stage());
        eprint!("{}", e.code().entry().format_full());
        return e.stage().exit_code();
    }
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        eprintln!("sbr: {e}");
        eprint!("{}", e.code().entry().format_full());
        return EXIT_CONFIG;
    }
    eprintln!("sbr: {err:#}");
    EXIT_ACTION_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sbr_common::OutputArtifact;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("windowName=Untitled - Notepad").unwrap(),
            ("windowName".to_string(), "Untitled - Notepad".to_string())
        );
        assert_eq!(parse_field("keys=a=b").unwrap().1, "a=b");
        assert!(parse_field("keys").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn test_outlook_folder_default() {
        let cli = Cli::try_parse_from(["sbr", "open-outlook-email"]).unwrap();
        match cli.command {
            Commands::OpenOutlookEmail { folder_path, .. } => assert_eq!(folder_path, r"Inbox\RPA"),
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sbr",
            "list-windows",
            "--host",
            "mock://lab",
            "--deadline",
            "45s",
            "--ssl",
        ])
        .unwrap();
        let overrides = cli.connection.overrides();
        assert_eq!(overrides.host.as_deref(), Some("mock://lab"));
        assert_eq!(overrides.deadline, Some(Duration::from_secs(45)));
        assert_eq!(overrides.use_ssl, Some(true));
        assert_eq!(overrides.validate_certs, None);
    }

    #[test]
    fn test_outcome_exit_codes() {
        let ok = ActionOutcome::Succeeded {
            artifact: OutputArtifact::success(ActionKind::ListTopWindows, json!({})),
        };
        let failed = ActionOutcome::Failed {
            artifact: OutputArtifact::failure(None, "uia_run.ps1 exited with 1"),
        };
        assert_eq!(outcome_exit_code(&ok), 0);
        assert_eq!(outcome_exit_code(&failed), EXIT_ACTION_FAILED);
    }

    #[test]
    fn test_report_error_exit_codes() {
        let err = anyhow::Error::new(ConfigError::MissingHost);
        assert_eq!(report_error(&err), EXIT_CONFIG);

        let err = anyhow::Error::new(BridgeError::Check {
            exit_code: 1,
            stderr: "denied".to_string(),
        });
        assert_eq!(report_error(&err), BridgeStage::Connect.exit_code());
    }
}
