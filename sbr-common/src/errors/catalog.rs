//! Error Catalog for Session Bridge
//!
//! Every failure the bridge can surface maps to a stable code in the
//! `SBR-Exxx` format together with a short message and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration, credentials, local inputs |
//! | E100-E199  | Channel     | Remote command channel (WinRM / SSH)     |
//! | E200-E299  | Upload      | Chunked transfer of workspace artifacts  |
//! | E300-E399  | Schedule    | Scheduled task creation and trigger      |
//! | E400-E499  | Poll        | Completion polling and timeouts          |
//! | E500-E599  | Result      | Output artifact and action results       |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all bridge error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// No target host configured
    ConfigMissingHost,
    /// Username or password missing
    ConfigMissingCredentials,
    /// Local action script could not be read
    ActionScriptNotFound,
    /// Request field not allowed for the action
    InvalidActionField,

    // =========================================================================
    // Channel Errors (E100-E199)
    // =========================================================================
    /// Could not reach the remote management endpoint
    ChannelConnectFailed,
    /// Remote endpoint rejected the credentials
    ChannelAuthFailed,
    /// Remote operation timed out
    ChannelTimeout,
    /// Remote endpoint answered with an unexpected or faulted response
    ChannelProtocolError,
    /// Requested transport is not available in this build
    ChannelUnsupportedTransport,
    /// Remote check command exited non-zero
    ChannelCheckFailed,

    // =========================================================================
    // Upload Errors (E200-E299)
    // =========================================================================
    /// Workspace directory or target file could not be prepared
    UploadSetupFailed,
    /// Appending a chunk failed
    UploadChunkFailed,
    /// Writing the input file failed
    UploadInputFailed,
    /// Writing the wrapper script failed
    UploadWrapperFailed,

    // =========================================================================
    // Schedule Errors (E300-E399)
    // =========================================================================
    /// Task command or name rejected before contacting the host
    ScheduleValidationFailed,
    /// Task creation failed
    ScheduleCreateFailed,
    /// Task trigger failed
    ScheduleTriggerFailed,

    // =========================================================================
    // Poll Errors (E400-E499)
    // =========================================================================
    /// Channel failed while polling for output
    PollChannelFailed,
    /// No output within the deadline
    PollTimeout,

    // =========================================================================
    // Result Errors (E500-E599)
    // =========================================================================
    /// Output file did not contain a well-formed artifact
    ResultMalformed,
    /// Action reported failure
    ActionFailed,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigMissingHost => 6,
            Self::ConfigMissingCredentials => 7,
            Self::ActionScriptNotFound => 8,
            Self::InvalidActionField => 9,

            Self::ChannelConnectFailed => 100,
            Self::ChannelAuthFailed => 101,
            Self::ChannelTimeout => 102,
            Self::ChannelProtocolError => 103,
            Self::ChannelUnsupportedTransport => 104,
            Self::ChannelCheckFailed => 105,

            Self::UploadSetupFailed => 200,
            Self::UploadChunkFailed => 201,
            Self::UploadInputFailed => 202,
            Self::UploadWrapperFailed => 203,

            Self::ScheduleValidationFailed => 300,
            Self::ScheduleCreateFailed => 301,
            Self::ScheduleTriggerFailed => 302,

            Self::PollChannelFailed => 400,
            Self::PollTimeout => 401,

            Self::ResultMalformed => 500,
            Self::ActionFailed => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "SBR-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("SBR-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Channel,
            200..=299 => ErrorCategory::Upload,
            300..=399 => ErrorCategory::Schedule,
            400..=499 => ErrorCategory::Poll,
            _ => ErrorCategory::Result,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigMissingHost => "No target host configured",
            Self::ConfigMissingCredentials => "Username or password missing",
            Self::ActionScriptNotFound => "Action script could not be read",
            Self::InvalidActionField => "Field is not accepted by this action",

            Self::ChannelConnectFailed => "Could not reach the remote management endpoint",
            Self::ChannelAuthFailed => "Remote endpoint rejected the credentials",
            Self::ChannelTimeout => "Remote operation timed out",
            Self::ChannelProtocolError => "Remote endpoint returned an unexpected response",
            Self::ChannelUnsupportedTransport => "Transport is not supported by this build",
            Self::ChannelCheckFailed => "Connectivity check exited with a non-zero code",

            Self::UploadSetupFailed => "Failed to prepare the remote workspace",
            Self::UploadChunkFailed => "Failed to append an upload chunk",
            Self::UploadInputFailed => "Failed to write the input file",
            Self::UploadWrapperFailed => "Failed to write the wrapper script",

            Self::ScheduleValidationFailed => "Scheduled task definition is invalid",
            Self::ScheduleCreateFailed => "Failed to create the scheduled task",
            Self::ScheduleTriggerFailed => "Failed to start the scheduled task",

            Self::PollChannelFailed => "Channel failed while waiting for output",
            Self::PollTimeout => "No output produced before the deadline",

            Self::ResultMalformed => "Output file is not a well-formed result",
            Self::ActionFailed => "Action reported a failure",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check the path passed to --config",
                "Omit --config to run with built-in defaults",
            ],
            Self::ConfigReadError => &[
                "Check file permissions on the configuration file",
                "Make sure the path points to a file and not a directory",
            ],
            Self::ConfigParseError => &[
                "Validate the TOML syntax of the configuration file",
                "Remove unknown or misspelled keys",
            ],
            Self::ConfigValidationError => &[
                "Check numeric values are within their documented ranges",
                "Make sure workspace_dir is an absolute Windows path",
            ],
            Self::ConfigEnvError => &[
                "Check SBR_* environment variables for typos",
                "Unset the variable to fall back to the default",
            ],
            Self::ConfigMissingHost => &[
                "Pass --host or set SBR_HOST",
                "Add SBR_HOST to a .sbr.env or .env file",
            ],
            Self::ConfigMissingCredentials => &[
                "Pass --user / --password or set SBR_USER / SBR_PASSWORD",
                "Run interactively to be prompted for the password",
            ],
            Self::ActionScriptNotFound => &[
                "Check the path passed to --script",
                "The script is uploaded verbatim and must exist locally",
            ],
            Self::InvalidActionField => &[
                "Only pass fields the selected action accepts",
                "Run with --help to list the fields per action",
            ],

            Self::ChannelConnectFailed => &[
                "Verify the host is reachable: Test-NetConnection <host> -Port 5985",
                "Run 'winrm quickconfig' on the target host",
                "Check firewall rules for the WinRM or SSH port",
            ],
            Self::ChannelAuthFailed => &[
                "Verify username and password",
                "Enable Basic auth: winrm set winrm/config/service/auth @{Basic=\"true\"}",
                "Use HTTPS when Basic auth is restricted to encrypted traffic",
            ],
            Self::ChannelTimeout => &[
                "Increase the operation timeout",
                "Check the target host is not overloaded",
            ],
            Self::ChannelProtocolError => &[
                "Make sure the endpoint is a WS-Management listener (/wsman)",
                "Allow unencrypted traffic or switch to HTTPS",
            ],
            Self::ChannelUnsupportedTransport => &[
                "Use transport 'basic' or 'ssh'",
            ],
            Self::ChannelCheckFailed => &[
                "Check the account may run PowerShell remotely",
            ],

            Self::UploadSetupFailed => &[
                "Check the account may create the workspace directory",
                "Check no other process holds the target file open",
            ],
            Self::UploadChunkFailed => &[
                "Retry the invocation; uploads restart from the beginning",
                "Check free disk space on the target host",
            ],
            Self::UploadInputFailed => &[
                "Check write permissions on the workspace directory",
            ],
            Self::UploadWrapperFailed => &[
                "Check write permissions on the workspace directory",
            ],

            Self::ScheduleValidationFailed => &[
                "Shorten workspace_dir or wrapper_script_name",
                "Task commands are limited to 261 characters",
            ],
            Self::ScheduleCreateFailed => &[
                "Verify the run-as user and password",
                "The run-as account needs 'Log on as a batch job'",
                "Run 'schtasks /Query' on the host to inspect existing tasks",
            ],
            Self::ScheduleTriggerFailed => &[
                "Make sure the run-as user is logged on interactively",
                "Check the Task Scheduler service is running",
            ],

            Self::PollChannelFailed => &[
                "Check connectivity to the host",
                "Retry the invocation",
            ],
            Self::PollTimeout => &[
                "Make sure the run-as user has an active desktop session",
                "Read the diagnostics section of the error for the task log",
                "Raise the deadline for slow applications",
            ],

            Self::ResultMalformed => &[
                "Make sure the action script writes a single JSON object",
                "Write the output file as UTF-8",
            ],
            Self::ActionFailed => &[
                "Read the error text reported by the action",
            ],
        }
    }

    /// Returns all defined error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigMissingHost,
            Self::ConfigMissingCredentials,
            Self::ActionScriptNotFound,
            Self::InvalidActionField,
            Self::ChannelConnectFailed,
            Self::ChannelAuthFailed,
            Self::ChannelTimeout,
            Self::ChannelProtocolError,
            Self::ChannelUnsupportedTransport,
            Self::ChannelCheckFailed,
            Self::UploadSetupFailed,
            Self::UploadChunkFailed,
            Self::UploadInputFailed,
            Self::UploadWrapperFailed,
            Self::ScheduleValidationFailed,
            Self::ScheduleCreateFailed,
            Self::ScheduleTriggerFailed,
            Self::PollChannelFailed,
            Self::PollTimeout,
            Self::ResultMalformed,
            Self::ActionFailed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and local input errors (E001-E099)
    Config,
    /// Remote command channel errors (E100-E199)
    Channel,
    /// Chunked transfer errors (E200-E299)
    Upload,
    /// Scheduled task errors (E300-E399)
    Schedule,
    /// Completion polling errors (E400-E499)
    Poll,
    /// Output artifact errors (E500-E599)
    Result,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Channel => "Channel",
            Self::Upload => "Upload",
            Self::Schedule => "Schedule",
            Self::Poll => "Poll",
            Self::Result => "Result",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "SBR-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            assert!(
                seen.insert(code.code_number()),
                "duplicate code number for {:?}",
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "SBR-E001");
        assert_eq!(ErrorCode::ChannelAuthFailed.code_string(), "SBR-E101");
        assert_eq!(ErrorCode::PollTimeout.code_string(), "SBR-E401");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let num = code.code_number();
            match code.category() {
                ErrorCategory::Config => assert!(num < 100, "{:?}", code),
                ErrorCategory::Channel => assert!((100..200).contains(&num), "{:?}", code),
                ErrorCategory::Upload => assert!((200..300).contains(&num), "{:?}", code),
                ErrorCategory::Schedule => assert!((300..400).contains(&num), "{:?}", code),
                ErrorCategory::Poll => assert!((400..500).contains(&num), "{:?}", code),
                ErrorCategory::Result => assert!(num >= 500, "{:?}", code),
            }
        }
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{:?} has no message", code);
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation",
                code
            );
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::ScheduleCreateFailed).unwrap();
        assert_eq!(json, "\"SCHEDULE_CREATE_FAILED\"");
        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorCode::ScheduleCreateFailed);
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::PollTimeout.entry();
        let full = entry.format_full();
        assert!(full.contains("[SBR-E401]"));
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("  1. "));
        assert_eq!(
            entry.format_brief(),
            "[SBR-E401] No output produced before the deadline"
        );
        assert_eq!(format!("{}", ErrorCategory::Poll), "Poll");
    }
}
