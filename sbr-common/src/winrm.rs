//! WS-Management (WinRM) command channel.
//!
//! Each execution opens a remote shell, runs
//! `powershell -NoProfile -NonInteractive -EncodedCommand <script>`, drains
//! stdout and stderr until the command reports `Done`, then signals and
//! deletes the shell. The whole execution is bounded by a command timeout;
//! the shell is deleted on every path. Only HTTP Basic authentication is
//! implemented.

use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use reqwest::StatusCode;
use tracing::{debug, trace, warn};

use crate::channel::{CommandChannel, CommandResult};
use crate::errors::ChannelError;
use crate::powershell::encode_command;
use crate::types::{ChannelConfig, Secret, TransportMode};

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_MS_WSMAN: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WSMan fault raised when a Receive finds no output within the operation timeout.
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";
const MAX_ENVELOPE_SIZE: u32 = 153_600;
/// Pause before re-issuing a Receive that faulted with an operation timeout.
const RECEIVE_RETRY_PAUSE: Duration = Duration::from_millis(100);

static CLIXML_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_x([0-9A-Fa-f]{4})_").expect("clixml escape regex is valid")
});

/// WinRM channel using HTTP Basic authentication.
pub struct WinRmChannel {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: Secret,
    operation_timeout: Duration,
    command_timeout: Duration,
}

impl WinRmChannel {
    pub fn new(config: &ChannelConfig) -> Result<Self, ChannelError> {
        if config.transport != TransportMode::Basic {
            return Err(ChannelError::UnsupportedTransport {
                transport: config.transport,
                reason: "WinRM channels use Basic authentication".to_string(),
            });
        }

        let endpoint = config.winrm_endpoint();
        let client = reqwest::Client::builder()
            .timeout(config.operation_timeout() + Duration::from_secs(10))
            .danger_accept_invalid_certs(config.use_ssl && !config.validate_certs)
            .no_proxy()
            .build()
            .map_err(|e| ChannelError::Connect {
                endpoint: endpoint.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            operation_timeout: config.operation_timeout(),
            command_timeout: config.operation_timeout().max(Duration::from_secs(60)),
        })
    }

    /// Upper bound for one execution, from shell creation to the last Receive.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    escape(id)
                )
            })
            .unwrap_or_default();
        format!(
            concat!(
                r#"<s:Envelope xmlns:s="{ns_s}" xmlns:a="{ns_a}" xmlns:w="{ns_w}" xmlns:p="{ns_p}" xmlns:rsp="{ns_rsp}">"#,
                "<s:Header>",
                "<a:To>{to}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>"#,
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                r#"<p:DataLocale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{options}",
                "</s:Header>",
                "<s:Body>{body}</s:Body>",
                "</s:Envelope>"
            ),
            ns_s = NS_SOAP,
            ns_a = NS_ADDRESSING,
            ns_w = NS_WSMAN,
            ns_p = NS_MS_WSMAN,
            ns_rsp = NS_SHELL,
            to = escape(&self.endpoint),
            max = MAX_ENVELOPE_SIZE,
            id = uuid::Uuid::new_v4().to_string().to_uppercase(),
            timeout = self.operation_timeout.as_secs().max(1),
            resource = RESOURCE_CMD,
            action = action,
            selector = selector,
            options = options,
            body = body,
        )
    }

    /// POST one envelope. A SOAP fault comes back inside the parsed response.
    async fn post(&self, envelope: String) -> Result<WsmanResponse, ChannelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(self.password.expose()))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        trace!(%status, bytes = text.len(), "wsman response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(ChannelError::Auth {
                endpoint: self.endpoint.clone(),
                message: "HTTP 401 (check credentials and that Basic auth is enabled)".to_string(),
            });
        }
        let parsed = parse_response(&text);
        if let Ok(WsmanResponse { fault: Some(_), .. }) = &parsed {
            return parsed;
        }
        if !status.is_success() {
            return Err(ChannelError::Protocol(format!(
                "HTTP {} from {}",
                status, self.endpoint
            )));
        }
        parsed
    }

    async fn send(&self, envelope: String) -> Result<WsmanResponse, ChannelError> {
        let mut response = self.post(envelope).await?;
        match response.fault.take() {
            Some(fault) => Err(ChannelError::Protocol(fault.to_string())),
            None => Ok(response),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> ChannelError {
        if err.is_timeout() {
            ChannelError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.operation_timeout,
            }
        } else {
            ChannelError::Connect {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            }
        }
    }

    fn timed_out(&self) -> ChannelError {
        warn!(endpoint = %self.endpoint, timeout = ?self.command_timeout, "wsman command timed out");
        ChannelError::Timeout {
            endpoint: self.endpoint.clone(),
            timeout: self.command_timeout,
        }
    }

    async fn create_shell(&self) -> Result<String, ChannelError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        self.send(self.envelope(ACTION_CREATE, None, options, body))
            .await?
            .shell_id
            .ok_or_else(|| ChannelError::Protocol("Create response carried no ShellId".to_string()))
    }

    async fn start_command(&self, shell_id: &str, script: &str) -> Result<String, ChannelError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">TRUE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell</rsp:Command><rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {}</rsp:Arguments></rsp:CommandLine>",
            encode_command(script)
        );
        self.send(self.envelope(ACTION_COMMAND, Some(shell_id), options, &body))
            .await?
            .command_id
            .ok_or_else(|| ChannelError::Protocol("Command response carried no CommandId".to_string()))
    }

    async fn receive_all(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> Result<(i32, String, String), ChannelError> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            escape(command_id)
        );
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body);
            let response = self.post(envelope).await?;
            if let Some(fault) = response.fault {
                if fault.code.as_deref() == Some(FAULT_OPERATION_TIMEOUT) {
                    trace!("receive timed out without output, continuing");
                    tokio::time::sleep(RECEIVE_RETRY_PAUSE).await;
                    continue;
                }
                return Err(ChannelError::Protocol(fault.to_string()));
            }
            stdout.extend(response.stdout);
            stderr.extend(response.stderr);
            if response.done {
                let exit_code = response.exit_code.ok_or_else(|| {
                    ChannelError::Protocol("command finished without an ExitCode".to_string())
                })?;
                return Ok((
                    exit_code,
                    String::from_utf8_lossy(&stdout).into_owned(),
                    String::from_utf8_lossy(&stderr).into_owned(),
                ));
            }
        }
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            escape(command_id),
            SIGNAL_TERMINATE
        );
        if let Err(e) = self
            .send(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body))
            .await
        {
            debug!(error = %e, "signal terminate failed");
        }
    }

    async fn delete_shell(&self, shell_id: &str) {
        if let Err(e) = self
            .send(self.envelope(ACTION_DELETE, Some(shell_id), "", ""))
            .await
        {
            debug!(error = %e, "shell delete failed");
        }
    }
}

#[async_trait]
impl CommandChannel for WinRmChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, script: &str) -> Result<CommandResult, ChannelError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.command_timeout;
        let shell_id = tokio::time::timeout_at(deadline, self.create_shell())
            .await
            .map_err(|_| self.timed_out())??;

        let result = match tokio::time::timeout_at(deadline, self.start_command(&shell_id, script)).await {
            Ok(Ok(command_id)) => {
                let output =
                    tokio::time::timeout_at(deadline, self.receive_all(&shell_id, &command_id)).await;
                self.signal_terminate(&shell_id, &command_id).await;
                output
            }
            Ok(Err(e)) => Ok(Err(e)),
            Err(elapsed) => Err(elapsed),
        };
        self.delete_shell(&shell_id).await;

        let (exit_code, stdout, stderr) = result.map_err(|_| self.timed_out())??;
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(endpoint = %self.endpoint, exit_code, duration_ms, "wsman command completed");
        Ok(CommandResult {
            exit_code,
            stdout,
            stderr: clean_clixml(&stderr),
            duration_ms,
        })
    }
}

/// SOAP fault carried by a WS-Man response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Fault {
    /// `WSManFault` code, when the fault has one.
    code: Option<String>,
    message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = if self.message.is_empty() {
            "unknown fault"
        } else {
            &self.message
        };
        match &self.code {
            Some(code) => write!(f, "WSMan fault {}: {}", code, message),
            None => write!(f, "SOAP fault: {}", message),
        }
    }
}

/// The parts of a Create, Command, Receive or fault response the channel uses.
#[derive(Debug, Default, PartialEq, Eq)]
struct WsmanResponse {
    shell_id: Option<String>,
    command_id: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// `CommandState` reported `Done`.
    done: bool,
    exit_code: Option<i32>,
    fault: Option<Fault>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ShellId,
    CommandId,
    Stdout,
    Stderr,
    OtherStream,
    ExitCode,
    FaultText,
}

impl WsmanResponse {
    /// Attribute-only facts: fault markers and the command state.
    fn observe(&mut self, element: &BytesStart<'_>) {
        match element.local_name().as_ref() {
            b"Fault" => {
                self.fault.get_or_insert_with(Fault::default);
            }
            b"WSManFault" => {
                self.fault.get_or_insert_with(Fault::default).code = attribute(element, "Code");
            }
            b"CommandState" => {
                if attribute(element, "State").is_some_and(|state| state.ends_with("/CommandState/Done")) {
                    self.done = true;
                }
            }
            _ => {}
        }
    }

    fn store(&mut self, field: Field, text: &str) -> Result<(), ChannelError> {
        match field {
            Field::ShellId if self.shell_id.is_none() && !text.is_empty() => {
                self.shell_id = Some(text.to_string());
            }
            Field::CommandId if self.command_id.is_none() && !text.is_empty() => {
                self.command_id = Some(text.to_string());
            }
            Field::Stdout | Field::Stderr if !text.is_empty() => {
                let bytes = STANDARD
                    .decode(text)
                    .map_err(|e| ChannelError::Protocol(format!("invalid stream content: {e}")))?;
                if field == Field::Stdout {
                    self.stdout.extend(bytes);
                } else {
                    self.stderr.extend(bytes);
                }
            }
            Field::ExitCode => {
                let code = text
                    .parse()
                    .map_err(|_| ChannelError::Protocol(format!("invalid ExitCode '{text}'")))?;
                self.exit_code = Some(code);
            }
            Field::FaultText => {
                if let Some(fault) = self.fault.as_mut() {
                    if fault.message.is_empty() && !text.is_empty() {
                        fault.message = text.to_string();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn field_for(element: &BytesStart<'_>) -> Option<Field> {
    match element.local_name().as_ref() {
        b"ShellId" => Some(Field::ShellId),
        b"Selector" if attribute(element, "Name").as_deref() == Some("ShellId") => {
            Some(Field::ShellId)
        }
        b"CommandId" => Some(Field::CommandId),
        b"Stream" => Some(match attribute(element, "Name").as_deref() {
            Some("stdout") => Field::Stdout,
            Some("stderr") => Field::Stderr,
            _ => Field::OtherStream,
        }),
        b"ExitCode" => Some(Field::ExitCode),
        b"Message" | b"Text" => Some(Field::FaultText),
        _ => None,
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

fn parse_response(xml: &str) -> Result<WsmanResponse, ChannelError> {
    let mut reader = Reader::from_str(xml);
    let mut response = WsmanResponse::default();
    // Field being captured and the local name of the element that opened it.
    let mut capture: Option<(Field, Vec<u8>)> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                response.observe(&e);
                if capture.is_none() {
                    if let Some(field) = field_for(&e) {
                        capture = Some((field, e.local_name().as_ref().to_vec()));
                        text.clear();
                    }
                }
            }
            Ok(Event::Empty(e)) => response.observe(&e),
            Ok(Event::Text(e)) if capture.is_some() => {
                let chunk = e
                    .unescape()
                    .map_err(|e| ChannelError::Protocol(format!("malformed WS-Man response: {e}")))?;
                text.push_str(&chunk);
            }
            Ok(Event::End(e)) => {
                if let Some((field, name)) = &capture {
                    if e.local_name().as_ref() == name.as_slice() {
                        response.store(*field, text.trim())?;
                        capture = None;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ChannelError::Protocol(format!("malformed WS-Man response: {e}")));
            }
            _ => {}
        }
    }
    Ok(response)
}

/// Turn a PowerShell CLIXML error stream into plain text.
pub fn clean_clixml(stderr: &str) -> String {
    let Some(rest) = stderr.trim_start().strip_prefix("#< CLIXML") else {
        return stderr.to_string();
    };
    let mut reader = Reader::from_str(rest);
    let mut text = String::new();
    let mut in_error = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"S" => {
                in_error = attribute(&e, "S").as_deref() == Some("Error");
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"S" => in_error = false,
            Ok(Event::Text(e)) if in_error => match e.unescape() {
                Ok(chunk) => text.push_str(&chunk),
                Err(_) => return stderr.to_string(),
            },
            Ok(Event::Eof) => break,
            Err(_) => return stderr.to_string(),
            _ => {}
        }
    }
    CLIXML_ESCAPE_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        })
        .trim_end()
        .to_string()
}
