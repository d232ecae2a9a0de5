//! Action requests and output artifacts.
//!
//! The request is the small JSON object written to the input file; the
//! output artifact is the fixed four-field object the wrapper or the action
//! script writes back. Output that does not parse, or that violates the
//! artifact invariants, becomes [`ActionOutcome::Malformed`] rather than an
//! error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which desktop action the opaque script performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    ListTopWindows,
    SendKeysToWindow,
    OpenOutlookEmail,
}

impl ActionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ListTopWindows => "listTopWindows",
            Self::SendKeysToWindow => "sendKeysToWindow",
            Self::OpenOutlookEmail => "openOutlookEmail",
        }
    }

    /// Actions that start a desktop application get the long deadline.
    pub const fn is_slow(&self) -> bool {
        matches!(self, Self::OpenOutlookEmail)
    }

    pub const fn allowed_fields(&self) -> &'static [ActionField] {
        match self {
            Self::ListTopWindows => &[],
            Self::SendKeysToWindow => &[ActionField::WindowName, ActionField::Keys],
            Self::OpenOutlookEmail => &[ActionField::FolderPath, ActionField::SubjectContains],
        }
    }

    pub const fn all() -> &'static [ActionKind] {
        &[
            Self::ListTopWindows,
            Self::SendKeysToWindow,
            Self::OpenOutlookEmail,
        ]
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ActionError::UnknownAction(s.to_string()))
    }
}

/// Optional string parameters an action may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionField {
    WindowName,
    Keys,
    FolderPath,
    SubjectContains,
}

impl ActionField {
    /// JSON key in the input file.
    pub const fn key(&self) -> &'static str {
        match self {
            Self::WindowName => "windowName",
            Self::Keys => "keys",
            Self::FolderPath => "folderPath",
            Self::SubjectContains => "subjectContains",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        [Self::WindowName, Self::Keys, Self::FolderPath, Self::SubjectContains]
            .into_iter()
            .find(|field| field.key() == key)
    }
}

impl fmt::Display for ActionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' is not accepted by {action}")]
    FieldNotAllowed { action: ActionKind, field: ActionField },
}

/// Typed request for one invocation.
///
/// Only fields the action accepts are ever stored, and absent or empty
/// values are omitted instead of being sent as empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: ActionKind,
    fields: BTreeMap<ActionField, String>,
}

impl ActionRequest {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            fields: BTreeMap::new(),
        }
    }

    /// Set a field; `None` or an empty string leaves it absent.
    pub fn with_field(
        mut self,
        field: ActionField,
        value: Option<impl Into<String>>,
    ) -> Result<Self, ActionError> {
        if !self.action.allowed_fields().contains(&field) {
            return Err(ActionError::FieldNotAllowed {
                action: self.action,
                field,
            });
        }
        match value.map(Into::into) {
            Some(value) if !value.is_empty() => {
                self.fields.insert(field, value);
            }
            _ => {
                self.fields.remove(&field);
            }
        }
        Ok(self)
    }

    /// Build from raw key/value pairs, rejecting unknown keys.
    pub fn from_pairs<'a>(
        action: ActionKind,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ActionError> {
        pairs.into_iter().try_fold(Self::new(action), |request, (key, value)| {
            let field = ActionField::from_key(key)
                .ok_or_else(|| ActionError::UnknownField(key.to_string()))?;
            request.with_field(field, Some(value))
        })
    }

    pub fn field(&self, field: ActionField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (ActionField, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("action".to_string(), Value::from(self.action.as_str()));
        for (field, value) in &self.fields {
            map.insert(field.key().to_string(), Value::from(value.as_str()));
        }
        Value::Object(map)
    }

    /// Compact JSON for the input file, e.g. `{"action":"listTopWindows"}`.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

/// The four-field result object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub ok: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl OutputArtifact {
    pub fn success(action: ActionKind, data: Value) -> Self {
        Self {
            ok: true,
            action: Some(action.as_str().to_string()),
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(action: Option<ActionKind>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            action: action.map(|a| a.as_str().to_string()),
            error: Some(error.into()),
            data: None,
        }
    }

    fn invariant_violation(&self) -> Option<&'static str> {
        match (self.ok, self.error.as_deref()) {
            (false, None) => Some("ok is false but error is missing"),
            (false, Some(e)) if e.trim().is_empty() => Some("ok is false but error is empty"),
            (true, Some(_)) => Some("ok is true but error is set"),
            _ => None,
        }
    }
}

/// Output text that is not a well-formed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedResult {
    pub raw: String,
    pub reason: String,
}

/// Caller-facing result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The action reported success; `data` is its result.
    Succeeded { artifact: OutputArtifact },
    /// The action (or the wrapper on its behalf) reported failure.
    Failed { artifact: OutputArtifact },
    /// The output was not a well-formed artifact.
    Malformed(MalformedResult),
}

impl ActionOutcome {
    pub fn artifact(&self) -> Option<&OutputArtifact> {
        match self {
            Self::Succeeded { artifact } | Self::Failed { artifact } => Some(artifact),
            Self::Malformed(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Decode output file content.
///
/// Tolerates a UTF-8 byte order mark and surrounding whitespace, which
/// `Set-Content -Encoding UTF8` produces on Windows PowerShell.
pub fn decode_output(raw: &str) -> ActionOutcome {
    let text = raw.trim_start_matches('\u{feff}').trim();
    let artifact: OutputArtifact = match serde_json::from_str(text) {
        Ok(artifact) => artifact,
        Err(e) => {
            return ActionOutcome::Malformed(MalformedResult {
                raw: raw.to_string(),
                reason: e.to_string(),
            });
        }
    };
    if let Some(reason) = artifact.invariant_violation() {
        return ActionOutcome::Malformed(MalformedResult {
            raw: raw.to_string(),
            reason: reason.to_string(),
        });
    }
    if artifact.ok {
        ActionOutcome::Succeeded { artifact }
    } else {
        ActionOutcome::Failed { artifact }
    }
}
