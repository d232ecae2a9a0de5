//! Shared utilities for the session bridge.

use regex::Regex;
use std::sync::LazyLock;

static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\$(\w+)(\s*=\s*)'((?:[^']|'')*)'").expect("assignment regex is valid")
});

const SENSITIVE_NAME_PARTS: [&str; 4] = ["pass", "secret", "token", "credential"];

/// Mask sensitive assignments in a generated script before logging.
///
/// Scripts declare their inputs as `$name = '<value>'`; any variable whose
/// name looks like a password, secret or token has its value replaced with
/// `***` while the variable name stays visible.
pub fn mask_sensitive_script(script: &str) -> String {
    ASSIGNMENT_RE
        .replace_all(script, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let lowered = name.to_lowercase();
            if SENSITIVE_NAME_PARTS.iter().any(|part| lowered.contains(part)) {
                format!("${}{}'***'", name, &caps[2])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Shorten long text for log fields, keeping the head.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}... ({} chars)", head, text.chars().count())
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_sensitive_script() {
        let script = "$taskName = 'SBR-UIA-1'\n$runAsUser = 'DOMAIN\\u'\n$runAsPass = 'hunter2'\n";
        let masked = mask_sensitive_script(script);
        assert!(masked.contains("$runAsPass = '***'"));
        assert!(!masked.contains("hunter2"));
        assert!(masked.contains("$taskName = 'SBR-UIA-1'"));
        assert!(masked.contains("$runAsUser = 'DOMAIN\\u'"));
    }

    #[test]
    fn test_mask_handles_doubled_quotes() {
        let masked = mask_sensitive_script("$password = 'it''s secret'\n$x = 'y'");
        assert_eq!(masked, "$password = '***'\n$x = 'y'");
    }

    #[test]
    fn test_mask_leaves_plain_scripts_alone() {
        let script = "whoami";
        assert_eq!(mask_sensitive_script(script), script);
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdefghij", 4), "abcd... (10 chars)");
    }
}
