//! .env file support.
//!
//! Loads `SBR_` settings from `.sbr.env` and `.env` in a directory.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

const PREFIX: &str = "SBR_";

/// Parse bridge settings from `.sbr.env` and `.env` in `dir`.
///
/// `.sbr.env` is read first, then `.env`. Only `SBR_` keys are kept, and
/// keys already present in the process environment are skipped. When both
/// files set a key the first one wins.
///
/// Returns the pairs to apply; the environment itself is not modified.
pub fn load_dotenv(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut loaded: Vec<(String, String)> = Vec::new();

    for file_name in [".sbr.env", ".env"] {
        let path = dir.join(file_name);
        if !path.exists() {
            continue;
        }
        debug!("Parsing {} from {:?}", file_name, path);
        for (key, value) in parse_env_file(&path)? {
            if !key.starts_with(PREFIX)
                || std::env::var_os(&key).is_some()
                || loaded.iter().any(|(k, _)| *k == key)
            {
                continue;
            }
            debug!("  {} loaded from {}", key, file_name);
            loaded.push((key, value));
        }
    }

    Ok(loaded)
}

/// Parse a .env file into key-value pairs.
fn parse_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(parse_env_content(&content))
}

fn parse_env_content(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();

        let value = if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value[1..value.len() - 1].to_string()
        } else {
            // Unquoted values may carry an inline comment.
            value.split(" #").next().unwrap_or("").trim().to_string()
        };

        if key.is_empty() {
            debug!("Skipping empty key at line {}", line_num + 1);
            continue;
        }
        vars.push((key, value));
    }

    vars
}

/// Check if any .env files exist in `dir`.
pub fn has_dotenv_files(dir: &Path) -> bool {
    dir.join(".sbr.env").exists() || dir.join(".env").exists()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::fs;
    use tempfile::TempDir;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe { std::env::set_var(key, value) };
    }

    fn remove_env(key: &str) {
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn test_parse_basic_and_comments() {
        let vars = parse_env_content("# header\nSBR_HOST=10.0.0.42\n\nSBR_PORT=5986 # https\n");
        assert_eq!(
            vars,
            vec![
                ("SBR_HOST".to_string(), "10.0.0.42".to_string()),
                ("SBR_PORT".to_string(), "5986".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_and_export() {
        let vars = parse_env_content(
            "export SBR_RUN_AS_USER=\"DOMAIN\\desk user\"\nSBR_PASSWORD='p#ss word'\n",
        );
        assert_eq!(vars[0], ("SBR_RUN_AS_USER".to_string(), "DOMAIN\\desk user".to_string()));
        assert_eq!(vars[1], ("SBR_PASSWORD".to_string(), "p#ss word".to_string()));
    }

    #[test]
    fn test_parse_keeps_hash_inside_unquoted_value() {
        let vars = parse_env_content("SBR_PASSWORD=ab#cd\n");
        assert_eq!(vars[0].1, "ab#cd");
    }

    #[test]
    fn test_load_dotenv_filters_prefix_and_prefers_sbr_env() {
        let _guard = env_test_lock();
        remove_env("SBR_DOTENV_HOST");
        remove_env("SBR_DOTENV_USER");

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".sbr.env"), "SBR_DOTENV_HOST=from-sbr-env\n").unwrap();
        fs::write(
            tmp.path().join(".env"),
            "SBR_DOTENV_HOST=from-env\nSBR_DOTENV_USER=admin\nOTHER_VAR=ignored\n",
        )
        .unwrap();

        let loaded = load_dotenv(tmp.path()).unwrap();
        assert_eq!(
            loaded,
            vec![
                ("SBR_DOTENV_HOST".to_string(), "from-sbr-env".to_string()),
                ("SBR_DOTENV_USER".to_string(), "admin".to_string()),
            ]
        );
        assert!(has_dotenv_files(tmp.path()));
    }

    #[test]
    fn test_load_dotenv_does_not_override_environment() {
        let _guard = env_test_lock();
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".sbr.env"), "SBR_DOTENV_PRESET=fromfile\n").unwrap();

        set_env("SBR_DOTENV_PRESET", "original");
        let loaded = load_dotenv(tmp.path()).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(std::env::var("SBR_DOTENV_PRESET").unwrap(), "original");
        remove_env("SBR_DOTENV_PRESET");
    }

    #[test]
    fn test_missing_files_yield_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(load_dotenv(tmp.path()).unwrap().is_empty());
        assert!(!has_dotenv_files(tmp.path()));
    }
}
