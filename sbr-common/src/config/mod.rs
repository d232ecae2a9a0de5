//! Configuration system.
//!
//! - Typed `SBR_` environment variable parsing with collected errors
//! - `.sbr.env` / `.env` file support
//! - Source tracking for debugging precedence

pub mod dotenv;
pub mod env;
pub mod source;

pub use dotenv::{has_dotenv_files, load_dotenv};
pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
