// ABOUTME: Configuration loading and validation for the larder binary.
// ABOUTME: Reads LARDER_* environment variables, applies defaults, and rejects unusable retry settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use larder_core::queue::AutosaveConfig;
use larder_core::retry::RetryPolicy;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LARDER_BACKEND must be `sqlite` or `memory`, got: {0}")]
    InvalidBackend(String),

    #[error("{var} is not a whole number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Which storage engine the binary opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Memory,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "memory" => Ok(Backend::Memory),
            _ => Err(ConfigError::InvalidBackend(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LarderConfig {
    pub home: PathBuf,
    pub backend: Backend,
    pub autosave: AutosaveConfig,
}

impl LarderConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - LARDER_HOME: data directory (default: ~/.larder)
    /// - LARDER_BACKEND: `sqlite` or `memory` (default: sqlite)
    /// - LARDER_DEBOUNCE_MS: autosave debounce window (default: 400)
    /// - LARDER_MAX_RETRIES: failed attempts before a batch is dropped (default: 5)
    /// - LARDER_RETRY_BASE_MS: first retry delay (default: 1000)
    /// - LARDER_RETRY_JITTER_MS: maximum random jitter per retry (default: 250)
    /// - LARDER_RETRY_MAX_MS: ceiling on any retry delay (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("LARDER_HOME")
            .ok()
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".larder")
            });

        let backend = match std::env::var("LARDER_BACKEND") {
            Ok(raw) if !raw.is_empty() => raw.parse()?,
            _ => Backend::Sqlite,
        };

        let debounce_ms = env_number("LARDER_DEBOUNCE_MS", 400)?;
        let max_retries = env_number("LARDER_MAX_RETRIES", 5)?;
        let base_ms = env_number("LARDER_RETRY_BASE_MS", 1000)?;
        let jitter_ms = env_number("LARDER_RETRY_JITTER_MS", 250)?;
        let max_ms = env_number("LARDER_RETRY_MAX_MS", 60_000)?;

        nonzero("LARDER_MAX_RETRIES", max_retries)?;
        nonzero("LARDER_RETRY_BASE_MS", base_ms)?;
        nonzero("LARDER_RETRY_MAX_MS", max_ms)?;

        let max_retries = u32::try_from(max_retries).map_err(|_| ConfigError::InvalidNumber {
            var: "LARDER_MAX_RETRIES",
            value: max_retries.to_string(),
        })?;

        Ok(Self {
            home,
            backend,
            autosave: AutosaveConfig {
                debounce: Duration::from_millis(debounce_ms),
                retry: RetryPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(base_ms),
                    max_jitter: Duration::from_millis(jitter_ms),
                    max_delay: Duration::from_millis(max_ms),
                },
            },
        })
    }

    /// Path of the SQLite database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.home.join("larder.db")
    }
}

fn env_number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber { var, value: raw })
        }
        _ => Ok(default),
    }
}

fn nonzero(var: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { var })
    } else {
        Ok(())
    }
}
