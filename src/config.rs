//! Configuration file parser for ~/.config/rebuttal/config.toml.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are accepted, though we log a warning when the file contains
//! potential typos. Credentials from the environment override the file.
use crate::thread::SortKey;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Env var that overrides `access_token` from the file.
pub const ACCESS_TOKEN_ENV: &str = "REBUTTAL_ACCESS_TOKEN";
/// Env var that overrides `refresh_token` from the file.
pub const REFRESH_TOKEN_ENV: &str = "REBUTTAL_REFRESH_TOKEN";

pub const DEFAULT_BASE_URL: &str = "https://api.rebuttal.app/v1";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level client configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Tokens are wrapped in [`SecretString`] as soon as they are read and are
/// masked in `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the reply API, e.g. `https://api.rebuttal.app/v1`.
    pub base_url: String,

    /// Bearer token sent with every request.
    #[serde(deserialize_with = "secret")]
    pub access_token: Option<SecretString>,

    /// Exchanged for a new access token when the server answers 401.
    #[serde(deserialize_with = "secret")]
    pub refresh_token: Option<SecretString>,

    /// Sort order a freshly opened thread starts in.
    pub default_sort: SortKey,

    /// Top-level replies requested per page (clamped to 1..=100).
    pub top_level_page_size: u32,

    /// Child replies requested per page (clamped to 1..=100).
    pub child_page_size: u32,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Longest reply accepted before submission, in characters.
    pub max_reply_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: None,
            refresh_token: None,
            default_sort: SortKey::default(),
            top_level_page_size: 20,
            child_page_size: 50,
            request_timeout_secs: 20,
            max_reply_length: 1000,
        }
    }
}

fn secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(SecretString::from))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("default_sort", &self.default_sort)
            .field("top_level_page_size", &self.top_level_page_size)
            .field("child_page_size", &self.child_page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_reply_length", &self.max_reply_length)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const MAX_PAGE_SIZE: u32 = 100;

    const KNOWN_KEYS: [&'static str; 8] = [
        "base_url",
        "access_token",
        "refresh_token",
        "default_sort",
        "top_level_page_size",
        "child_page_size",
        "request_timeout_secs",
        "max_reply_length",
    ];

    /// Load configuration from a TOML file, then apply env var overrides.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file is never loaded.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            base_url = %config.base_url,
            sort = %config.default_sort,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Env vars take precedence over file values. `lookup` is injected so
    /// tests do not have to mutate the process environment.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let from_env = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
        };
        if let Some(token) = from_env(ACCESS_TOKEN_ENV) {
            tracing::debug!(source = ACCESS_TOKEN_ENV, "Access token taken from environment");
            self.access_token = Some(token);
        }
        if let Some(token) = from_env(REFRESH_TOKEN_ENV) {
            tracing::debug!(source = REFRESH_TOKEN_ENV, "Refresh token taken from environment");
            self.refresh_token = Some(token);
        }
    }

    fn normalize(&mut self) {
        let clamp = |name: &str, value: u32| {
            let clamped = value.clamp(1, Self::MAX_PAGE_SIZE);
            if clamped != value {
                tracing::warn!(key = name, value, clamped, "Page size out of range, clamping");
            }
            clamped
        };
        self.top_level_page_size = clamp("top_level_page_size", self.top_level_page_size);
        self.child_page_size = clamp("child_page_size", self.child_page_size);
        if self.request_timeout_secs == 0 {
            tracing::warn!("request_timeout_secs = 0 is not allowed, using 1");
            self.request_timeout_secs = 1;
        }
        if self.max_reply_length == 0 {
            tracing::warn!("max_reply_length = 0 is not allowed, using default");
            self.max_reply_length = Self::default().max_reply_length;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
