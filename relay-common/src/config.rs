//! Configuration management for the Dify relay.
//!
//! The relay reads a single configuration file at `~/.dify-relay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (DIFY_* / RELAY_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `DIFY_API_BASE` → dify.api_base
//! - `DIFY_API_KEY` → dify.api_key
//! - `DIFY_APP_TYPE` → dify.app_type
//! - `DIFY_CONVERSATION_MAX_MESSAGES` → dify.conversation_max_messages
//! - `DIFY_EXPIRES_IN_SECONDS` → dify.expires_in_seconds
//! - `DIFY_IMAGE_UPLOAD_ENABLE` → dify.image_upload_enable
//! - `DIFY_IMAGE_CACHE_DIR` → dify.image_cache_dir
//! - `DIFY_IGNORE_PREFIX` → dify.ignore_prefix (comma separated)
//! - `RELAY_LOG_LEVEL` → observability.log_level
//! - `RELAY_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::RelayError;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".dify-relay"),
        |dirs| dirs.home_dir().join(".dify-relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// App Mode
// ============================================================================

/// The kind of Dify application the relay talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    /// Chat assistant, blocking `chat-messages`.
    Chatbot,
    /// Agent assistant, streaming `chat-messages`.
    Agent,
    /// Workflow app, blocking `workflows/run`.
    Workflow,
}

impl AppMode {
    /// Diagnostic shown to the user when the configured app type is unknown.
    pub const MISCONFIGURED: &'static str = "dify_app_type must be agent, chatbot or workflow";

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chatbot => "chatbot",
            Self::Agent => "agent",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppMode {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "chatbot" => Ok(Self::Chatbot),
            "agent" => Ok(Self::Agent),
            "workflow" => Ok(Self::Workflow),
            other => Err(RelayError::Configuration(format!(
                "unknown app type {other:?}: {}",
                Self::MISCONFIGURED
            ))),
        }
    }
}

// ============================================================================
// Dify Configuration
// ============================================================================

/// Remote API and session policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DifyConfig {
    /// API base URL, including the `/v1` path segment.
    pub api_base: String,

    /// App API key (sent as a bearer token).
    pub api_key: String,

    /// App type: chatbot, agent or workflow.
    ///
    /// Kept as a string so a typo surfaces as a per-turn diagnostic
    /// instead of refusing to start.
    pub app_type: String,

    /// Messages per remote conversation before it is abandoned.
    ///
    /// Dify has no history window, so the whole conversation is dropped
    /// once the cap is reached.
    pub conversation_max_messages: u32,

    /// Messages starting with one of these prefixes never reach the bot.
    pub ignore_prefix: Vec<String>,

    /// Session idle expiry in seconds. 0 disables expiry.
    pub expires_in_seconds: u64,

    /// Upload the user's last image with the next chat request.
    pub image_upload_enable: bool,

    /// Directory where inbound images are cached before upload.
    pub image_cache_dir: String,

    /// Timeout for chat and workflow calls.
    pub request_timeout_secs: u64,

    /// Timeout for file uploads.
    pub upload_timeout_secs: u64,
}

impl Default for DifyConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: "app-xxx".to_string(),
            app_type: AppMode::Chatbot.as_str().to_string(),
            conversation_max_messages: 20,
            ignore_prefix: vec!["/".to_string(), ".".to_string()],
            expires_in_seconds: 3600,
            image_upload_enable: false,
            image_cache_dir: "image".to_string(),
            request_timeout_secs: 50,
            upload_timeout_secs: 30,
        }
    }
}

fn default_api_base() -> String {
    "https://api.dify.ai/v1".to_string()
}

impl DifyConfig {
    /// Parse the configured app type.
    pub fn app_mode(&self) -> crate::error::Result<AppMode> {
        self.app_type.parse()
    }

    /// Base URL used to complete relative file links in answers.
    ///
    /// This is the API base with its trailing `/v1` removed.
    pub fn file_base_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        base.strip_suffix("/v1").unwrap_or(base).to_string()
    }

    /// Session idle expiry, or `None` when sessions never expire.
    pub fn session_ttl(&self) -> Option<Duration> {
        (self.expires_in_seconds > 0).then(|| Duration::from_secs(self.expires_in_seconds))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Output format: "pretty" or "json"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dify: DifyConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup("DIFY_API_BASE") {
            self.dify.api_base = base;
        }
        if let Some(key) = lookup("DIFY_API_KEY") {
            self.dify.api_key = key;
        }
        if let Some(app_type) = lookup("DIFY_APP_TYPE") {
            self.dify.app_type = app_type;
        }
        if let Some(v) = lookup("DIFY_CONVERSATION_MAX_MESSAGES") {
            match v.parse() {
                Ok(n) => self.dify.conversation_max_messages = n,
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid DIFY_CONVERSATION_MAX_MESSAGES"),
            }
        }
        if let Some(v) = lookup("DIFY_EXPIRES_IN_SECONDS") {
            match v.parse() {
                Ok(n) => self.dify.expires_in_seconds = n,
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid DIFY_EXPIRES_IN_SECONDS"),
            }
        }
        if let Some(v) = lookup("DIFY_IMAGE_UPLOAD_ENABLE") {
            match parse_bool(&v) {
                Some(b) => self.dify.image_upload_enable = b,
                None => tracing::warn!(value = %v, "Ignoring invalid DIFY_IMAGE_UPLOAD_ENABLE"),
            }
        }
        if let Some(dir) = lookup("DIFY_IMAGE_CACHE_DIR") {
            self.dify.image_cache_dir = dir;
        }
        if let Some(v) = lookup("DIFY_IGNORE_PREFIX") {
            self.dify.ignore_prefix = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RELAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
