//! Configuration for clinical-bridge.
//!
//! Settings are read from `.clinical-bridge/bridge.toml` (or `--config`),
//! then overridden by environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! model = "claude-opus-4-6"
//! max_tokens = 4096
//! timeout_secs = 120
//! api_base = "https://api.anthropic.com"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [logging]
//! level = "info"
//! format = "text"
//! file = ".clinical-bridge/logs"
//!
//! [store]
//! path = ".clinical-bridge/bridge.db"
//! ```
//!
//! Environment overrides: `ANTHROPIC_API_KEY`, `CLAUDE_MODEL`,
//! `AGENT_MAX_RETRIES`, `AGENT_TIMEOUT_SECONDS`, `LOG_LEVEL`, `LOG_FORMAT`,
//! `BRIDGE_DB_PATH`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".clinical-bridge/bridge.toml";

/// Text-generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Only ever read from the environment
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "claude-opus-4-6".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_api_base() -> String {
    "https://api.anthropic.com".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            api_base: default_api_base(),
            api_key: None,
        }
    }
}

/// Full-mode retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily rolling log files; stderr only when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".clinical-bridge/bridge.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Root of `bridge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bridge.toml")
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.agent.api_key = Some(key);
        }
        if let Some(model) = var("CLAUDE_MODEL") {
            self.agent.model = model;
        }
        if let Some(retries) = var("AGENT_MAX_RETRIES") {
            self.retry.max_retries = retries
                .trim()
                .parse()
                .with_context(|| {
                    format!("AGENT_MAX_RETRIES must be an integer, got '{}'", retries)
                })?;
        }
        if let Some(timeout) = var("AGENT_TIMEOUT_SECONDS") {
            self.agent.timeout_secs = timeout.trim().parse().with_context(|| {
                format!("AGENT_TIMEOUT_SECONDS must be an integer, got '{}'", timeout)
            })?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(path) = var("BRIDGE_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.logging.level.parse::<tracing::Level>().is_err() {
            warnings.push(format!(
                "Invalid log level '{}': should be one of trace, debug, info, warn, error",
                self.logging.level
            ));
        }
        if self.agent.timeout_secs == 0 {
            warnings.push("agent.timeout_secs is 0: every call will time out".to_string());
        }
        if self.agent.max_tokens == 0 {
            warnings.push("agent.max_tokens is 0".to_string());
        }
        if self.retry.max_retries > 10 {
            warnings.push(format!(
                "retry.max_retries is {}: the last backoff alone waits {}s",
                self.retry.max_retries,
                (self.retry.base_delay_ms << self.retry.max_retries.min(32)) / 1000
            ));
        }

        warnings
    }
}
