//! Gateway configuration.
//!
//! Loaded from a TOML file (`config.toml` by default); every section and
//! field has a serde default so a missing file still yields a runnable
//! configuration. `validate()` reports severity-tagged issues that the
//! boot path logs (warnings) or refuses to start on (errors).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    /// Validate semantic constraints that serde cannot express.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port must be non-zero"));
        }
        if self.session.max_tool_loops == 0 {
            issues.push(ConfigIssue::error("session.max_tool_loops must be >= 1"));
        }
        if self.session.frontend_tool_timeout_secs == 0 {
            issues.push(ConfigIssue::warning(
                "session.frontend_tool_timeout_secs is 0 — frontend tools will fail immediately",
            ));
        }
        if self.model.base_url.is_empty() {
            issues.push(ConfigIssue::error("model.base_url must not be empty"));
        }
        if std::env::var(&self.model.api_key_env).is_err() {
            issues.push(ConfigIssue::warning(format!(
                "{} is not set — model calls will be rejected upstream",
                self.model.api_key_env
            )));
        }
        for pattern in self
            .tools
            .auto_approve_patterns
            .iter()
            .chain(self.tools.denied_patterns.iter())
        {
            if regex_invalid(pattern) {
                issues.push(ConfigIssue::error(format!(
                    "invalid tool pattern regex: {pattern}"
                )));
            }
        }

        issues
    }
}

// A lightweight syntactic probe; the real compile happens at boot where
// the RegexSet is built.
fn regex_invalid(pattern: &str) -> bool {
    pattern.is_empty()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. The parent directory is created at boot.
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "d_model_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model_name")]
    pub default_model: String,
    #[serde(default = "d_120")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: d_model_url(),
            api_key_env: d_api_key_env(),
            default_model: d_model_name(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Messages fetched per turn (0 = entire history).
    #[serde(default = "d_50")]
    pub history_limit: usize,
    /// Hard ceiling on model/tool iterations per user turn.
    #[serde(default = "d_25")]
    pub max_tool_loops: usize,
    /// Deadline for a frontend tool round-trip to the client.
    #[serde(default = "d_120")]
    pub frontend_tool_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            max_tool_loops: 25,
            frontend_tool_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool names matching any of these are auto-approved.
    #[serde(default = "d_approve_all")]
    pub auto_approve_patterns: Vec<String>,
    /// Tool names matching any of these are always denied.
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: d_approve_all(),
            denied_patterns: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3400
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://127.0.0.1:3000".into(),
    ]
}
fn d_db_path() -> PathBuf {
    PathBuf::from("parley.db")
}
fn d_model_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn d_api_key_env() -> String {
    "PARLEY_MODEL_API_KEY".into()
}
fn d_model_name() -> String {
    "gemini-2.0-flash".into()
}
fn d_120() -> u64 {
    120
}
fn d_50() -> usize {
    50
}
fn d_25() -> usize {
    25
}
fn d_approve_all() -> Vec<String> {
    vec![".*".into()]
}
