//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::models::session::AgentKind;
use crate::{AppError, Result};

/// Keyring service name used for provider API keys.
pub const KEYRING_SERVICE: &str = "memory-worker";

/// Durable queue and recovery tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// A `processing` row older than this is considered stuck.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_seconds: u64,
    /// Resets allowed before a stuck message is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Interval between periodic stuck-message sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Idle period after which a session worker exits; 0 means never.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_threshold_seconds: default_stale_threshold(),
            max_retries: default_max_retries(),
            sweep_interval_seconds: default_sweep_interval(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl QueueConfig {
    /// Stuck-message grace period.
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_seconds)
    }

    /// Sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Worker idle timeout, `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }
}

/// Subprocess supervision tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// How long teardown waits for a subprocess to exit.
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
    /// Interval between registry reaper passes.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            exit_timeout_ms: default_exit_timeout_ms(),
            reaper_interval_seconds: default_reaper_interval(),
        }
    }
}

impl ProcessConfig {
    /// Subprocess exit verification timeout.
    #[must_use]
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    /// Interval between registry reaper passes.
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

/// Stateful Claude CLI backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClaudeConfig {
    /// Claude CLI binary.
    #[serde(default = "default_claude_cli")]
    pub cli: String,
    /// Model alias passed with `--model`.
    #[serde(default = "default_claude_model")]
    pub model: String,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            cli: default_claude_cli(),
            model: default_claude_model(),
            extra_args: Vec::new(),
        }
    }
}

/// Gemini REST backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GeminiConfig {
    /// Model name, e.g. `gemini-2.5-flash`.
    #[serde(default = "default_gemini_model")]
    pub model: String,
    /// API base URL.
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    /// Pace requests to the free-tier per-model RPM.
    #[serde(default = "default_true")]
    pub rate_limiting: bool,
    /// Conversation turns kept when resending history.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// Estimated token ceiling for resent history.
    #[serde(default = "default_max_estimated_tokens")]
    pub max_estimated_tokens: usize,
    /// API key (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            rate_limiting: true,
            max_context_messages: default_max_context_messages(),
            max_estimated_tokens: default_max_estimated_tokens(),
            api_key: String::new(),
        }
    }
}

/// `OpenRouter` REST backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OpenRouterConfig {
    /// Model slug, e.g. `xiaomi/mimo-v2-flash:free`.
    #[serde(default = "default_openrouter_model")]
    pub model: String,
    /// API base URL.
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
    /// Value sent as `HTTP-Referer`.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// Value sent as `X-Title`.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Conversation turns kept when resending history.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// Estimated token ceiling for resent history.
    #[serde(default = "default_max_estimated_tokens")]
    pub max_estimated_tokens: usize,
    /// API key (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            model: default_openrouter_model(),
            base_url: default_openrouter_base_url(),
            site_url: default_site_url(),
            app_name: default_app_name(),
            max_context_messages: default_max_context_messages(),
            max_estimated_tokens: default_max_estimated_tokens(),
            api_key: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stale_threshold() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    180
}

fn default_exit_timeout_ms() -> u64 {
    5000
}

fn default_reaper_interval() -> u64 {
    300
}

fn default_claude_cli() -> String {
    "claude".into()
}

fn default_claude_model() -> String {
    "haiku".into()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

fn default_openrouter_model() -> String {
    "xiaomi/mimo-v2-flash:free".into()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

fn default_site_url() -> String {
    "https://github.com/memory-worker/memory-worker".into()
}

fn default_app_name() -> String {
    "memory-worker".into()
}

fn default_max_context_messages() -> usize {
    20
}

fn default_max_estimated_tokens() -> usize {
    100_000
}

fn default_http_port() -> u16 {
    37777
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".memory-worker")
}

fn default_provider() -> AgentKind {
    AgentKind::Claude
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the `SQLite` database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// HTTP port for the inbound API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Backend that serves new sessions.
    #[serde(default = "default_provider")]
    pub provider: AgentKind,
    /// Hand sessions to Claude when a stateless backend hits a recoverable error.
    #[serde(default = "default_true")]
    pub fallback_to_claude: bool,
    /// Durable queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Subprocess supervision tuning.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Claude CLI backend.
    #[serde(default)]
    pub claude: ClaudeConfig,
    /// Gemini backend.
    #[serde(default)]
    pub gemini: GeminiConfig,
    /// `OpenRouter` backend.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            provider: default_provider(),
            fallback_to_claude: true,
            queue: QueueConfig::default(),
            process: ProcessConfig::default(),
            claude: ClaudeConfig::default(),
            gemini: GeminiConfig::default(),
            openrouter: OpenRouterConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load provider API keys from OS keychain with env-var fallback.
    ///
    /// Only the keys a configured backend needs are looked up. A missing
    /// key is logged rather than rejected; the backend reports
    /// `AppError::Unauthorized` on first use, which is fallback-eligible.
    pub async fn load_credentials(&mut self) {
        if self.provider == AgentKind::Gemini {
            match load_credential("gemini_api_key", "GEMINI_API_KEY").await {
                Ok(key) => self.gemini.api_key = key,
                Err(err) => warn!(%err, "gemini api key unavailable"),
            }
        }
        if self.provider == AgentKind::OpenRouter {
            match load_credential("openrouter_api_key", "OPENROUTER_API_KEY").await {
                Ok(key) => self.openrouter.api_key = key,
                Err(err) => warn!(%err, "openrouter api key unavailable"),
            }
        }
        info!(provider = %self.provider, "credentials loaded");
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("memory-worker.db")
    }

    fn validate(&self) -> Result<()> {
        if self.queue.max_retries == 0 {
            return Err(AppError::Config(
                "queue.max_retries must be greater than zero".into(),
            ));
        }

        if self.queue.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "queue.sweep_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.process.exit_timeout_ms == 0 {
            return Err(AppError::Config(
                "process.exit_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.process.reaper_interval_seconds == 0 {
            return Err(AppError::Config(
                "process.reaper_interval_seconds must be greater than zero".into(),
            ));
        }

        for (name, messages, tokens) in [
            (
                "gemini",
                self.gemini.max_context_messages,
                self.gemini.max_estimated_tokens,
            ),
            (
                "openrouter",
                self.openrouter.max_context_messages,
                self.openrouter.max_estimated_tokens,
            ),
        ] {
            if messages == 0 || tokens == 0 {
                return Err(AppError::Config(format!(
                    "{name} context limits must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
