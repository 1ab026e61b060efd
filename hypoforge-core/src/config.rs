//! Configuration for the pipeline engine, the AI adapter, the caller layer
//! and the store.
//!
//! Loaded with `figment`, layered from built-in defaults, the user config
//! file, the workspace config file, `HYPOFORGE_`-prefixed environment
//! variables and explicit overrides.

use crate::error::ConfigError;
use crate::extraction::ExtractionLimits;
use crate::phase::DEFAULT_MAX_CONCURRENT_RESEARCH;
use crate::prompts::PromptTemplates;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypoforgeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub prompts: PromptTemplates,
}

/// Step Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum hypotheses with outstanding deep research.
    pub max_concurrent_research: usize,
    /// Restarts allowed for a stuck hypothesis before it is marked error.
    pub max_restarts: u32,
    /// Consecutive transient provider failures a run survives before it is
    /// marked error.
    pub max_transient_failures: u32,
    pub title_max_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_research: DEFAULT_MAX_CONCURRENT_RESEARCH,
            max_restarts: 3,
            max_transient_failures: 10,
            title_max_chars: 100,
            summary_max_chars: 2000,
        }
    }
}

impl EngineConfig {
    pub fn extraction_limits(&self) -> ExtractionLimits {
        ExtractionLimits {
            title_max_chars: self.title_max_chars,
            summary_max_chars: self.summary_max_chars,
        }
    }
}

/// AI adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// `gemini` or `mock`.
    pub provider: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Inline API key; takes precedence over `api_key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub deep_research_agent: String,
    /// Minimum spacing between calls to the provider.
    pub min_request_interval_ms: u64,
    pub request_timeout_secs: u64,
    /// Retries for transient errors on synchronous generation calls.
    pub max_retries: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            deep_research_agent: "deep-research-pro-preview-12-2025".to_string(),
            min_request_interval_ms: 2000,
            request_timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl AiConfig {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

/// Self-chaining driver and recovery sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_chain_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Hard limit on a single step invocation.
    pub step_timeout_secs: u64,
    /// Running or pending runs untouched for longer than this are stale.
    pub stale_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    /// Upper bound on steps in one `drive` call.
    pub max_steps_per_drive: usize,
    /// Pause between successive steps of one run while research is in
    /// flight.
    pub poll_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_chain_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 32_000,
            step_timeout_secs: 60,
            stale_threshold_secs: 300,
            sweep_interval_secs: 60,
            max_steps_per_drive: 10_000,
            poll_delay_ms: 0,
        }
    }
}

impl RunnerConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Where the SQLite store keeps its database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_file: Option<PathBuf>,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "hypoforge", "hypoforge")
}

/// Per-user data directory, used for the default store file and logs.
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

impl StoreConfig {
    /// The configured file, else `hypoforge.db` in the user data directory,
    /// else `.hypoforge/hypoforge.db` under `workspace`.
    pub fn resolve_data_file(&self, workspace: &Path) -> PathBuf {
        if let Some(path) = &self.data_file {
            return path.clone();
        }
        data_dir()
            .map(|dir| dir.join("hypoforge.db"))
            .unwrap_or_else(|| workspace.join(".hypoforge").join("hypoforge.db"))
    }
}

impl HypoforgeConfig {
    /// Human-readable problems with this configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.engine.max_concurrent_research == 0 {
            problems.push("engine.max_concurrent_research must be at least 1".to_string());
        }
        if self.engine.max_transient_failures == 0 {
            problems.push("engine.max_transient_failures must be at least 1".to_string());
        }
        if self.engine.title_max_chars == 0 || self.engine.summary_max_chars == 0 {
            problems.push("engine title/summary limits must be positive".to_string());
        }
        if !matches!(self.ai.provider.as_str(), "gemini" | "mock") {
            problems.push(format!(
                "ai.provider '{}' is not supported (expected gemini or mock)",
                self.ai.provider
            ));
        }
        if self.ai.request_timeout_secs == 0 {
            problems.push("ai.request_timeout_secs must be positive".to_string());
        }
        if self.runner.step_timeout_secs == 0 {
            problems.push("runner.step_timeout_secs must be positive".to_string());
        }
        if self.runner.stale_threshold_secs == 0 {
            problems.push("runner.stale_threshold_secs must be positive".to_string());
        }
        if self.runner.initial_backoff_ms > self.runner.max_backoff_ms {
            problems.push("runner.initial_backoff_ms exceeds runner.max_backoff_ms".to_string());
        }
        problems
    }

    /// `validate`, as an error carrying every problem found.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

/// Load configuration, lowest to highest precedence:
///
/// 1. Built-in defaults
/// 2. User config (`~/.config/hypoforge/config.toml` or platform equivalent)
/// 3. Workspace config (`.hypoforge/config.toml`)
/// 4. Environment variables (`HYPOFORGE_ENGINE__MAX_RESTARTS`, ...)
/// 5. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&HypoforgeConfig>,
) -> Result<HypoforgeConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(HypoforgeConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".hypoforge").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("HYPOFORGE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
