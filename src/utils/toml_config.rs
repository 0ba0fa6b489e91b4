//! TOML-based configuration for Argus
//!
//! A run is configured by a single `argus.toml`. The file is parsed and
//! validated once at startup into an immutable [`ArgusConfig`] that is shared
//! by reference (`Arc<ArgusConfig>`) with the coordinator and its services.

use crate::llm::{ModelParams, Provider};
use crate::sources::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Saturation is never assessed before this many tasks have completed.
pub const SATURATION_MIN_COMPLETED: usize = 3;

/// Root configuration structure loaded from argus.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgusConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub research: ResearchConfig,

    #[serde(default)]
    pub hypotheses: HypothesisConfig,

    /// Per-source settings keyed by source id
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,

    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============= LLM Configuration =============

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAI,
    #[default]
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,

    /// Defaults to the provider's public endpoint
    pub base_url: Option<String>,

    /// Environment variable containing the API key (OpenAI-compatible only)
    pub api_key_env: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            base_url: None,
            api_key_env: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn params(&self) -> ModelParams {
        ModelParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Resolve into a concrete provider, reading the API key from the environment.
    pub fn to_provider(&self) -> Result<Provider, ConfigError> {
        match self.provider {
            LlmProviderKind::Ollama => Ok(Provider::Ollama {
                base_url: self.base_url.clone().unwrap_or_else(default_ollama_url),
                model: self.model.clone(),
                params: self.params(),
            }),
            LlmProviderKind::OpenAI => {
                let env = self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
                let api_key = std::env::var(env)
                    .map_err(|_| ConfigError::MissingEnvVar(env.to_string()))?;
                Ok(Provider::OpenAI {
                    api_key,
                    api_base: self.base_url.clone().unwrap_or_else(default_openai_base),
                    model: self.model.clone(),
                    params: self.params(),
                })
            }
        }
    }
}

// ============= Research Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Task ceiling: the run stops once this many tasks have completed.
    /// Failed tasks do not count against it.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Worker pool size, also the batch size pulled from the queue
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Retries per task after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Budget for one task, covering every retry
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Wall-clock budget for the whole run
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,

    #[serde(default = "default_results_per_source")]
    pub results_per_source: usize,

    #[serde(default = "default_max_initial_tasks")]
    pub max_initial_tasks: usize,

    #[serde(default = "default_max_follow_ups_per_task")]
    pub max_follow_ups_per_task: usize,

    /// Completed tasks between saturation checks
    #[serde(default = "default_saturation_check_interval")]
    pub saturation_check_interval: usize,

    #[serde(default = "default_saturation_min_completed")]
    pub saturation_min_completed: usize,

    /// Saturation confidence (0-100) required to stop early
    #[serde(default = "default_saturation_confidence_threshold")]
    pub saturation_confidence_threshold: u8,

    #[serde(default = "default_true")]
    pub reprioritize_after_batch: bool,

    /// Results dated further than this into the future are dropped
    #[serde(default = "default_future_date_tolerance_days")]
    pub future_date_tolerance_days: i64,
}

fn default_max_tasks() -> usize {
    12
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_run_budget_secs() -> u64 {
    1800
}

fn default_results_per_source() -> usize {
    10
}

fn default_max_initial_tasks() -> usize {
    5
}

fn default_max_follow_ups_per_task() -> usize {
    2
}

fn default_saturation_check_interval() -> usize {
    3
}

fn default_saturation_min_completed() -> usize {
    SATURATION_MIN_COMPLETED
}

fn default_saturation_confidence_threshold() -> u8 {
    80
}

fn default_future_date_tolerance_days() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            task_timeout_secs: default_task_timeout_secs(),
            run_budget_secs: default_run_budget_secs(),
            results_per_source: default_results_per_source(),
            max_initial_tasks: default_max_initial_tasks(),
            max_follow_ups_per_task: default_max_follow_ups_per_task(),
            saturation_check_interval: default_saturation_check_interval(),
            saturation_min_completed: default_saturation_min_completed(),
            saturation_confidence_threshold: default_saturation_confidence_threshold(),
            reprioritize_after_batch: true,
            future_date_tolerance_days: default_future_date_tolerance_days(),
        }
    }
}

impl ResearchConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }
}

// ============= Hypothesis Configuration =============

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisMode {
    /// Every hypothesis at once, no coverage assessment
    Parallel,
    /// One at a time with coverage-driven stopping
    #[default]
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: HypothesisMode,

    /// How many hypotheses to request per task (1-5)
    #[serde(default = "default_max_hypotheses")]
    pub max_hypotheses: usize,

    /// Hard ceiling on hypotheses executed per task
    #[serde(default = "default_max_hypotheses")]
    pub max_hypotheses_to_execute: usize,

    /// Hard ceiling on time spent executing hypotheses per task
    #[serde(default = "default_max_hypothesis_time_secs")]
    pub max_hypothesis_time_secs: u64,
}

fn default_max_hypotheses() -> usize {
    3
}

fn default_max_hypothesis_time_secs() -> u64 {
    120
}

impl Default for HypothesisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: HypothesisMode::default(),
            max_hypotheses: default_max_hypotheses(),
            max_hypotheses_to_execute: default_max_hypotheses(),
            max_hypothesis_time_secs: default_max_hypothesis_time_secs(),
        }
    }
}

impl HypothesisConfig {
    pub fn max_hypothesis_time(&self) -> Duration {
        Duration::from_secs(self.max_hypothesis_time_secs)
    }
}

// ============= Source Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Critical sources are retried on throttling instead of being circuit-broken
    #[serde(default)]
    pub critical: bool,

    /// Minimum spacing between calls; marks the source as strictly rate limited
    pub min_interval_ms: Option<u64>,

    /// Overrides `research.results_per_source`
    pub max_results: Option<usize>,

    /// Credential name -> environment variable holding it
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    #[serde(default = "default_critical_retry_attempts")]
    pub critical_retry_attempts: u32,

    #[serde(default = "default_critical_retry_backoff_ms")]
    pub critical_retry_backoff_ms: u64,
}

fn default_critical_retry_attempts() -> u32 {
    2
}

fn default_critical_retry_backoff_ms() -> u64 {
    1000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            critical: false,
            min_interval_ms: None,
            max_results: None,
            credentials: HashMap::new(),
            critical_retry_attempts: default_critical_retry_attempts(),
            critical_retry_backoff_ms: default_critical_retry_backoff_ms(),
        }
    }
}

// ============= Trace & Logging Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_trace_dir")]
    pub output_dir: PathBuf,
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("./traces")
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_trace_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============= Configuration Loading & Validation =============

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),
}

impl ArgusConfig {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ArgusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and env var availability
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.research;
        if r.max_tasks == 0 {
            return Err(ConfigError::ValidationError(
                "research.max_tasks must be at least 1".to_string(),
            ));
        }
        if r.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationError(
                "research.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if r.max_initial_tasks == 0 {
            return Err(ConfigError::ValidationError(
                "research.max_initial_tasks must be at least 1".to_string(),
            ));
        }
        if r.task_timeout_secs == 0 || r.run_budget_secs == 0 {
            return Err(ConfigError::ValidationError(
                "research timeouts must be non-zero".to_string(),
            ));
        }
        if r.saturation_check_interval == 0 {
            return Err(ConfigError::ValidationError(
                "research.saturation_check_interval must be at least 1".to_string(),
            ));
        }
        if r.saturation_min_completed < SATURATION_MIN_COMPLETED {
            return Err(ConfigError::ValidationError(format!(
                "research.saturation_min_completed must be at least {}",
                SATURATION_MIN_COMPLETED
            )));
        }
        if r.saturation_confidence_threshold > 100 {
            return Err(ConfigError::ValidationError(
                "research.saturation_confidence_threshold must be within 0-100".to_string(),
            ));
        }

        let h = &self.hypotheses;
        if !(1..=5).contains(&h.max_hypotheses) {
            return Err(ConfigError::ValidationError(
                "hypotheses.max_hypotheses must be within 1-5".to_string(),
            ));
        }
        if h.max_hypotheses_to_execute == 0 {
            return Err(ConfigError::ValidationError(
                "hypotheses.max_hypotheses_to_execute must be at least 1".to_string(),
            ));
        }

        if self.llm.provider == LlmProviderKind::OpenAI {
            let env = self.llm.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
            self.validate_env_var(env)?;
        }

        for source in self.sources.values().filter(|s| s.enabled) {
            for env in source.credentials.values() {
                self.validate_env_var(env)?;
            }
        }

        Ok(())
    }

    fn validate_env_var(&self, name: &str) -> Result<(), ConfigError> {
        std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        Ok(())
    }

    /// Settings for a source; unconfigured sources get the defaults
    pub fn source(&self, name: &str) -> SourceConfig {
        self.sources.get(name).cloned().unwrap_or_default()
    }

    pub fn is_source_enabled(&self, name: &str) -> bool {
        self.sources.get(name).is_none_or(|s| s.enabled)
    }

    /// Source ids configured as critical
    pub fn critical_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, s)| s.critical)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Source id -> minimum inter-request interval, for strictly limited sources
    pub fn strict_sources(&self) -> HashMap<String, Duration> {
        self.sources
            .iter()
            .filter_map(|(name, s)| {
                s.min_interval_ms
                    .map(|ms| (name.clone(), Duration::from_millis(ms)))
            })
            .collect()
    }

    /// Credentials for a source, read from the environment
    pub fn resolve_credentials(&self, name: &str) -> Result<Credentials, ConfigError> {
        let mut credentials = Credentials::new();
        if let Some(source) = self.sources.get(name) {
            for (key, env) in &source.credentials {
                let value =
                    std::env::var(env).map_err(|_| ConfigError::MissingEnvVar(env.clone()))?;
                credentials.insert(key.clone(), value);
            }
        }
        Ok(credentials)
    }

    pub fn results_limit(&self, name: &str) -> usize {
        self.sources
            .get(name)
            .and_then(|s| s.max_results)
            .unwrap_or(self.research.results_per_source)
    }
}
