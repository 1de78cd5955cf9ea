//! Configuration parsing.
//!
//! Second Brain is configured from a single TOML file (default
//! `./config/brain.toml`). Every section is optional; a missing section
//! takes the defaults shown in `config/brain.example.toml`. Secrets may be
//! supplied through the environment instead of the file:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `MEM0_API_KEY` | `mem0.api_key` |
//! | `MEM0_USER_ID` | `mem0.user_id` |
//! | `SUPABASE_URL` | `supabase.url` |
//! | `SUPABASE_KEY` | `supabase.key` |
//! | `VOYAGE_API_KEY` | `voyage.api_key` |
//! | `OLLAMA_BASE_URL` | `llm.base_url` |
//! | `OLLAMA_MODEL` | `llm.model` |

use anyhow::{Context, Result};
use second_brain_core::flags::{FeatureFlags, ProviderStatusSnapshot};
use second_brain_core::models::{Mode, Provider, ProviderHealth};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default = "default_provider_status")]
    pub provider_status: BTreeMap<String, ProviderHealth>,
    #[serde(default)]
    pub mem0: Mem0Config,
    #[serde(default)]
    pub supabase: SupabaseConfig,
    #[serde(default)]
    pub voyage: VoyageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_provider_status() -> BTreeMap<String, ProviderHealth> {
    BTreeMap::from([
        ("mem0".to_string(), ProviderHealth::Available),
        ("supabase".to_string(), ProviderHealth::Available),
        ("graphiti".to_string(), ProviderHealth::Unavailable),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/brain.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MigrationsConfig {
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("./migrations")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub default_mode: Mode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_mode: Mode::default(),
            top_k: default_top_k(),
            threshold: default_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mem0Config {
    #[serde(default)]
    pub use_real_provider: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_mem0_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Mem0Config {
    fn default() -> Self {
        Self {
            use_real_provider: false,
            user_id: None,
            api_key: None,
            base_url: default_mem0_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_mem0_base_url() -> String {
    "https://api.mem0.ai".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupabaseConfig {
    #[serde(default)]
    pub use_real_provider: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_rpc_function")]
    pub rpc_function: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_secs")]
    pub circuit_recovery_timeout_secs: f64,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            use_real_provider: false,
            url: None,
            key: None,
            rpc_function: default_rpc_function(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            retry_backoff: default_retry_backoff(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout_secs: default_circuit_recovery_secs(),
        }
    }
}

fn default_rpc_function() -> String {
    "match_vectors".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> f64 {
    1.0
}
fn default_retry_backoff() -> f64 {
    2.0
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_recovery_secs() -> f64 {
    30.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoyageConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_voyage_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub embed_enabled: bool,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default)]
    pub use_real_rerank: bool,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VoyageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_voyage_base_url(),
            embed_enabled: false,
            embed_model: default_embed_model(),
            use_real_rerank: false,
            rerank_model: default_rerank_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_voyage_base_url() -> String {
    "https://api.voyageai.com".to_string()
}
fn default_embed_model() -> String {
    "voyage-4-large".to_string()
}
fn default_rerank_model() -> String {
    "rerank-2".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "qwen3-coder-next".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_max_turns() -> usize {
    50
}
fn default_max_sessions() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces: default_max_traces(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_traces() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 7] = ["trace", "debug", "info", "warn", "warning", "error", "critical"];

impl Config {
    /// All-defaults configuration, used when no config file exists.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::default(),
            migrations: MigrationsConfig::default(),
            retrieval: RetrievalConfig::default(),
            feature_flags: FeatureFlags::default(),
            provider_status: default_provider_status(),
            mem0: Mem0Config::default(),
            supabase: SupabaseConfig::default(),
            voyage: VoyageConfig::default(),
            llm: LlmConfig::default(),
            conversation: ConversationConfig::default(),
            trace: TraceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Typed provider status snapshot. Unknown provider names are errors.
    pub fn provider_status_snapshot(&self) -> Result<ProviderStatusSnapshot> {
        let mut snapshot = ProviderStatusSnapshot::new();
        for (name, health) in &self.provider_status {
            let provider: Provider = name
                .parse()
                .with_context(|| format!("provider_status: unknown provider '{}'", name))?;
            snapshot.set(provider, *health);
        }
        Ok(snapshot)
    }

    /// Fill secrets and endpoints from `lookup` (normally `std::env::var`).
    /// Values already present in the file take precedence for credentials;
    /// endpoint variables always override.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fill = |slot: &mut Option<String>, key: &str| {
            if slot.is_none() {
                *slot = lookup(key).filter(|v| !v.is_empty());
            }
        };
        fill(&mut self.mem0.api_key, "MEM0_API_KEY");
        fill(&mut self.mem0.user_id, "MEM0_USER_ID");
        fill(&mut self.supabase.url, "SUPABASE_URL");
        fill(&mut self.supabase.key, "SUPABASE_KEY");
        fill(&mut self.voyage.api_key, "VOYAGE_API_KEY");

        if let Some(url) = lookup("OLLAMA_BASE_URL").filter(|v| !v.is_empty()) {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
    }

    /// Check value ranges. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.threshold) {
            anyhow::bail!("retrieval.threshold must be in [0.0, 1.0]");
        }

        if self.conversation.max_turns == 0 {
            anyhow::bail!("conversation.max_turns must be > 0");
        }
        if self.conversation.max_sessions == 0 {
            anyhow::bail!("conversation.max_sessions must be > 0");
        }
        if self.trace.max_traces == 0 {
            anyhow::bail!("trace.max_traces must be > 0");
        }

        if self.supabase.circuit_failure_threshold == 0 {
            anyhow::bail!("supabase.circuit_failure_threshold must be > 0");
        }
        if self.supabase.retry_backoff < 1.0 {
            anyhow::bail!("supabase.retry_backoff must be >= 1.0");
        }
        if self.supabase.retry_delay_secs < 0.0 || self.supabase.circuit_recovery_timeout_secs < 0.0
        {
            anyhow::bail!("supabase retry delay and recovery timeout must be >= 0");
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!(
                "Unknown logging.level: '{}'. Must be one of DEBUG, INFO, WARNING, ERROR, CRITICAL.",
                self.logging.level
            );
        }

        self.provider_status_snapshot()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`Config::minimal`]
/// with environment overrides applied.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    let mut config = Config::minimal();
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
