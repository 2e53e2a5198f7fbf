//! TOML configuration parsing and validation.
//!
//! All tunables live in one file (default `./config/darwin.toml`). Secrets
//! may be supplied through the environment instead of the file:
//! `OPENAI_API_KEY` (embedding/LLM providers), `FORGE_TOKEN` (issue
//! creation), and `DARWIN_WEBHOOK_SECRET` (overrides `[webhook].secret`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub fix: FixConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Product name → forge repository (`owner/repo`). Lookup is
    /// case-insensitive on the product name.
    #[serde(default)]
    pub products: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_store_url() -> String {
    "sqlite:data/darwin.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    /// Override the remote endpoint (OpenAI-compatible).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dim: default_embedding_dim(),
            endpoint: None,
            timeout_secs: default_embed_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_embedding_dim() -> usize {
    384
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            endpoint: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Similarity at or above which a signal attaches to the best topic.
    #[serde(default = "default_threshold_high")]
    pub threshold_high: f32,
    /// Lower bound of the ambiguous triage band.
    #[serde(default = "default_threshold_low")]
    pub threshold_low: f32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold_high: default_threshold_high(),
            threshold_low: default_threshold_low(),
        }
    }
}

fn default_threshold_high() -> f32 {
    0.75
}
fn default_threshold_low() -> f32 {
    0.60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifyConfig {
    /// Below this confidence, classification annotates the topic but does
    /// not create a task.
    #[serde(default = "default_confidence_min")]
    pub confidence_min: f32,
    /// Launch the fix runner immediately after creating a task.
    #[serde(default)]
    pub auto_fix: bool,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            confidence_min: default_confidence_min(),
            auto_fix: false,
        }
    }
}

fn default_confidence_min() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixConfig {
    /// Coding-agent executor: `disabled` or `command`.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Executable invoked by the `command` executor. It receives the fix
    /// request as JSON on stdin and must print a JSON result on stdout.
    #[serde(default)]
    pub agent_command: String,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Re-enter the fix runner automatically on "changes requested".
    #[serde(default)]
    pub auto_iterate: bool,
    #[serde(default = "default_auto_iter_max")]
    pub auto_iter_max: u32,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            agent_command: String::new(),
            agent_timeout_secs: default_agent_timeout_secs(),
            auto_iterate: false,
            auto_iter_max: default_auto_iter_max(),
        }
    }
}

fn default_agent() -> String {
    "disabled".to_string()
}
fn default_agent_timeout_secs() -> u64 {
    900
}
fn default_auto_iter_max() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// HMAC-SHA256 secret for forge webhook signatures. Overridden by
    /// `DARWIN_WEBHOOK_SECRET` when set.
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8700".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Sleep between queue polls when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Embedding attempts before a signal is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub embed_max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// How long shutdown waits for an in-flight item to finish.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Embed-queue length beyond which ingest responses carry a
    /// `delayed = true` hint.
    #[serde(default = "default_embed_backpressure")]
    pub embed_backpressure: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            embed_max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            embed_backpressure: default_embed_backpressure(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_embed_backpressure() -> u64 {
    10_000
}

impl Config {
    /// Webhook secret with the environment override applied.
    pub fn webhook_secret(&self) -> String {
        std::env::var("DARWIN_WEBHOOK_SECRET").unwrap_or_else(|_| self.webhook.secret.clone())
    }

    /// Case-insensitive product → forge repo lookup.
    pub fn repo_for_product(&self, product: &str) -> Option<&str> {
        let wanted = product.to_lowercase();
        self.products
            .iter()
            .find(|(name, _)| name.to_lowercase() == wanted)
            .map(|(_, repo)| repo.as_str())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints. Called by [`load_config`]; exposed so
/// tests can validate hand-built configs.
pub fn validate(config: &Config) -> Result<()> {
    if config.embedding.dim == 0 {
        anyhow::bail!("embedding.dim must be > 0");
    }
    match config.embedding.provider.as_str() {
        "local" | "remote" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local or remote.",
            other
        ),
    }
    match config.llm.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be openai or disabled.", other),
    }

    let high = config.cluster.threshold_high;
    let low = config.cluster.threshold_low;
    if !(0.0..=1.0).contains(&high) || high == 0.0 {
        anyhow::bail!("cluster.threshold_high must be in (0, 1]");
    }
    if !(0.0..=1.0).contains(&low) || low == 0.0 {
        anyhow::bail!("cluster.threshold_low must be in (0, 1]");
    }
    if high <= low {
        anyhow::bail!("cluster.threshold_high must be greater than cluster.threshold_low");
    }

    if !(0.0..=1.0).contains(&config.classify.confidence_min) {
        anyhow::bail!("classify.confidence_min must be in [0, 1]");
    }

    match config.fix.agent.as_str() {
        "disabled" => {}
        "command" => {
            if config.fix.agent_command.trim().is_empty() {
                anyhow::bail!("fix.agent_command must be set when fix.agent is 'command'");
            }
        }
        other => anyhow::bail!("Unknown fix agent: '{}'. Must be disabled or command.", other),
    }
    if config.fix.auto_iter_max == 0 {
        anyhow::bail!("fix.auto_iter_max must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert_eq!(config.embedding.dim, 384);
        assert!((config.cluster.threshold_high - 0.75).abs() < 1e-6);
        assert!((config.cluster.threshold_low - 0.60).abs() < 1e-6);
        assert!((config.classify.confidence_min - 0.5).abs() < 1e-6);
        assert_eq!(config.fix.auto_iter_max, 3);
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = Config::default();
        config.cluster.threshold_high = 0.5;
        config.cluster.threshold_low = 0.6;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_command_agent_requires_command() {
        let mut config = Config::default();
        config.fix.agent = "command".to_string();
        assert!(validate(&config).is_err());
        config.fix.agent_command = "/usr/local/bin/fix-agent".to_string();
        validate(&config).unwrap();
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = Config::default();
        config.embedding.provider = "onnx".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_src = r#"
            [store]
            url = "memory"

            [embedding]
            provider = "local"
            dim = 64

            [cluster]
            threshold_high = 0.8
            threshold_low = 0.5

            [products]
            joplin = "laurent22/joplin"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.store.url, "memory");
        assert_eq!(config.embedding.dim, 64);
        assert_eq!(config.repo_for_product("Joplin"), Some("laurent22/joplin"));
        assert_eq!(config.repo_for_product("unknown"), None);
    }
}
