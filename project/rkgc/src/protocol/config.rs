use anyhow::Context;
use common::ApiResource;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config_ref() -> anyhow::Result<&'static Config> {
    CONFIG.get().context("Config has not been loaded")
}

#[derive(Debug, Deserialize)]
pub struct Config {
    // Xline endpoints
    pub xline_config: XlineConfig,
    // collector tuning
    #[serde(default)]
    pub garbage_collector: GarbageCollectorConfig,
    // resource types served by the store
    #[serde(default)]
    pub resources: Vec<ApiResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_prefix() -> String {
    "/registry".to_string()
}

/// What to do with an owner reference whose kind no watched resource serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum UnknownOwnerKindPolicy {
    /// Fail the item and retry it with backoff until the kind shows up.
    #[default]
    Retry,
    /// Treat the owner as gone.
    TreatAsDangling,
    /// Treat the owner as present, so it never causes a deletion.
    TreatAsSolid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GarbageCollectorConfig {
    pub workers: usize,
    pub absent_owner_cache_size: usize,
    /// Replays every known object to the graph this often. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub unknown_owner_kind_policy: UnknownOwnerKindPolicy,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            absent_owner_cache_size: 500,
            resync_period: Duration::ZERO,
            base_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_secs(1000),
            unknown_owner_kind_policy: UnknownOwnerKindPolicy::Retry,
        }
    }
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_yaml::from_str(content).context("Failed to parse YAML config")
}

pub fn load_config(path: &Path) -> anyhow::Result<&'static Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg = parse_config(&content)?;
    Ok(CONFIG.get_or_init(|| cfg))
}
