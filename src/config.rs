use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap_size: usize,
}

fn default_overlap() -> usize {
    0
}

/// Broker delivery and retry settings. The retry policy is fixed backoff:
/// `retry_backoff_secs` between attempts, `max_attempts` total (first
/// delivery included) before the message is dead-lettered.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_processing_topic")]
    pub processing_topic: String,
    #[serde(default = "default_completion_topic")]
    pub completion_topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_producer_retries")]
    pub producer_retries: u32,
    #[serde(default = "default_true")]
    pub producer_idempotent: bool,
    #[serde(default = "default_acks")]
    pub producer_acks: String,
    #[serde(default = "default_tx_prefix")]
    pub transactional_id_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            processing_topic: default_processing_topic(),
            completion_topic: default_completion_topic(),
            group_id: default_group_id(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_attempts: default_max_attempts(),
            producer_retries: default_producer_retries(),
            producer_idempotent: true,
            producer_acks: default_acks(),
            transactional_id_prefix: default_tx_prefix(),
        }
    }
}

fn default_partitions() -> usize {
    4
}
fn default_processing_topic() -> String {
    "file-processing".to_string()
}
fn default_completion_topic() -> String {
    "file-completed".to_string()
}
fn default_group_id() -> String {
    "tidepool-ingest".to_string()
}
fn default_retry_backoff_secs() -> u64 {
    3
}
fn default_max_attempts() -> u32 {
    5
}
fn default_producer_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_acks() -> String {
    "all".to_string()
}
fn default_tx_prefix() -> String {
    "tidepool-tx-".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Extraction is refused once this many bytes are in flight at once.
    #[serde(default = "default_max_in_flight_bytes")]
    pub max_in_flight_bytes: usize,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_in_flight_bytes: default_max_in_flight_bytes(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

fn default_max_in_flight_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_io_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Key for HMAC-signing presigned download URLs.
    #[serde(default = "default_signing_key")]
    pub url_signing_key: String,
}

fn default_signing_key() -> String {
    "tidepool-dev-key".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BootstrapConfig {
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default = "default_admin_org_tags")]
    pub admin_org_tags: Vec<String>,
    #[serde(default = "default_admin_primary_org")]
    pub admin_primary_org: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_org_tags: default_admin_org_tags(),
            admin_primary_org: default_admin_primary_org(),
        }
    }
}

fn default_admin_username() -> String {
    "admin".to_string()
}
fn default_admin_org_tags() -> Vec<String> {
    vec![crate::models::DEFAULT_ORG_TAG.to_string()]
}
fn default_admin_primary_org() -> String {
    crate::models::DEFAULT_ORG_TAG.to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }

    if config.broker.partitions == 0 {
        anyhow::bail!("broker.partitions must be >= 1");
    }

    if config.broker.max_attempts == 0 {
        anyhow::bail!("broker.max_attempts must be >= 1");
    }

    match config.broker.producer_acks.as_str() {
        "all" | "leader" | "none" => {}
        other => anyhow::bail!(
            "Unknown broker.producer_acks: '{}'. Must be all, leader, or none.",
            other
        ),
    }

    if config.ingestion.max_in_flight_bytes == 0 {
        anyhow::bail!("ingestion.max_in_flight_bytes must be > 0");
    }

    if !config
        .bootstrap
        .admin_org_tags
        .contains(&config.bootstrap.admin_primary_org)
    {
        anyhow::bail!("bootstrap.admin_primary_org must be one of bootstrap.admin_org_tags");
    }

    Ok(config)
}
