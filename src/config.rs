//! Application configuration, loaded from a TOML file with serde defaults.
//!
//! Every tunable the data plane recognizes lives here. Connection strings
//! (DATABASE_URL, NATS_URL) stay in the environment so deployments can use
//! their secret store; everything else is file-driven.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Live-state cache tuning (the in-process hot map).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_live_state_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_live_state_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_live_state_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_min_results_before_db_fallback")]
    pub min_results_before_db_fallback: usize,
}

impl Default for LiveStateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_live_state_ttl(),
            max_entries: default_live_state_max_entries(),
            cleanup_interval_seconds: default_live_state_cleanup_interval(),
            min_results_before_db_fallback: default_min_results_before_db_fallback(),
        }
    }
}

/// Durable queue settings shared by the ingestion and webhook queues.
/// Lane keys name the spill files under `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_queue_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_ingest_ready_key")]
    pub ready_key: String,
    #[serde(default = "default_ingest_delayed_key")]
    pub delayed_key: String,
    #[serde(default = "default_ingest_dlq_key")]
    pub dlq_key: String,
    /// Producers shed load above this depth (503 on pushes, skipped scans).
    #[serde(default = "default_queue_high_water_mark")]
    pub high_water_mark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_queue_data_dir(),
            ready_key: default_ingest_ready_key(),
            delayed_key: default_ingest_delayed_key(),
            dlq_key: default_ingest_dlq_key(),
            high_water_mark: default_queue_high_water_mark(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            worker_count: default_worker_count(),
        }
    }
}

/// One upstream provider. `credentials` is provider-shaped: a bearer token
/// for the AeroAPI, `user:pass` for the free network, an API key for the
/// commercial network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub daily_budget: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub free_network: ProviderConfig,
    #[serde(default)]
    pub commercial_network: ProviderConfig,
    #[serde(default)]
    pub aero_api: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_reset_seconds")]
    pub reset_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            reset_seconds: default_breaker_reset_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_webhook_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_true")]
    pub enforce_https: bool,
    #[serde(default = "default_subscriber_rate_limit")]
    pub subscriber_rate_limit_per_minute: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_webhook_ready_key")]
    pub ready_key: String,
    #[serde(default = "default_webhook_delayed_key")]
    pub delayed_key: String,
    #[serde(default = "default_webhook_dlq_key")]
    pub dlq_key: String,
    #[serde(default = "default_queue_high_water_mark")]
    pub high_water_mark: usize,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_webhook_max_attempts(),
            backoff_ms: default_webhook_backoff_ms(),
            enforce_https: true,
            subscriber_rate_limit_per_minute: default_subscriber_rate_limit(),
            circuit_breaker: CircuitBreakerConfig::default(),
            ready_key: default_webhook_ready_key(),
            delayed_key: default_webhook_delayed_key(),
            dlq_key: default_webhook_dlq_key(),
            high_water_mark: default_queue_high_water_mark(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// One anchor point per interval; the provider's quota is 1 req/s.
    #[serde(default = "default_scan_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_scan_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_interface")]
    pub interface: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            interface: default_http_interface(),
            port: default_http_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Opaque bearer tokens accepted on the feeder push endpoint. All feeder
/// pushes carry source priority 10.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeederConfig {
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub live_state: LiveStateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub feeder: FeederConfig,
    #[serde(default = "default_recent_contact_threshold")]
    pub recent_contact_threshold_seconds: u64,
}

/// Hard ceiling on the freshness window, applied regardless of what the
/// config file asks for.
pub const RECENT_CONTACT_THRESHOLD_CAP_SECONDS: u64 = 1800;

impl AppConfig {
    /// Load config from a TOML file. A missing file yields defaults so a
    /// bare `flyover run` works in development.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// The freshness window used by bounds queries, capped at 30 minutes.
    pub fn capped_recent_contact_threshold(&self) -> u64 {
        self.recent_contact_threshold_seconds
            .min(RECENT_CONTACT_THRESHOLD_CAP_SECONDS)
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `FLYOVER_CONFIG` env var
/// 2. `/etc/flyover/flyover.toml` (production/staging)
/// 3. `./flyover.toml` (development)
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLYOVER_CONFIG") {
        return PathBuf::from(path);
    }

    match std::env::var("FLYOVER_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/flyover/flyover.toml"),
        _ => PathBuf::from("./flyover.toml"),
    }
}

fn default_true() -> bool {
    true
}

fn default_live_state_ttl() -> u64 {
    120
}

fn default_live_state_max_entries() -> usize {
    20_000
}

fn default_live_state_cleanup_interval() -> u64 {
    30
}

fn default_min_results_before_db_fallback() -> usize {
    50
}

fn default_queue_data_dir() -> PathBuf {
    match std::env::var("FLYOVER_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/var/lib/flyover/queues"),
        _ => {
            let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{}/.local/share", home)
            });
            PathBuf::from(format!("{}/flyover/queues", data_home))
        }
    }
}

fn default_ingest_ready_key() -> String {
    "queue.ready".to_string()
}

fn default_ingest_delayed_key() -> String {
    "queue.delayed".to_string()
}

fn default_ingest_dlq_key() -> String {
    "queue.dlq".to_string()
}

fn default_webhook_ready_key() -> String {
    "webhook.ready".to_string()
}

fn default_webhook_delayed_key() -> String {
    "webhook.delayed".to_string()
}

fn default_webhook_dlq_key() -> String {
    "webhook.dlq".to_string()
}

fn default_queue_high_water_mark() -> usize {
    50_000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_worker_count() -> usize {
    4
}

fn default_webhook_max_attempts() -> u32 {
    8
}

fn default_webhook_backoff_ms() -> u64 {
    1000
}

fn default_subscriber_rate_limit() -> u32 {
    60
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_reset_seconds() -> u64 {
    300
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_http_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_recent_contact_threshold() -> u64 {
    1800
}
