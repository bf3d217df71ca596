//! Gateway configuration.
//!
//! Loaded from a JSON file passed as the first CLI argument; every field has
//! a default so a bare `GatewayConfig::default()` yields a runnable gateway
//! with no models registered. Per-model settings (backend kind, visibility
//! timeout, retry budget, overflow) live in [`ModelConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: String,
    pub models: Vec<ModelConfig>,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    /// TTL on inflight dedup keys; bounds orphaned claims.
    pub dedup_ttl_secs: u64,
    /// How often the visibility scanner looks for stuck in-flight jobs.
    pub visibility_scan_secs: u64,
    /// How often the overflow scanner looks for backed-up queues.
    pub overflow_scan_secs: u64,
    pub dead_letter_retention_secs: u64,
    /// How long a worker's blocking claim waits before coming back empty.
    pub claim_wait_secs: u64,
    /// Documents seeded into the in-memory document store at startup.
    /// Development convenience; production feeds the store from ingestion.
    pub seed_documents: Vec<SeedDocument>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8980".to_string(),
            models: Vec::new(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            dedup_ttl_secs: 600,
            visibility_scan_secs: 15,
            overflow_scan_secs: 5,
            dead_letter_retention_secs: 7 * 24 * 3600,
            claim_wait_secs: 5,
            seed_documents: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.low_water_bytes > self.cache.max_bytes {
            anyhow::bail!(
                "cache.low_water_bytes ({}) exceeds cache.max_bytes ({})",
                self.cache.low_water_bytes,
                self.cache.max_bytes
            );
        }
        for model in &self.models {
            if model.slug.is_empty() {
                anyhow::bail!("model with empty slug");
            }
            if self.models.iter().filter(|m| m.slug == model.slug).count() > 1 {
                anyhow::bail!("duplicate model slug {:?}", model.slug);
            }
        }
        Ok(())
    }

    pub fn model(&self, slug: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.slug == slug)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_secs(self.claim_wait_secs)
    }
}

/// One synthesis queue and the backend that drains it.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub slug: String,
    #[serde(default)]
    pub backend: ModelBackend,
    /// Seconds a claimed job may sit in a worker's in-flight set before the
    /// visibility scanner treats it as stuck. Fast models keep this short.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub overflow: Option<OverflowConfig>,
    /// Billing weight: usage units are `chars(text) * char_multiplier`.
    #[serde(default = "default_char_multiplier")]
    pub char_multiplier: f64,
}

impl ModelConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_char_multiplier() -> f64 {
    1.0
}

/// Who drains a model's queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelBackend {
    /// Pull-based workers (local model processes) claim jobs themselves.
    #[default]
    Local,
    /// In-process dispatcher tasks POST each job to an external HTTP API.
    External {
        endpoint: String,
        #[serde(default = "default_dispatchers")]
        dispatchers: usize,
    },
}

fn default_dispatchers() -> usize {
    4
}

/// Offload settings for a backed-up queue.
#[derive(Debug, Clone, Deserialize)]
pub struct OverflowConfig {
    /// Serverless backend base URL (submit-poll-fetch lifecycle).
    pub endpoint: String,
    /// Jobs older than this are offloaded.
    #[serde(default = "default_backlog_age_secs")]
    pub backlog_age_secs: u64,
    /// At most this many jobs offloaded per scan per model.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up polling a submitted task after this long.
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
}

fn default_backlog_age_secs() -> u64 {
    30
}

fn default_max_batch() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_deadline_secs() -> u64 {
    120
}

/// Audio cache sizing and maintenance cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Sweep trigger: total blob bytes above this starts eviction.
    pub max_bytes: u64,
    /// Sweep target: eviction stops once total bytes drop under this.
    pub low_water_bytes: u64,
    /// Batched `last_access` updates are folded in on this cadence.
    pub touch_flush_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./audio-cache"),
            max_bytes: 2 * 1024 * 1024 * 1024,
            low_water_bytes: (2 * 1024 * 1024 * 1024_u64) * 9 / 10,
            touch_flush_secs: 10,
        }
    }
}

impl CacheConfig {
    pub fn touch_flush_interval(&self) -> Duration {
        Duration::from_secs(self.touch_flush_secs)
    }
}

/// Session channel behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cursor eviction keeps pending blocks inside `cursor ± window`.
    pub eviction_window: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { eviction_window: 16 }
    }
}

/// A document seeded into the in-memory store at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedDocument {
    pub id: String,
    pub blocks: Vec<String>,
}
