//! Periodic maintenance: the visibility scanner, the overflow scanner, and
//! the cache tick.
//!
//! One scanner of each kind runs per gateway process on its own timer. The
//! visibility scanner recovers jobs stuck in a worker's in-flight set:
//! under the retry budget they are requeued (with the inflight dedup key's
//! TTL refreshed so the key outlives the whole retry horizon); over it they
//! move to the model's dead-letter queue and an error result is published
//! so subscribers hear about it. The overflow scanner offloads backed-up
//! queues to the serverless backend and funnels the audio back through the
//! shared results stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cache::AudioCache;
use crate::config::GatewayConfig;
use crate::job::{DeadLetter, JobResult, unix_ms};
use crate::overflow::ServerlessOverflow;
use crate::substrate::Substrate;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 2;

pub struct VisibilityScanner {
    pub substrate: Arc<Substrate>,
    pub config: Arc<GatewayConfig>,
}

impl VisibilityScanner {
    pub async fn run(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.visibility_scan_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.scan();
        }
    }

    /// One pass over the in-flight sets plus key/dead-letter housekeeping.
    pub fn scan(&self) {
        let stuck = self.substrate.stuck_inflight(|model| {
            self.config
                .model(model)
                .map(|m| m.visibility_timeout())
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT)
        });

        for entry in stuck {
            // Re-check under removal; the worker may have just finished.
            let Some(entry) = self.substrate.complete_inflight(entry.job.job_id) else {
                continue;
            };
            let mut job = entry.job;
            let max_retries = self
                .config
                .model(&job.variant.model)
                .map(|m| m.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES);

            if job.retry_count < max_retries {
                job.retry_count += 1;
                job.queued_at = unix_ms();
                // The key still guards this fingerprint; keep it alive past
                // the next visibility window instead of letting the TTL
                // race the retries.
                self.substrate
                    .refresh_inflight_dedup(job.fingerprint, self.config.dedup_ttl());
                info!(
                    job_id = %job.job_id,
                    worker = %entry.worker_id,
                    retry = job.retry_count,
                    "requeueing stuck job"
                );
                self.substrate.enqueue(job);
            } else {
                let now = unix_ms();
                let reason = format!(
                    "synthesis gave up after {max_retries} retries (last worker {})",
                    entry.worker_id
                );
                warn!(job_id = %job.job_id, model = %job.variant.model, %reason, "dead-lettering job");
                self.substrate.dead_letter(DeadLetter {
                    job: job.clone(),
                    error: reason.clone(),
                    dead_lettered_at: now,
                    expires_at: now + self.config.dead_letter_retention_secs * 1000,
                });
                self.substrate.publish_result(JobResult {
                    job,
                    worker_id: entry.worker_id,
                    outcome: Err(reason),
                });
            }
        }

        self.substrate.purge_expired_dedup();
        self.substrate.purge_dead_letters();
    }
}

pub struct OverflowScanner {
    substrate: Arc<Substrate>,
    config: Arc<GatewayConfig>,
    targets: HashMap<String, Arc<ServerlessOverflow>>,
}

impl OverflowScanner {
    pub fn new(
        substrate: Arc<Substrate>,
        config: Arc<GatewayConfig>,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let mut targets = HashMap::new();
        for model in &config.models {
            if let Some(overflow) = &model.overflow {
                targets.insert(
                    model.slug.clone(),
                    Arc::new(ServerlessOverflow::new(http.clone(), overflow)?),
                );
            }
        }
        Ok(Self { substrate, config, targets })
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.overflow_scan_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.scan();
        }
    }

    /// Offloads jobs that sat queued past the backlog threshold.
    pub fn scan(&self) {
        for (slug, overflow) in &self.targets {
            let Some(settings) = self.config.model(slug).and_then(|m| m.overflow.as_ref()) else {
                continue;
            };
            let backlog_age = Duration::from_secs(settings.backlog_age_secs);
            let drained = self
                .substrate
                .drain_older_than(slug, backlog_age, settings.max_batch);
            for job in drained {
                self.substrate
                    .remove_pending(&job.user_id, &job.document_id, job.block_idx);
                info!(job_id = %job.job_id, model = %slug, "offloading backed-up job to serverless");
                let substrate = self.substrate.clone();
                let overflow = overflow.clone();
                tokio::spawn(async move {
                    let outcome = overflow.synthesize(&job).await;
                    substrate.publish_result(JobResult {
                        job,
                        worker_id: "overflow".to_string(),
                        outcome,
                    });
                });
            }
        }
    }
}

/// Cache tick: fold batched `last_access` touches into the index and sweep
/// once the size bound is exceeded.
pub async fn run_cache_maintenance(cache: Arc<AudioCache>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        cache.flush_touches();
        if let Err(err) = cache.sweep().await {
            warn!(%err, "cache sweep failed");
        }
    }
}
