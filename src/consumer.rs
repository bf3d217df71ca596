//! The result consumer: single finalizer of the shared results stream.
//!
//! One consumer per gateway process drains every result, whichever backend
//! produced it. Finalization is gated by the atomic dedup-key delete: the
//! first result to delete its fingerprint's key wins, every later result
//! for the same inflight window is dropped without billing or client
//! effect. The cache write always happens before the subscriber
//! notification, so a client fetching the URL after a `cached` event finds
//! the bytes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::billing::BillingService;
use crate::cache::{AudioCache, AudioMeta};
use crate::config::GatewayConfig;
use crate::fingerprint::Fingerprint;
use crate::job::{BlockStatus, JobResult};
use crate::records::{BlockVariantStore, VariantKey, VariantRecord, VariantStatus};
use crate::session::ServerMessage;
use crate::substrate::Substrate;

pub struct ResultConsumer {
    pub substrate: Arc<Substrate>,
    pub cache: Arc<AudioCache>,
    pub records: Arc<dyn BlockVariantStore>,
    pub billing: Arc<dyn BillingService>,
    pub config: Arc<GatewayConfig>,
}

impl ResultConsumer {
    pub async fn run(self, mut results: mpsc::UnboundedReceiver<JobResult>) {
        while let Some(result) = results.recv().await {
            self.finalize(result).await;
        }
        info!("results stream closed; consumer exiting");
    }

    /// Finalizes one result exactly once per fingerprint per inflight
    /// window.
    pub async fn finalize(&self, result: JobResult) {
        let job = &result.job;
        let fingerprint = job.fingerprint;

        if !self.substrate.delete_inflight_dedup(fingerprint) {
            // A concurrent finalize already won (retry overtaken by the
            // original, or overflow racing a local worker). Drop silently;
            // this is the double-billing guard.
            debug!(job_id = %job.job_id, %fingerprint, "duplicate result dropped");
            return;
        }

        self.substrate.complete_inflight(job.job_id);
        self.substrate
            .remove_pending(&job.user_id, &job.document_id, job.block_idx);

        let key = VariantKey::for_job(job);
        match &result.outcome {
            Err(reason) => {
                warn!(job_id = %job.job_id, %fingerprint, %reason, "finalizing error result");
                self.records
                    .upsert(
                        key,
                        VariantRecord {
                            fingerprint,
                            duration_ms: None,
                            status: VariantStatus::Error,
                        },
                    )
                    .await;
                self.notify(
                    fingerprint,
                    ServerMessage::block_status(
                        &job.document_id,
                        job.block_idx,
                        BlockStatus::Error,
                        &job.variant,
                    )
                    .with_error(reason.clone()),
                );
            }
            Ok(output) if output.audio.is_empty() => {
                // Valid input, nothing to synthesize (whitespace-only and
                // the like). Not billed.
                self.records
                    .upsert(
                        key,
                        VariantRecord {
                            fingerprint,
                            duration_ms: Some(0),
                            status: VariantStatus::Skipped,
                        },
                    )
                    .await;
                self.notify(
                    fingerprint,
                    ServerMessage::block_status(
                        &job.document_id,
                        job.block_idx,
                        BlockStatus::Skipped,
                        &job.variant,
                    ),
                );
            }
            Ok(output) => {
                let meta = AudioMeta {
                    codec: output.codec.clone(),
                    duration_ms: output.duration_ms,
                };
                if let Err(err) = self.cache.put(fingerprint, &output.audio, meta).await {
                    // Transient: the dedup key is already freed, so the
                    // fingerprint can be re-admitted later.
                    warn!(job_id = %job.job_id, %fingerprint, %err, "audio cache write failed");
                    self.records
                        .upsert(
                            key,
                            VariantRecord {
                                fingerprint,
                                duration_ms: None,
                                status: VariantStatus::Error,
                            },
                        )
                        .await;
                    self.notify(
                        fingerprint,
                        ServerMessage::block_status(
                            &job.document_id,
                            job.block_idx,
                            BlockStatus::Error,
                            &job.variant,
                        )
                        .with_error("audio cache write failed".to_string()),
                    );
                    return;
                }

                self.records
                    .upsert(
                        key,
                        VariantRecord {
                            fingerprint,
                            duration_ms: Some(output.duration_ms),
                            status: VariantStatus::Cached,
                        },
                    )
                    .await;
                self.notify(
                    fingerprint,
                    ServerMessage::block_status(
                        &job.document_id,
                        job.block_idx,
                        BlockStatus::Cached,
                        &job.variant,
                    )
                    .with_audio_url(format!("/audio/{fingerprint}")),
                );

                let multiplier = self
                    .config
                    .model(&job.variant.model)
                    .map(|m| m.char_multiplier)
                    .unwrap_or(1.0);
                let units = (job.text.chars().count() as f64 * multiplier).round() as u64;
                self.billing
                    .record_usage(&job.user_id, &job.variant.model, units)
                    .await;
                info!(
                    job_id = %job.job_id,
                    %fingerprint,
                    worker = %result.worker_id,
                    duration_ms = output.duration_ms,
                    units,
                    "finalized synthesis result"
                );
            }
        }
    }

    /// Best-effort terminal notification; drains the subscriber set.
    fn notify(&self, fingerprint: Fingerprint, message: ServerMessage) {
        for session in self.substrate.pop_subscribers(fingerprint) {
            self.substrate.publish(&session, message.clone());
        }
    }
}
