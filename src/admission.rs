//! Admission: turning a synthesize request into cache hits, subscriptions,
//! and at most one enqueued job per fingerprint.
//!
//! Blocks are admitted in input order and independently; one failing block
//! never aborts the batch. Concurrent admissions for the same fingerprint
//! are arbitrated entirely by the atomic inflight dedup key: every caller
//! subscribes, exactly one wins the key and enqueues.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::billing::{BillingService, QuotaDecision};
use crate::cache::AudioCache;
use crate::config::GatewayConfig;
use crate::documents::DocumentStore;
use crate::job::{BlockStatus, Job, Variant};
use crate::records::{BlockVariantStore, VariantKey, VariantRecord, VariantStatus};
use crate::session::ServerMessage;
use crate::substrate::{SessionId, Substrate};

/// A session's synthesize request, after wire decoding.
#[derive(Debug, Clone)]
pub struct SynthesizeRequest {
    pub document_id: String,
    pub block_indices: Vec<u32>,
    pub cursor: u32,
    pub variant: Variant,
}

pub struct Admission {
    pub substrate: Arc<Substrate>,
    pub cache: Arc<AudioCache>,
    pub documents: Arc<dyn DocumentStore>,
    pub records: Arc<dyn BlockVariantStore>,
    pub billing: Arc<dyn BillingService>,
    pub config: Arc<GatewayConfig>,
}

impl Admission {
    pub async fn admit(&self, session: &SessionId, user_id: &str, request: SynthesizeRequest) {
        if self.config.model(&request.variant.model).is_none() {
            warn!(model = %request.variant.model, "synthesize request for unknown model");
            self.substrate.publish(
                session,
                ServerMessage::Error {
                    reason: format!("unknown model {:?}", request.variant.model),
                },
            );
            return;
        }
        for block_idx in &request.block_indices {
            self.admit_block(session, user_id, &request.document_id, *block_idx, &request.variant)
                .await;
        }
    }

    async fn admit_block(
        &self,
        session: &SessionId,
        user_id: &str,
        document_id: &str,
        block_idx: u32,
        variant: &Variant,
    ) {
        if self.billing.check_quota(user_id).await == QuotaDecision::Denied {
            self.substrate.publish(
                session,
                ServerMessage::block_status(document_id, block_idx, BlockStatus::Error, variant)
                    .with_error("usage quota exhausted".to_string()),
            );
            return;
        }

        let Some(block) = self.documents.block(document_id, block_idx).await else {
            self.substrate.publish(
                session,
                ServerMessage::block_status(document_id, block_idx, BlockStatus::Error, variant)
                    .with_error(format!("unknown block {block_idx} in document {document_id}")),
            );
            return;
        };

        let fingerprint = variant.fingerprint(&block.text);
        let key = VariantKey {
            document_id: document_id.to_string(),
            block_idx,
            model: variant.model.clone(),
            voice: variant.voice.clone(),
        };

        if let Some(meta) = self.cache.peek(fingerprint) {
            self.records
                .upsert(
                    key,
                    VariantRecord {
                        fingerprint,
                        duration_ms: Some(meta.duration_ms),
                        status: VariantStatus::Cached,
                    },
                )
                .await;
            self.substrate.publish(
                session,
                ServerMessage::block_status(document_id, block_idx, BlockStatus::Cached, variant)
                    .with_audio_url(format!("/audio/{fingerprint}")),
            );
            trace!(%fingerprint, block_idx, "admission cache hit");
            return;
        }

        self.substrate.add_subscriber(fingerprint, session);

        if self.substrate.set_inflight_dedup(fingerprint, self.config.dedup_ttl()) {
            let job = Job::new(user_id, document_id, block_idx, &block.text, variant.clone());
            self.records
                .upsert(
                    key,
                    VariantRecord {
                        fingerprint,
                        duration_ms: None,
                        status: VariantStatus::Pending,
                    },
                )
                .await;
            self.substrate.add_pending(user_id, document_id, block_idx);
            debug!(
                job_id = %job.job_id,
                %fingerprint,
                model = %variant.model,
                block_idx,
                "enqueued synthesis job"
            );
            self.substrate.enqueue(job);
        } else {
            trace!(%fingerprint, block_idx, "another admission owns this fingerprint");
        }

        self.substrate.publish(
            session,
            ServerMessage::block_status(document_id, block_idx, BlockStatus::Queued, variant),
        );
    }
}
