//! Durable block-variant records.
//!
//! One record per `(document, block, model, voice)` tracks the fingerprint
//! and terminal status of that voicing, so a client reconnecting after a
//! dropped session channel can reconcile without re-synthesizing. The
//! relational store owning these in production sits behind the
//! [`BlockVariantStore`] trait; the in-memory implementation here backs
//! tests and the development binary.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Pending,
    Cached,
    Skipped,
    Error,
}

/// Identity of one voicing of one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub document_id: String,
    pub block_idx: u32,
    pub model: String,
    pub voice: String,
}

impl VariantKey {
    pub fn for_job(job: &crate::job::Job) -> Self {
        Self {
            document_id: job.document_id.clone(),
            block_idx: job.block_idx,
            model: job.variant.model.clone(),
            voice: job.variant.voice.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    pub fingerprint: Fingerprint,
    pub duration_ms: Option<u64>,
    pub status: VariantStatus,
}

#[async_trait]
pub trait BlockVariantStore: Send + Sync {
    async fn upsert(&self, key: VariantKey, record: VariantRecord);
    async fn get(&self, key: &VariantKey) -> Option<VariantRecord>;
}

/// Process-local record store.
#[derive(Default)]
pub struct MemoryBlockVariantStore {
    records: DashMap<VariantKey, VariantRecord>,
}

impl MemoryBlockVariantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockVariantStore for MemoryBlockVariantStore {
    async fn upsert(&self, key: VariantKey, record: VariantRecord) {
        self.records.insert(key, record);
    }

    async fn get(&self, key: &VariantKey) -> Option<VariantRecord> {
        self.records.get(key).map(|r| r.clone())
    }
}
