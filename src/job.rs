//! Domain types for synthesis jobs and their results.
//!
//! A `Job` is one unit of synthesis work: a block of text voiced under a
//! concrete `Variant`. Jobs get a fresh `job_id` on every enqueue, so the
//! same fingerprint can have several jobs over its lifetime (retries,
//! overflow). Results flow back as `JobResult` records on the shared
//! results stream, where the single consumer finalizes them.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Milliseconds since the unix epoch; queue ordering and retention use this.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The tuple of synthesis parameters that affects the rendered audio.
///
/// Everything in here feeds the fingerprint; user and document identity
/// never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub model: String,
    pub voice: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Model-specific knobs (pitch, style, ...). Sorted map so fingerprints
    /// are independent of client-side key order.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_speed() -> f32 {
    1.0
}

impl Variant {
    pub fn fingerprint(&self, text: &str) -> Fingerprint {
        Fingerprint::compute(text, &self.model, &self.voice, self.speed, &self.params)
    }
}

/// One enqueued unit of synthesis work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub user_id: String,
    pub document_id: String,
    pub block_idx: u32,
    pub text: String,
    pub variant: Variant,
    pub retry_count: u32,
    /// Unix millis at (re-)enqueue time; queues pop oldest first.
    pub queued_at: u64,
}

impl Job {
    pub fn new(user_id: &str, document_id: &str, block_idx: u32, text: &str, variant: Variant) -> Self {
        let fingerprint = variant.fingerprint(text);
        Self {
            job_id: Uuid::new_v4(),
            fingerprint,
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            block_idx,
            text: text.to_string(),
            variant,
            retry_count: 0,
            queued_at: unix_ms(),
        }
    }
}

/// Audio produced by a synthesis backend.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: Bytes,
    /// Encoded codec as a MIME type, e.g. `audio/ogg; codecs=opus`.
    pub codec: String,
    pub duration_ms: u64,
}

/// A finished attempt at a job, published on the shared results stream.
///
/// Error outcomes carry the terminal reason; transient failures never reach
/// the stream (the visibility scanner requeues those).
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: Job,
    pub worker_id: String,
    pub outcome: Result<SynthesisOutput, String>,
}

/// Client-visible lifecycle of one block under one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Queued,
    Processing,
    Cached,
    Skipped,
    Error,
    Evicted,
}

/// A job that exhausted its retries, retained for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub dead_lettered_at: u64,
    pub expires_at: u64,
}
