//! The queue substrate: every cross-task ordering and exclusion primitive.
//!
//! Components above this module (admission, workers, dispatchers, the result
//! consumer, the scanners, session channels) rely on these primitives and on
//! nothing else for coordination. Per-model priority queues pop oldest
//! first; claimed jobs move into a per-worker in-flight set; finished
//! attempts land on one shared results stream; inflight dedup keys arbitrate
//! "who owns this fingerprint" with a TTL bounding orphans; subscriber sets
//! collect the sessions waiting on a fingerprint; pending sets track queued
//! block indices per `(user, document)` for cursor eviction; dead-letter
//! queues retain terminal failures; and a per-session pubsub fans status
//! events out to channels.
//!
//! The original deployment put these primitives in a network service. Here
//! they are realized in-process behind one struct so the contract stays in
//! one place; a networked port swaps the internals without touching callers.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::job::{DeadLetter, Job, JobResult, unix_ms};
use crate::session::ServerMessage;

/// Identifier of one connected session channel.
pub type SessionId = String;

/// A claimed job sitting in a worker's in-flight set.
#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub worker_id: String,
    pub started_at: Instant,
    pub job: Job,
}

/// Where an enqueued job lives, for O(log n) removal by block identity.
struct JobLocation {
    model: String,
    queued_at: u64,
    job_id: Uuid,
}

/// One model's ready queue, ordered by enqueue timestamp (ties by job id).
#[derive(Default)]
struct ModelQueue {
    ready: Mutex<BTreeMap<(u64, Uuid), Job>>,
    notify: Notify,
}

pub struct Substrate {
    queues: DashMap<String, Arc<ModelQueue>>,
    job_index: DashMap<(String, String, u32), JobLocation>,
    inflight: DashMap<Uuid, InflightEntry>,
    dedup: DashMap<Fingerprint, Instant>,
    subscribers: DashMap<Fingerprint, HashSet<SessionId>>,
    pending: DashMap<(String, String), BTreeSet<u32>>,
    dead_letters: DashMap<String, Vec<DeadLetter>>,
    channels: DashMap<SessionId, mpsc::UnboundedSender<ServerMessage>>,
    results_tx: mpsc::UnboundedSender<JobResult>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<JobResult>>>,
}

impl Default for Substrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate {
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            queues: DashMap::new(),
            job_index: DashMap::new(),
            inflight: DashMap::new(),
            dedup: DashMap::new(),
            subscribers: DashMap::new(),
            pending: DashMap::new(),
            dead_letters: DashMap::new(),
            channels: DashMap::new(),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
        }
    }

    fn queue(&self, model: &str) -> Arc<ModelQueue> {
        self.queues.entry(model.to_string()).or_default().clone()
    }

    // --- queues ---

    /// Adds a job to its model's queue and indexes it by block identity so
    /// cursor eviction can locate it later.
    pub fn enqueue(&self, job: Job) {
        let queue = self.queue(&job.variant.model);
        self.job_index.insert(
            (job.user_id.clone(), job.document_id.clone(), job.block_idx),
            JobLocation {
                model: job.variant.model.clone(),
                queued_at: job.queued_at,
                job_id: job.job_id,
            },
        );
        queue.ready.lock().insert((job.queued_at, job.job_id), job);
        queue.notify.notify_one();
    }

    /// Pops the oldest ready job and records it in the worker's in-flight
    /// set, waiting up to `timeout` when the queue is empty.
    pub async fn claim_oldest(&self, model: &str, worker_id: &str, timeout: Duration) -> Option<Job> {
        let queue = self.queue(model);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_claim(&queue, worker_id) {
                return Some(job);
            }
            let notified = queue.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    fn try_claim(&self, queue: &ModelQueue, worker_id: &str) -> Option<Job> {
        let (_, job) = queue.ready.lock().pop_first()?;
        // Once claimed the job is no longer cancellable by cursor movement.
        self.job_index
            .remove(&(job.user_id.clone(), job.document_id.clone(), job.block_idx));
        self.inflight.insert(
            job.job_id,
            InflightEntry {
                worker_id: worker_id.to_string(),
                started_at: Instant::now(),
                job: job.clone(),
            },
        );
        Some(job)
    }

    /// Removes a still-queued job by block identity. Returns `None` when the
    /// job was already claimed (or never existed); claimed jobs complete.
    pub fn take_job(&self, user_id: &str, document_id: &str, block_idx: u32) -> Option<Job> {
        let (_, loc) = self
            .job_index
            .remove(&(user_id.to_string(), document_id.to_string(), block_idx))?;
        let queue = self.queue(&loc.model);
        let mut ready = queue.ready.lock();
        ready.remove(&(loc.queued_at, loc.job_id))
    }

    /// Removes and returns queued jobs older than `min_age`, up to `max`.
    /// Used by the overflow scanner to offload a backed-up queue.
    pub fn drain_older_than(&self, model: &str, min_age: Duration, max: usize) -> Vec<Job> {
        let cutoff = unix_ms().saturating_sub(min_age.as_millis() as u64);
        let queue = self.queue(model);
        let mut ready = queue.ready.lock();
        let keys: Vec<(u64, Uuid)> = ready
            .range(..=(cutoff, Uuid::max()))
            .take(max)
            .map(|(k, _)| *k)
            .collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = ready.remove(&key) {
                self.job_index
                    .remove(&(job.user_id.clone(), job.document_id.clone(), job.block_idx));
                drained.push(job);
            }
        }
        drained
    }

    pub fn queue_depth(&self, model: &str) -> usize {
        self.queues
            .get(model)
            .map(|q| q.ready.lock().len())
            .unwrap_or(0)
    }

    // --- in-flight sets ---

    /// Clears a job from the in-flight set. Idempotent: workers clear after
    /// publishing and the consumer clears again during finalization.
    pub fn complete_inflight(&self, job_id: Uuid) -> Option<InflightEntry> {
        self.inflight.remove(&job_id).map(|(_, entry)| entry)
    }

    /// Snapshot of in-flight jobs whose claim is older than the per-model
    /// timeout. The caller removes and requeues or dead-letters them.
    pub fn stuck_inflight(&self, timeout_for: impl Fn(&str) -> Duration) -> Vec<InflightEntry> {
        let now = Instant::now();
        self.inflight
            .iter()
            .filter(|entry| {
                now.duration_since(entry.started_at) > timeout_for(&entry.job.variant.model)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    // --- results stream ---

    /// Appends a finished attempt to the shared results stream.
    pub fn publish_result(&self, result: JobResult) {
        if self.results_tx.send(result).is_err() {
            warn!("results stream closed; dropping result");
        }
    }

    /// Hands the single results receiver to the consumer. Second call
    /// returns `None`; there is one finalizer per process.
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<JobResult>> {
        self.results_rx.lock().take()
    }

    // --- inflight dedup keys ---

    /// Sets the dedup key for `fingerprint` only if absent (or expired),
    /// returning whether this caller won the race and owns the work.
    pub fn set_inflight_dedup(&self, fingerprint: Fingerprint, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.dedup.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(now + ttl);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                true
            }
        }
    }

    /// Extends the key's TTL if present; used when a stuck job is requeued
    /// so the key outlives the whole retry horizon.
    pub fn refresh_inflight_dedup(&self, fingerprint: Fingerprint, ttl: Duration) {
        if let Some(mut expiry) = self.dedup.get_mut(&fingerprint) {
            *expiry = Instant::now() + ttl;
        }
    }

    /// Deletes the dedup key, returning whether a live key existed. The
    /// first deleter wins finalization; everyone else drops their result.
    pub fn delete_inflight_dedup(&self, fingerprint: Fingerprint) -> bool {
        match self.dedup.remove(&fingerprint) {
            Some((_, expiry)) => expiry > Instant::now(),
            None => false,
        }
    }

    pub fn purge_expired_dedup(&self) {
        let now = Instant::now();
        self.dedup.retain(|_, expiry| *expiry > now);
    }

    // --- subscriber sets ---

    pub fn add_subscriber(&self, fingerprint: Fingerprint, session: &SessionId) {
        self.subscribers
            .entry(fingerprint)
            .or_default()
            .insert(session.clone());
    }

    /// Atomically drains and deletes the subscriber set.
    pub fn pop_subscribers(&self, fingerprint: Fingerprint) -> HashSet<SessionId> {
        self.subscribers
            .remove(&fingerprint)
            .map(|(_, set)| set)
            .unwrap_or_default()
    }

    /// Read-only view, for non-terminal notifications (`processing`).
    pub fn peek_subscribers(&self, fingerprint: Fingerprint) -> Vec<SessionId> {
        self.subscribers
            .get(&fingerprint)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // --- pending sets ---

    pub fn add_pending(&self, user_id: &str, document_id: &str, block_idx: u32) {
        self.pending
            .entry((user_id.to_string(), document_id.to_string()))
            .or_default()
            .insert(block_idx);
    }

    pub fn remove_pending(&self, user_id: &str, document_id: &str, block_idx: u32) {
        if let Some(mut set) = self
            .pending
            .get_mut(&(user_id.to_string(), document_id.to_string()))
        {
            set.remove(&block_idx);
        }
    }

    /// Range-evicts pending indices outside `[cursor - window, cursor + window]`,
    /// returning them in ascending order.
    pub fn remove_pending_outside(
        &self,
        user_id: &str,
        document_id: &str,
        cursor: u32,
        window: u32,
    ) -> Vec<u32> {
        let lo = cursor.saturating_sub(window);
        let hi = cursor.saturating_add(window);
        let Some(mut set) = self
            .pending
            .get_mut(&(user_id.to_string(), document_id.to_string()))
        else {
            return Vec::new();
        };
        let evicted: Vec<u32> = set.iter().copied().filter(|idx| *idx < lo || *idx > hi).collect();
        for idx in &evicted {
            set.remove(idx);
        }
        evicted
    }

    // --- dead-letter queues ---

    pub fn dead_letter(&self, letter: DeadLetter) {
        self.dead_letters
            .entry(letter.job.variant.model.clone())
            .or_default()
            .push(letter);
    }

    pub fn dead_letters(&self, model: &str) -> Vec<DeadLetter> {
        self.dead_letters
            .get(model)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn purge_dead_letters(&self) {
        let now = unix_ms();
        self.dead_letters.retain(|_, list| {
            list.retain(|letter| letter.expires_at > now);
            !list.is_empty()
        });
    }

    // --- session pubsub ---

    /// Registers a session channel, returning its event receiver. A second
    /// registration under the same id replaces the first.
    pub fn register_session(&self, session: &SessionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(session.clone(), tx);
        rx
    }

    pub fn unregister_session(&self, session: &SessionId) {
        self.channels.remove(session);
    }

    /// Fire-and-forget delivery; a slow or gone client never blocks the
    /// substrate.
    pub fn publish(&self, session: &SessionId, message: ServerMessage) {
        if let Some(tx) = self.channels.get(session) {
            let _ = tx.send(message);
        }
    }

    /// Sends to every current subscriber of a fingerprint without draining
    /// the set.
    pub fn broadcast_status(&self, fingerprint: Fingerprint, message: ServerMessage) {
        for session in self.peek_subscribers(fingerprint) {
            self.publish(&session, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Variant;
    use std::collections::BTreeMap;

    fn variant(model: &str) -> Variant {
        Variant {
            model: model.to_string(),
            voice: "v1".to_string(),
            speed: 1.0,
            params: BTreeMap::new(),
        }
    }

    fn job(user: &str, doc: &str, idx: u32, queued_at: u64) -> Job {
        let mut job = Job::new(user, doc, idx, &format!("text {idx}"), variant("m1"));
        job.queued_at = queued_at;
        job
    }

    #[tokio::test]
    async fn claim_pops_oldest_first() {
        let substrate = Substrate::new();
        substrate.enqueue(job("u", "d", 1, 200));
        substrate.enqueue(job("u", "d", 0, 100));
        let first = substrate
            .claim_oldest("m1", "w1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.block_idx, 0);
        let second = substrate
            .claim_oldest("m1", "w1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second.block_idx, 1);
        assert_eq!(substrate.inflight_len(), 2);
    }

    #[tokio::test]
    async fn claim_times_out_on_empty_queue() {
        let substrate = Substrate::new();
        let start = std::time::Instant::now();
        let claimed = substrate
            .claim_oldest("m1", "w1", Duration::from_millis(30))
            .await;
        assert!(claimed.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn claim_wakes_on_enqueue() {
        let substrate = Arc::new(Substrate::new());
        let claimer = {
            let substrate = substrate.clone();
            tokio::spawn(async move {
                substrate.claim_oldest("m1", "w1", Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        substrate.enqueue(job("u", "d", 7, unix_ms()));
        let claimed = claimer.await.unwrap().unwrap();
        assert_eq!(claimed.block_idx, 7);
    }

    #[test]
    fn dedup_key_single_winner() {
        let substrate = Substrate::new();
        let f = variant("m1").fingerprint("hello");
        assert!(substrate.set_inflight_dedup(f, Duration::from_secs(10)));
        assert!(!substrate.set_inflight_dedup(f, Duration::from_secs(10)));
        // First deleter wins; the second delete sees nothing.
        assert!(substrate.delete_inflight_dedup(f));
        assert!(!substrate.delete_inflight_dedup(f));
        // Freed key can be claimed again.
        assert!(substrate.set_inflight_dedup(f, Duration::from_secs(10)));
    }

    #[test]
    fn expired_dedup_key_is_reclaimable() {
        let substrate = Substrate::new();
        let f = variant("m1").fingerprint("short ttl");
        assert!(substrate.set_inflight_dedup(f, Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(substrate.set_inflight_dedup(f, Duration::from_secs(10)));
    }

    #[test]
    fn refresh_keeps_requeued_keys_alive() {
        let substrate = Substrate::new();
        let f = variant("m1").fingerprint("refresh me");
        // Refreshing an absent key never creates one.
        substrate.refresh_inflight_dedup(f, Duration::from_secs(10));
        assert!(substrate.set_inflight_dedup(f, Duration::from_millis(0)));
        // A requeue-time refresh revives the claim even at the TTL edge.
        substrate.refresh_inflight_dedup(f, Duration::from_secs(10));
        assert!(!substrate.set_inflight_dedup(f, Duration::from_secs(10)));
    }

    #[test]
    fn pending_window_eviction_is_exact() {
        let substrate = Substrate::new();
        for idx in 0..=20 {
            substrate.add_pending("u", "d", idx);
        }
        let evicted = substrate.remove_pending_outside("u", "d", 15, 5);
        assert_eq!(evicted, (0..=9).collect::<Vec<u32>>());
        // Indices 10..=20 stay; a second pass evicts nothing.
        assert!(substrate.remove_pending_outside("u", "d", 15, 5).is_empty());
    }

    #[test]
    fn take_job_only_removes_queued_jobs() {
        let substrate = Substrate::new();
        substrate.enqueue(job("u", "d", 0, 100));
        let taken = substrate.take_job("u", "d", 0).unwrap();
        assert_eq!(taken.block_idx, 0);
        assert!(substrate.take_job("u", "d", 0).is_none());
        assert_eq!(substrate.queue_depth("m1"), 0);
    }

    #[tokio::test]
    async fn claimed_job_is_not_takeable() {
        let substrate = Substrate::new();
        substrate.enqueue(job("u", "d", 0, 100));
        substrate
            .claim_oldest("m1", "w1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(substrate.take_job("u", "d", 0).is_none());
    }

    #[test]
    fn drain_respects_age_cutoff_and_batch() {
        let substrate = Substrate::new();
        let now = unix_ms();
        substrate.enqueue(job("u", "d", 0, now.saturating_sub(60_000)));
        substrate.enqueue(job("u", "d", 1, now.saturating_sub(45_000)));
        substrate.enqueue(job("u", "d", 2, now));
        let drained = substrate.drain_older_than("m1", Duration::from_secs(30), 1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].block_idx, 0);
        let drained = substrate.drain_older_than("m1", Duration::from_secs(30), 10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].block_idx, 1);
        assert_eq!(substrate.queue_depth("m1"), 1);
    }

    #[test]
    fn subscribers_drain_once() {
        let substrate = Substrate::new();
        let f = variant("m1").fingerprint("sub");
        substrate.add_subscriber(f, &"s1".to_string());
        substrate.add_subscriber(f, &"s2".to_string());
        substrate.add_subscriber(f, &"s1".to_string());
        let drained = substrate.pop_subscribers(f);
        assert_eq!(drained.len(), 2);
        assert!(substrate.pop_subscribers(f).is_empty());
    }

    #[test]
    fn dead_letters_expire() {
        let substrate = Substrate::new();
        let now = unix_ms();
        let mut letter = DeadLetter {
            job: job("u", "d", 0, now),
            error: "boom".into(),
            dead_lettered_at: now,
            expires_at: now.saturating_sub(1),
        };
        substrate.dead_letter(letter.clone());
        letter.expires_at = now + 60_000;
        substrate.dead_letter(letter);
        assert_eq!(substrate.dead_letters("m1").len(), 2);
        substrate.purge_dead_letters();
        assert_eq!(substrate.dead_letters("m1").len(), 1);
    }
}
