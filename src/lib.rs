//! Job-coordination core for a streaming text-to-speech platform.
//!
//! Recital owns the lifecycle of a synthesis request: fingerprinting a text
//! block into a cache key, deduplicating concurrent requests for the same
//! fingerprint, scheduling work across pull-based workers and in-process
//! dispatchers, retrying and dead-lettering failures with exactly-once
//! billing, evicting stale work when a listener skips forward, and fanning
//! completion events out to subscribed sessions. A content-addressed audio
//! cache sits beside it.
//!
//! # Architecture
//! - [substrate::Substrate] holds every cross-task ordering and exclusion
//!   primitive: per-model queues, in-flight sets, the shared results
//!   stream, inflight dedup keys, subscriber sets, pending sets,
//!   dead-letter queues, and the session pubsub.
//! - [admission::Admission] turns synthesize requests into cache hits,
//!   subscriptions, and at most one enqueued job per fingerprint.
//! - [worker] (pull loops over a [synth::SpeechModel]) and
//!   [dispatcher::ExternalDispatcher] (HTTP backends) drain the queues;
//!   [overflow::ServerlessOverflow] absorbs backlog. All three publish to
//!   the same results stream.
//! - [consumer::ResultConsumer] finalizes each result exactly once: cache
//!   write, durable record update, subscriber notification, billing.
//! - [scanner] runs the periodic visibility and overflow scans.
//! - [session::SessionChannel] speaks the framed-JSON WebSocket protocol;
//!   [server] serves it along with `/audio/{fingerprint}` fetches.
//!
//! Collaborators stay behind traits: [documents::DocumentStore],
//! [records::BlockVariantStore], [billing::BillingService], and
//! [synth::SpeechModel].

/// Dedup and admission of synthesize requests.
pub mod admission;

/// Quota checks and usage recording.
pub mod billing;

/// HTTP response body wrapper.
pub mod body;

/// Content-addressed audio cache with size-bounded eviction.
pub mod cache;

/// Gateway configuration.
pub mod config;

/// Single-consumer result finalization.
pub mod consumer;

/// In-process dispatcher tasks for external HTTP models.
pub mod dispatcher;

/// Document block lookup.
pub mod documents;

/// SHA-256 content fingerprints.
pub mod fingerprint;

/// Jobs, variants, results, and statuses.
pub mod job;

/// Serverless overflow client.
pub mod overflow;

/// Durable block-variant records.
pub mod records;

/// Visibility and overflow scanners, cache maintenance.
pub mod scanner;

/// HTTP loop and route dispatch.
pub mod server;

/// The per-session WebSocket message channel.
pub mod session;

/// Queue substrate: ordering and exclusion primitives.
pub mod substrate;

/// The synthesis model seam.
pub mod synth;

/// Tracing subscriber setup.
pub mod tracing;

/// Local-worker pull protocol.
pub mod worker;

/// WebSocket upgrades.
pub mod ws;

pub use fingerprint::Fingerprint;
pub use job::{BlockStatus, Job, JobResult, SynthesisOutput, Variant};
pub use substrate::Substrate;
