//! End-to-end scenarios over the real components: admission through
//! workers, the result consumer, the scanners, and the session channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::timeout;

use recital::admission::{Admission, SynthesizeRequest};
use recital::billing::MemoryBilling;
use recital::cache::{AudioCache, AudioMeta};
use recital::config::GatewayConfig;
use recital::consumer::ResultConsumer;
use recital::documents::{Block, MemoryDocumentStore};
use recital::job::{BlockStatus, SynthesisOutput, Variant};
use recital::records::{BlockVariantStore, MemoryBlockVariantStore, VariantKey, VariantStatus};
use recital::scanner::VisibilityScanner;
use recital::session::{ServerMessage, SessionChannel, SessionIdentity};
use recital::substrate::Substrate;
use recital::synth::{SpeechModel, SynthError};
use recital::worker::work_one;
use recital::{Fingerprint, JobResult};

/// Synthesizes `audio:<text>` instantly.
struct EchoModel;

#[async_trait]
impl SpeechModel for EchoModel {
    fn slug(&self) -> &str {
        "m1"
    }

    async fn synthesize(&self, text: &str, _variant: &Variant) -> Result<SynthesisOutput, SynthError> {
        Ok(SynthesisOutput {
            audio: Bytes::from(format!("audio:{text}")),
            codec: "audio/ogg; codecs=opus".to_string(),
            duration_ms: 1000,
        })
    }
}

/// Fails with a transient error on every call.
struct BrokenModel;

#[async_trait]
impl SpeechModel for BrokenModel {
    fn slug(&self) -> &str {
        "m1"
    }

    async fn synthesize(&self, _text: &str, _variant: &Variant) -> Result<SynthesisOutput, SynthError> {
        Err(SynthError::Transient("model crashed".to_string()))
    }
}

struct Stack {
    config: Arc<GatewayConfig>,
    substrate: Arc<Substrate>,
    cache: Arc<AudioCache>,
    documents: Arc<MemoryDocumentStore>,
    records: Arc<MemoryBlockVariantStore>,
    billing: Arc<MemoryBilling>,
    admission: Arc<Admission>,
    consumer: ResultConsumer,
    results: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<JobResult>>,
    _dir: tempfile::TempDir,
}

async fn stack(models: serde_json::Value) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.cache.dir = dir.path().to_path_buf();
    config.models = serde_json::from_value(models).unwrap();
    config.session.eviction_window = 5;
    let config = Arc::new(config);

    let substrate = Arc::new(Substrate::new());
    let cache = Arc::new(AudioCache::open(&config.cache).await.unwrap());
    let documents = Arc::new(MemoryDocumentStore::new());
    let records = Arc::new(MemoryBlockVariantStore::new());
    let billing = Arc::new(MemoryBilling::unlimited());

    let admission = Arc::new(Admission {
        substrate: substrate.clone(),
        cache: cache.clone(),
        documents: documents.clone(),
        records: records.clone(),
        billing: billing.clone(),
        config: config.clone(),
    });
    let consumer = ResultConsumer {
        substrate: substrate.clone(),
        cache: cache.clone(),
        records: records.clone(),
        billing: billing.clone(),
        config: config.clone(),
    };
    let results = tokio::sync::Mutex::new(substrate.take_results().unwrap());

    Stack {
        config,
        substrate,
        cache,
        documents,
        records,
        billing,
        admission,
        consumer,
        results,
        _dir: dir,
    }
}

fn variant() -> Variant {
    Variant { model: "m1".into(), voice: "v1".into(), speed: 1.0, params: BTreeMap::new() }
}

fn request(doc: &str, indices: Vec<u32>) -> SynthesizeRequest {
    SynthesizeRequest {
        document_id: doc.into(),
        block_indices: indices,
        cursor: 0,
        variant: variant(),
    }
}

/// Drives one published result through the consumer.
async fn finalize_next(stack: &Stack) {
    let result = timeout(Duration::from_secs(2), stack.results.lock().await.recv())
        .await
        .expect("timed out waiting for a result")
        .expect("results stream closed");
    stack.consumer.finalize(result).await;
}

#[tokio::test]
async fn cache_hit_answers_without_touching_the_queue() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    stack.documents.insert_document("doc", vec![Block::new("Hello")]);
    let fingerprint = variant().fingerprint("Hello");
    stack
        .cache
        .put(fingerprint, b"already here", AudioMeta { codec: "audio/ogg".into(), duration_ms: 700 })
        .await
        .unwrap();

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;

    match events.try_recv().unwrap() {
        ServerMessage::Status { block_idx, status, audio_url, .. } => {
            assert_eq!(block_idx, 0);
            assert_eq!(status, BlockStatus::Cached);
            assert_eq!(audio_url.unwrap(), format!("/audio/{fingerprint}"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_err());
    assert_eq!(stack.substrate.queue_depth("m1"), 0);
    assert!(stack.billing.entries().is_empty());
}

#[tokio::test]
async fn concurrent_sessions_share_one_synthesis() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    stack.documents.insert_document("doc", vec![Block::new("World")]);

    let a = "sess-a".to_string();
    let b = "sess-b".to_string();
    let mut events_a = stack.substrate.register_session(&a);
    let mut events_b = stack.substrate.register_session(&b);

    stack.admission.admit(&a, "user-a", request("doc", vec![0])).await;
    stack.admission.admit(&b, "user-b", request("doc", vec![0])).await;
    assert_eq!(stack.substrate.queue_depth("m1"), 1);

    assert!(
        work_one(&stack.substrate, &EchoModel, "w1", Duration::from_millis(100)).await,
        "worker should have claimed the single job"
    );
    finalize_next(&stack).await;

    for events in [&mut events_a, &mut events_b] {
        let mut terminal = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServerMessage::Status { status, .. } = event {
                if status == BlockStatus::Cached {
                    terminal.push(status);
                }
            }
        }
        assert_eq!(terminal.len(), 1, "each session hears cached exactly once");
    }
    assert_eq!(stack.billing.entries().len(), 1);
    assert_eq!(stack.cache.len(), 1);
}

#[tokio::test]
async fn crashed_worker_is_requeued_then_succeeds() {
    let stack = stack(serde_json::json!([
        {"slug": "m1", "visibility_timeout_secs": 0, "max_retries": 2}
    ]))
    .await;
    stack.documents.insert_document("doc", vec![Block::new("retry me")]);
    let fingerprint = variant().fingerprint("retry me");
    let scanner =
        VisibilityScanner { substrate: stack.substrate.clone(), config: stack.config.clone() };

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;

    // First worker claims and "crashes": no result is ever published.
    stack
        .substrate
        .claim_oldest("m1", "w1", Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    scanner.scan();

    // The dedup key still guards the fingerprint through the retry.
    assert!(!stack.substrate.set_inflight_dedup(fingerprint, Duration::from_secs(60)));

    // Second worker succeeds.
    assert!(work_one(&stack.substrate, &EchoModel, "w2", Duration::from_millis(100)).await);
    finalize_next(&stack).await;

    let mut cached = 0;
    while let Ok(event) = events.try_recv() {
        if let ServerMessage::Status { status, .. } = event {
            if status == BlockStatus::Cached {
                cached += 1;
            }
        }
    }
    assert_eq!(cached, 1);
    assert_eq!(stack.billing.entries().len(), 1);
    assert!(stack.substrate.dead_letters("m1").is_empty());
}

#[tokio::test]
async fn overflow_and_local_results_finalize_once() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    stack.documents.insert_document("doc", vec![Block::new("raced")]);

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;

    // The local worker completes...
    assert!(work_one(&stack.substrate, &EchoModel, "w1", Duration::from_millis(100)).await);
    // ...and the overflow path finishes a moment later with its own result.
    let duplicate = {
        let result = timeout(Duration::from_secs(2), stack.results.lock().await.recv())
            .await
            .unwrap()
            .unwrap();
        let mut other = result.clone();
        other.worker_id = "overflow".to_string();
        stack.consumer.finalize(result).await;
        other
    };
    stack.consumer.finalize(duplicate).await;

    let mut cached = 0;
    while let Ok(event) = events.try_recv() {
        if let ServerMessage::Status { status, .. } = event {
            if status == BlockStatus::Cached {
                cached += 1;
            }
        }
    }
    assert_eq!(cached, 1);
    assert_eq!(stack.billing.entries().len(), 1);
}

#[tokio::test]
async fn cursor_movement_evicts_blocks_behind_the_window() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    let blocks: Vec<Block> = (0..=20).map(|i| Block::new(format!("block {i}"))).collect();
    stack.documents.insert_document("doc", blocks);

    let sessions = Arc::new(SessionChannel {
        admission: stack.admission.clone(),
        substrate: stack.substrate.clone(),
        config: stack.config.clone(),
    });
    let identity =
        SessionIdentity { session_id: "sess".to_string(), user_id: "user-a".to_string() };

    let mut events = stack.substrate.register_session(&identity.session_id);
    stack
        .admission
        .admit(&identity.session_id, &identity.user_id, request("doc", (0..=20).collect()))
        .await;
    assert_eq!(stack.substrate.queue_depth("m1"), 21);
    while events.try_recv().is_ok() {}

    // Window is 5 in this stack: cursor 15 keeps blocks 10..=20.
    sessions.apply_cursor(&identity, "doc", 15);

    match events.try_recv().unwrap() {
        ServerMessage::Evicted { document_id, block_indices } => {
            assert_eq!(document_id, "doc");
            assert_eq!(block_indices, (0..=9).collect::<Vec<u32>>());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(stack.substrate.queue_depth("m1"), 11);

    // Evicted fingerprints are re-admittable immediately.
    let f = variant().fingerprint("block 0");
    assert!(stack.substrate.set_inflight_dedup(f, Duration::from_secs(60)));
}

#[tokio::test]
async fn persistent_failure_dead_letters_with_the_original_payload() {
    let stack = stack(serde_json::json!([
        {"slug": "m1", "visibility_timeout_secs": 0, "max_retries": 1}
    ]))
    .await;
    stack.documents.insert_document("doc", vec![Block::new("malformed ???")]);
    let scanner =
        VisibilityScanner { substrate: stack.substrate.clone(), config: stack.config.clone() };

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;

    for _ in 0..2 {
        assert!(work_one(&stack.substrate, &BrokenModel, "w1", Duration::from_millis(100)).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        scanner.scan();
    }
    finalize_next(&stack).await;

    let letters = stack.substrate.dead_letters("m1");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job.text, "malformed ???");
    assert!(letters[0].expires_at > letters[0].dead_lettered_at);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let ServerMessage::Status { status, error, .. } = event {
            if status == BlockStatus::Error {
                saw_error = true;
                assert!(error.is_some());
            }
        }
    }
    assert!(saw_error);
    assert!(stack.billing.entries().is_empty());

    let key = VariantKey {
        document_id: "doc".into(),
        block_idx: 0,
        model: "m1".into(),
        voice: "v1".into(),
    };
    assert_eq!(stack.records.get(&key).await.unwrap().status, VariantStatus::Error);
}

#[tokio::test]
async fn readmission_after_terminal_cached_is_synchronous() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    stack.documents.insert_document("doc", vec![Block::new("twice")]);

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;
    assert!(work_one(&stack.substrate, &EchoModel, "w1", Duration::from_millis(100)).await);
    finalize_next(&stack).await;
    while events.try_recv().is_ok() {}

    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;
    match events.try_recv().unwrap() {
        ServerMessage::Status { status, .. } => assert_eq!(status, BlockStatus::Cached),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(stack.substrate.queue_depth("m1"), 0);
    assert_eq!(stack.billing.entries().len(), 1, "cache hits are never billed");
}

#[tokio::test]
async fn fingerprint_url_serves_the_finalized_bytes() {
    let stack = stack(serde_json::json!([{ "slug": "m1" }])).await;
    stack.documents.insert_document("doc", vec![Block::new("fetch me")]);

    let session = "sess".to_string();
    let mut events = stack.substrate.register_session(&session);
    stack.admission.admit(&session, "user-a", request("doc", vec![0])).await;
    assert!(work_one(&stack.substrate, &EchoModel, "w1", Duration::from_millis(100)).await);
    finalize_next(&stack).await;

    let mut url = None;
    while let Ok(event) = events.try_recv() {
        if let ServerMessage::Status { status: BlockStatus::Cached, audio_url, .. } = event {
            url = audio_url;
        }
    }
    let url = url.expect("cached event carries the audio url");
    let hex = url.strip_prefix("/audio/").unwrap();
    let fingerprint = Fingerprint::parse_hex(hex).unwrap();

    // The bytes behind the URL are the ones the worker produced.
    let (bytes, meta) = stack.cache.get(fingerprint).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"audio:fetch me");
    assert_eq!(meta.duration_ms, 1000);
}
