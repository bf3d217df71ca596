//! Full-pipeline test over real sockets: WebSocket session channel in,
//! synthesized audio out through the HTTP fetch endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use recital::admission::Admission;
use recital::billing::MemoryBilling;
use recital::cache::AudioCache;
use recital::config::GatewayConfig;
use recital::consumer::ResultConsumer;
use recital::documents::{Block, MemoryDocumentStore};
use recital::job::{SynthesisOutput, Variant};
use recital::records::MemoryBlockVariantStore;
use recital::server::{Gateway, serve};
use recital::session::{ServerMessage, SessionChannel};
use recital::substrate::Substrate;
use recital::synth::{SpeechModel, SynthError};
use recital::worker::run_worker;

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
            duration_ms: 800,
        })
    }
}

async fn launch() -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.cache.dir = dir.path().to_path_buf();
    config.models = serde_json::from_value(serde_json::json!([{ "slug": "m1" }])).unwrap();
    let config = Arc::new(config);

    let substrate = Arc::new(Substrate::new());
    let cache = Arc::new(AudioCache::open(&config.cache).await.unwrap());
    let documents = Arc::new(MemoryDocumentStore::new());
    documents.insert_document(
        "doc-1",
        vec![Block::new("The quick brown fox."), Block::new("Jumped over the lazy dog.")],
    );
    let records = Arc::new(MemoryBlockVariantStore::new());
    let billing = Arc::new(MemoryBilling::unlimited());

    let admission = Arc::new(Admission {
        substrate: substrate.clone(),
        cache: cache.clone(),
        documents,
        records: records.clone(),
        billing: billing.clone(),
        config: config.clone(),
    });

    let consumer = ResultConsumer {
        substrate: substrate.clone(),
        cache: cache.clone(),
        records,
        billing,
        config: config.clone(),
    };
    tokio::spawn(consumer.run(substrate.take_results().unwrap()));
    tokio::spawn(run_worker(
        substrate.clone(),
        Arc::new(EchoModel),
        "w1".to_string(),
        Duration::from_millis(100),
    ));

    let sessions = Arc::new(SessionChannel {
        admission,
        substrate: substrate.clone(),
        config: config.clone(),
    });
    let gateway = Arc::new(Gateway { config, substrate, cache, sessions });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve(listener, gateway).await;
    });
    (addr, dir)
}

#[tokio::test]
async fn synthesize_over_websocket_then_fetch_audio() {
    let (addr, _dir) = launch().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/session?anon=tester"))
        .await
        .expect("websocket connect");

    let request = serde_json::json!({
        "type": "synthesize",
        "document_id": "doc-1",
        "block_indices": [0],
        "cursor": 0,
        "model": "m1",
        "voice": "v1",
    });
    ws.send(Message::Text(request.to_string().into())).await.unwrap();

    // Wait for the terminal cached status; queued/processing may precede it.
    let mut audio_url = None;
    let deadline = Duration::from_secs(5);
    while audio_url.is_none() {
        let frame = timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for status")
            .expect("channel closed")
            .expect("read error");
        let Message::Text(text) = frame else { continue };
        let event: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
        if let ServerMessage::Status { status, audio_url: url, model_slug, voice_slug, .. } = event {
            assert_eq!(model_slug, "m1");
            assert_eq!(voice_slug, "v1");
            if status == recital::BlockStatus::Cached {
                audio_url = url;
            }
        }
    }
    let audio_url = audio_url.unwrap();

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://{addr}{audio_url}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "audio/ogg; codecs=opus"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"audio:The quick brown fox.");

    // Range requests serve partial content.
    let response = http
        .get(format!("http://{addr}{audio_url}"))
        .header("range", "bytes=0-4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()["content-range"].to_str().unwrap(),
        format!("bytes 0-4/{}", body.len())
    );
    assert_eq!(&response.bytes().await.unwrap()[..], b"audio");
}

#[tokio::test]
async fn health_endpoint_reports_queues_and_cache() {
    let (addr, _dir) = launch().await;
    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["queues"].get("m1").is_some());
    assert!(body["cache"]["entries"].is_number());
}

#[tokio::test]
async fn uncached_fingerprints_are_not_found() {
    let (addr, _dir) = launch().await;
    let response = reqwest::get(format!("http://{addr}/audio/{}", "ab".repeat(32)))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let response = reqwest::get(format!("http://{addr}/audio/not-hex")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
