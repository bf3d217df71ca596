//! The per-session message channel.
//!
//! One bidirectional WebSocket per authenticated session carries synthesize
//! requests and cursor updates inbound, and status/eviction events outbound.
//! Outbound events travel through the substrate pubsub so every component
//! (admission, the result consumer, eviction) shares one delivery path; the
//! socket task here just drains that channel into the sink. Status events
//! always carry model and voice slugs so clients can discard updates from a
//! superseded voice selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{Admission, SynthesizeRequest};
use crate::config::GatewayConfig;
use crate::job::{BlockStatus, Variant};
use crate::substrate::{SessionId, Substrate};

/// Messages a client sends on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Synthesize {
        document_id: String,
        block_indices: Vec<u32>,
        #[serde(default)]
        cursor: u32,
        model: String,
        voice: String,
        #[serde(default = "default_speed")]
        speed: f32,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
    CursorMoved { document_id: String, cursor: u32 },
}

fn default_speed() -> f32 {
    1.0
}

/// Messages the gateway pushes to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        document_id: String,
        block_idx: u32,
        status: BlockStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        model_slug: String,
        voice_slug: String,
    },
    Evicted { document_id: String, block_indices: Vec<u32> },
    Error { reason: String },
}

impl ServerMessage {
    pub fn block_status(
        document_id: &str,
        block_idx: u32,
        status: BlockStatus,
        variant: &Variant,
    ) -> Self {
        Self::Status {
            document_id: document_id.to_string(),
            block_idx,
            status,
            audio_url: None,
            error: None,
            model_slug: variant.model.clone(),
            voice_slug: variant.voice.clone(),
        }
    }

    pub fn with_audio_url(mut self, url: String) -> Self {
        if let Self::Status { audio_url, .. } = &mut self {
            *audio_url = Some(url);
        }
        self
    }

    pub fn with_error(mut self, reason: String) -> Self {
        if let Self::Status { error, .. } = &mut self {
            *error = Some(reason);
        }
        self
    }
}

/// Who is on the other end of a channel.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub user_id: String,
}

impl SessionIdentity {
    /// Resolves the connect query string to an identity. An auth token maps
    /// to the token's user (resolution itself is a collaborator; the raw
    /// token is the opaque key here), `anon` keeps a caller-chosen guest
    /// identity, and a bare connect gets a fresh guest id.
    pub fn from_query(query: Option<&str>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let mut user_id = None;
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" => user_id = Some(value.into_owned()),
                    "anon" if user_id.is_none() => user_id = Some(format!("anon-{value}")),
                    _ => {}
                }
            }
        }
        let user_id = user_id.unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
        Self { session_id, user_id }
    }
}

/// Shared handler for every session channel the gateway serves.
pub struct SessionChannel {
    pub admission: Arc<Admission>,
    pub substrate: Arc<Substrate>,
    pub config: Arc<GatewayConfig>,
}

impl SessionChannel {
    /// Runs one connection to completion: registers the session with the
    /// pubsub, pumps outbound events into the sink, and feeds inbound
    /// frames to admission and eviction.
    pub async fn handle(
        self: Arc<Self>,
        ws: WebSocketStream<TokioIo<Upgraded>>,
        identity: SessionIdentity,
    ) {
        let session_id = identity.session_id.clone();
        info!(session = %session_id, user = %identity.user_id, "session channel opened");

        let mut events = self.substrate.register_session(&session_id);
        let (mut sink, mut stream) = ws.split();

        let forward = tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                let Ok(json) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.on_message(&identity, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(session = %session_id, %err, "session channel read error");
                    break;
                }
            }
        }

        // Subscribers stay registered: if synthesis completes while the
        // client is away, the durable block-variant record reconciles it on
        // reconnect.
        self.substrate.unregister_session(&session_id);
        forward.abort();
        info!(session = %session_id, "session channel closed");
    }

    async fn on_message(&self, identity: &SessionIdentity, raw: &str) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(ClientMessage::Synthesize {
                document_id,
                block_indices,
                cursor,
                model,
                voice,
                speed,
                params,
            }) => {
                // A fresh request also releases work behind its cursor.
                self.apply_cursor(identity, &document_id, cursor);
                let request = SynthesizeRequest {
                    document_id,
                    block_indices,
                    cursor,
                    variant: Variant { model, voice, speed, params },
                };
                self.admission
                    .admit(&identity.session_id, &identity.user_id, request)
                    .await;
            }
            Ok(ClientMessage::CursorMoved { document_id, cursor }) => {
                self.apply_cursor(identity, &document_id, cursor);
            }
            Err(err) => {
                warn!(session = %identity.session_id, %err, "malformed session message");
                self.substrate.publish(
                    &identity.session_id,
                    ServerMessage::Error { reason: format!("malformed message: {err}") },
                );
            }
        }
    }

    /// Drops queued work outside the cursor window. Jobs already claimed by
    /// a worker finish on their own; only still-queued jobs are cancelled,
    /// and a cancelled job releases its fingerprint's dedup key since no
    /// result will ever free it.
    pub fn apply_cursor(&self, identity: &SessionIdentity, document_id: &str, cursor: u32) {
        let window = self.config.session.eviction_window;
        let evicted = self.substrate.remove_pending_outside(
            &identity.user_id,
            document_id,
            cursor,
            window,
        );
        if evicted.is_empty() {
            return;
        }
        for idx in &evicted {
            if let Some(job) = self.substrate.take_job(&identity.user_id, document_id, *idx) {
                self.substrate.delete_inflight_dedup(job.fingerprint);
            }
        }
        debug!(
            session = %identity.session_id,
            document = document_id,
            cursor,
            count = evicted.len(),
            "evicted stale pending blocks"
        );
        self.substrate.publish(
            &identity.session_id,
            ServerMessage::Evicted {
                document_id: document_id.to_string(),
                block_indices: evicted,
            },
        );
    }
}
