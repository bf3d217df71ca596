//! External-dispatcher protocol: draining a queue into an HTTP TTS API.
//!
//! Models backed by an external API have no long-running process to pull
//! jobs, so the gateway runs N dispatcher tasks per such queue. Each task
//! claims like a worker but "synthesis" is a POST with exponential backoff
//! on 429/5xx up to a cap; terminal failures publish an error result on the
//! same stream local workers use, so nothing downstream can tell the
//! backends apart.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use http::StatusCode;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::job::{BlockStatus, Job, JobResult, SynthesisOutput};
use crate::session::ServerMessage;
use crate::substrate::Substrate;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential growth
    /// capped at `max`, then full jitter between zero and the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = grown.min(self.max.as_secs_f64());
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=1.0) * capped)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("http {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad payload: {0}")]
    Payload(String),
}

impl DispatchError {
    fn retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::Payload(_) => false,
        }
    }
}

#[derive(Serialize)]
struct RemoteSynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
    params: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RemoteSynthesisResponse {
    audio_b64: String,
    codec: String,
    duration_ms: u64,
}

pub struct ExternalDispatcher {
    pub substrate: Arc<Substrate>,
    pub http: reqwest::Client,
    pub endpoint: Url,
    pub model: String,
    pub retry: RetryPolicy,
    pub claim_wait: Duration,
}

impl ExternalDispatcher {
    /// Runs one dispatcher task forever.
    pub async fn run(self: Arc<Self>, task_idx: usize) {
        let worker_id = format!("dispatch-{}-{task_idx}", self.model);
        loop {
            let Some(job) = self
                .substrate
                .claim_oldest(&self.model, &worker_id, self.claim_wait)
                .await
            else {
                continue;
            };
            self.dispatch(&worker_id, job).await;
        }
    }

    async fn dispatch(&self, worker_id: &str, job: Job) {
        self.substrate.broadcast_status(
            job.fingerprint,
            ServerMessage::block_status(
                &job.document_id,
                job.block_idx,
                BlockStatus::Processing,
                &job.variant,
            ),
        );

        let job_id = job.job_id;
        let outcome = self
            .call_with_backoff(&job)
            .await
            .map_err(|err| err.to_string());
        if let Err(reason) = &outcome {
            warn!(job_id = %job_id, model = %self.model, %reason, "external synthesis failed");
        }
        self.substrate.publish_result(JobResult {
            job,
            worker_id: worker_id.to_string(),
            outcome,
        });
        self.substrate.complete_inflight(job_id);
    }

    async fn call_with_backoff(&self, job: &Job) -> Result<SynthesisOutput, DispatchError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(job).await {
                Ok(output) => return Ok(output),
                Err(err) if err.retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        job_id = %job.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "retrying external synthesis"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(&self, job: &Job) -> Result<SynthesisOutput, DispatchError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&RemoteSynthesisRequest {
                text: &job.text,
                voice: &job.variant.voice,
                speed: job.variant.speed,
                params: &job.variant.params,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body });
        }

        let body: RemoteSynthesisResponse = response.json().await?;
        let audio = B64
            .decode(body.audio_b64.as_bytes())
            .map_err(|err| DispatchError::Payload(format!("audio_b64: {err}")))?;
        Ok(SynthesisOutput {
            audio: audio.into(),
            codec: body.codec,
            duration_ms: body.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: 10,
        };
        for attempt in 0..20 {
            assert!(policy.delay(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn only_throttles_and_server_errors_retry() {
        let throttled = DispatchError::Status { status: StatusCode::TOO_MANY_REQUESTS, body: String::new() };
        let upstream = DispatchError::Status { status: StatusCode::BAD_GATEWAY, body: String::new() };
        let rejected = DispatchError::Status { status: StatusCode::UNPROCESSABLE_ENTITY, body: String::new() };
        let garbled = DispatchError::Payload("audio_b64: bad".into());
        assert!(throttled.retryable());
        assert!(upstream.retryable());
        assert!(!rejected.retryable());
        assert!(!garbled.retryable());
    }
}
