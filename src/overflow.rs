//! Serverless overflow client: submit, poll, fetch.
//!
//! When a local queue backs up, the overflow scanner hands jobs to a
//! serverless backend. The completed payload is adapted into the internal
//! result record and published on the same results stream a local worker
//! would use; the consumer's dedup guard resolves the race when both
//! backends finish.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::OverflowConfig;
use crate::job::{Job, SynthesisOutput};

#[derive(Serialize)]
struct SubmitRequest<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
    params: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct TaskState {
    status: String,
    audio_b64: Option<String>,
    codec: Option<String>,
    duration_ms: Option<u64>,
    error: Option<String>,
}

pub struct ServerlessOverflow {
    http: reqwest::Client,
    base: Url,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl ServerlessOverflow {
    pub fn new(http: reqwest::Client, config: &OverflowConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            base: Url::parse(&config.endpoint)?,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            poll_deadline: Duration::from_secs(config.poll_deadline_secs),
        })
    }

    /// Runs the full submit-poll-fetch lifecycle for one job. Errors come
    /// back as the terminal reason string carried by the error result.
    pub async fn synthesize(&self, job: &Job) -> Result<SynthesisOutput, String> {
        let task_id = self.submit(job).await?;
        debug!(job_id = %job.job_id, task_id, "submitted job to serverless overflow");

        let deadline = tokio::time::Instant::now() + self.poll_deadline;
        loop {
            let state = self.poll(&task_id).await?;
            match state.status.as_str() {
                "done" => return adapt_output(state),
                "failed" => {
                    return Err(state
                        .error
                        .unwrap_or_else(|| "overflow task failed".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(format!("overflow task {task_id} timed out"));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn submit(&self, job: &Job) -> Result<String, String> {
        let url = self
            .base
            .join("tasks")
            .map_err(|err| format!("overflow url: {err}"))?;
        let response = self
            .http
            .post(url)
            .json(&SubmitRequest {
                text: &job.text,
                voice: &job.variant.voice,
                speed: job.variant.speed,
                params: &job.variant.params,
            })
            .send()
            .await
            .map_err(|err| format!("overflow submit: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("overflow submit: http {}", response.status()));
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|err| format!("overflow submit body: {err}"))?;
        Ok(body.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskState, String> {
        let url = self
            .base
            .join(&format!("tasks/{task_id}"))
            .map_err(|err| format!("overflow url: {err}"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| format!("overflow poll: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("overflow poll: http {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|err| format!("overflow poll body: {err}"))
    }
}

fn adapt_output(state: TaskState) -> Result<SynthesisOutput, String> {
    let audio_b64 = state.audio_b64.ok_or("overflow result missing audio")?;
    let audio = B64
        .decode(audio_b64.as_bytes())
        .map_err(|err| format!("overflow audio_b64: {err}"))?;
    Ok(SynthesisOutput {
        audio: audio.into(),
        codec: state
            .codec
            .unwrap_or_else(|| "audio/ogg; codecs=opus".to_string()),
        duration_ms: state.duration_ms.unwrap_or(0),
    })
}
