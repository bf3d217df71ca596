//! Local-worker protocol: the pull loop a model process runs.
//!
//! Workers are stateless. Each slot claims the oldest ready job, synthesizes
//! through its [`SpeechModel`], publishes the result on the shared stream,
//! and clears its in-flight entry. A crash (or a transient model failure)
//! leaves the job in the in-flight set, where the visibility scanner
//! recovers it. Replicas scale by running more worker loops.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::job::{BlockStatus, JobResult};
use crate::session::ServerMessage;
use crate::substrate::Substrate;
use crate::synth::{SpeechModel, SynthError};

/// Runs a worker slot forever. One job at a time per slot.
pub async fn run_worker(
    substrate: Arc<Substrate>,
    model: Arc<dyn SpeechModel>,
    worker_id: String,
    claim_wait: Duration,
) {
    loop {
        work_one(&substrate, model.as_ref(), &worker_id, claim_wait).await;
    }
}

/// Claims and processes at most one job; returns whether a job was claimed.
pub async fn work_one(
    substrate: &Substrate,
    model: &dyn SpeechModel,
    worker_id: &str,
    claim_wait: Duration,
) -> bool {
    let Some(job) = substrate.claim_oldest(model.slug(), worker_id, claim_wait).await else {
        return false;
    };

    substrate.broadcast_status(
        job.fingerprint,
        ServerMessage::block_status(
            &job.document_id,
            job.block_idx,
            BlockStatus::Processing,
            &job.variant,
        ),
    );
    debug!(job_id = %job.job_id, worker = worker_id, "claimed synthesis job");

    let job_id = job.job_id;
    match model.synthesize(&job.text, &job.variant).await {
        Ok(output) => {
            substrate.publish_result(JobResult {
                job,
                worker_id: worker_id.to_string(),
                outcome: Ok(output),
            });
            substrate.complete_inflight(job_id);
        }
        Err(SynthError::Terminal(reason)) => {
            warn!(job_id = %job_id, worker = worker_id, %reason, "terminal synthesis failure");
            substrate.publish_result(JobResult {
                job,
                worker_id: worker_id.to_string(),
                outcome: Err(reason),
            });
            substrate.complete_inflight(job_id);
        }
        Err(SynthError::Transient(reason)) => {
            // Leave the job in-flight; the visibility scanner requeues it.
            warn!(job_id = %job_id, worker = worker_id, %reason, "transient synthesis failure");
        }
    }
    true
}
