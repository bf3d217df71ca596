//! The synthesis seam: models are black boxes behind one async trait.
//!
//! Local model processes implement [`SpeechModel`] and run pull workers
//! against the substrate; external HTTP models are driven by the dispatcher
//! instead and never implement this trait in-process.

use async_trait::async_trait;

use crate::job::{SynthesisOutput, Variant};

/// Failure modes a synthesis backend can report.
///
/// Transient failures are invisible to clients: the job stays in-flight and
/// the visibility scanner requeues it. Terminal failures are published as
/// error results and dead-lettered.
#[derive(Debug, thiserror::Error)]
pub enum SynthError {
    #[error("transient synthesis failure: {0}")]
    Transient(String),
    #[error("terminal synthesis failure: {0}")]
    Terminal(String),
}

/// A text-to-speech model. Consumes one text block, produces encoded audio.
///
/// Implementations may take seconds per call; workers run one job per slot
/// and scale by running more instances. An empty `audio` buffer is the
/// contract for "nothing to say" (whitespace-only input and the like); the
/// result consumer turns it into a `skipped` status.
#[async_trait]
pub trait SpeechModel: Send + Sync {
    /// Queue slug this model serves.
    fn slug(&self) -> &str;

    async fn synthesize(&self, text: &str, variant: &Variant) -> Result<SynthesisOutput, SynthError>;
}
