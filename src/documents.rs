//! Document block lookup seam.
//!
//! Ingestion and markdown transformation happen upstream; the gateway only
//! needs to resolve `(document_id, block_idx)` to the block text when a
//! session asks for synthesis. The in-memory store backs tests and the
//! development binary; a persistent implementation is a drop-in.

use async_trait::async_trait;
use dashmap::DashMap;

/// The atomic unit of a document, as the pipeline produced it.
#[derive(Debug, Clone)]
pub struct Block {
    pub text: String,
    pub est_duration_ms: u64,
}

impl Block {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        // Rough listening-time estimate, ~180 words per minute.
        let words = text.split_whitespace().count() as u64;
        let est_duration_ms = words * 60_000 / 180;
        Self { text, est_duration_ms }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn block(&self, document_id: &str, block_idx: u32) -> Option<Block>;
}

/// Process-local document store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Vec<Block>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(&self, document_id: &str, blocks: Vec<Block>) {
        self.documents.insert(document_id.to_string(), blocks);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn block(&self, document_id: &str, block_idx: u32) -> Option<Block> {
        self.documents
            .get(document_id)
            .and_then(|blocks| blocks.get(block_idx as usize).cloned())
    }
}
