//! Document chunk store interface

use async_trait::async_trait;
use thiserror::Error;

use crate::context::models::ContentChunk;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Read access to indexed document chunks
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Chunks of `doc_id` most relevant to `query`, best first, at most `limit`
    async fn get_relevant_chunks(
        &self,
        doc_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ContentChunk>, StoreError>;

    /// Average chunk size of the document in characters, if known
    async fn average_chunk_chars(&self, doc_id: &str) -> Result<Option<usize>, StoreError>;
}
