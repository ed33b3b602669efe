//! Engine-wide error taxonomy.
//!
//! Background jobs capture these at the pipeline boundary and persist the
//! failure on the document row; chat turns map them to an `error` transport
//! event. The HTTP layer converts them to status codes in `server.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A document lifecycle transition that the status machine forbids
    /// (e.g. processing a document that is already `processing`).
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Content extraction failed for a readable file.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The embedding service rejected the request or stayed unreachable
    /// after retries.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The knowledge base has no vector collection yet — nothing was ever
    /// ingested for it.
    #[error("vector index not initialized for knowledge base {0}")]
    IndexNotInitialized(i64),

    /// The vector store returned an error for an existing collection.
    #[error("vector store error: {0}")]
    VectorStore(String),

    /// Row missing, or owned by a different knowledge base / conversation.
    #[error("not found: {0}")]
    NotFound(String),

    /// LLM completion or streaming failure.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The event channel to the client is closed (disconnect).
    #[error("transport closed")]
    TransportClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
