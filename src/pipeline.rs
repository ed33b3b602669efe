//! Document ingestion pipeline: classify → extract → chunk → embed → index.
//!
//! One run per document. Entry is guarded by the store's conditional status
//! claim, so concurrent runs for the same document cannot double-process.
//! Chunks are committed one at a time — vector point first, relational row
//! second — giving at-least-once semantics: a failure mid-run leaves the
//! already-committed prefix in place and marks the document `failed`; the
//! next retry purges that prefix before re-extracting.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::chunk_units;
use crate::classify::classify;
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::{EngineError, Result};
use crate::extract::ExtractorRegistry;
use crate::progress::ProgressSink;
use crate::store::Store;
use crate::vector_index::{collection_for, ChunkPayload, VectorIndex, VectorPoint};

/// Everything a pipeline run needs. Cheap to clone; shared across jobs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Store,
    pub registry: Arc<ExtractorRegistry>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub chunking: ChunkingConfig,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestSummary {
    pub chunk_count: u64,
}

/// Deterministic vector point id for a chunk. Retried runs reuse the same
/// ids, so a stray point from a partial run is overwritten, never orphaned
/// twice.
fn vector_point_id(document_id: i64, chunk_index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.to_le_bytes());
    hasher.update(chunk_index.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Process one document end to end. Terminal status is always written:
/// `processed` on success, `failed` (with the error recorded) otherwise.
pub async fn process_document(
    deps: &PipelineDeps,
    document_id: i64,
    progress: &dyn ProgressSink,
) -> Result<IngestSummary> {
    deps.store.try_mark_processing(document_id).await?;

    match run(deps, document_id, progress).await {
        Ok(summary) => {
            deps.store.mark_processed(document_id).await?;
            info!(document_id, chunk_count = summary.chunk_count, "document processed");
            Ok(summary)
        }
        Err(e) => {
            warn!(document_id, error = %e, "document processing failed");
            deps.store.mark_failed(document_id, &e.to_string()).await?;
            Err(e)
        }
    }
}

async fn run(
    deps: &PipelineDeps,
    document_id: i64,
    progress: &dyn ProgressSink,
) -> Result<IngestSummary> {
    let doc = deps.store.get_document(document_id).await?;
    let collection = collection_for(doc.knowledge_base_id);

    // A previous partial run may have left a chunk prefix behind; purge it
    // so retries never duplicate content at query time.
    let stale = deps.store.purge_chunks(document_id).await?;
    if !stale.is_empty() && deps.index.is_initialized(&collection).await? {
        deps.index.delete(&collection, stale).await?;
    }

    let path = Path::new(&doc.file_path);
    let kind = classify(path);
    deps.store.set_document_kind(document_id, kind).await?;

    let extractor = deps.registry.find(kind);
    let units = extractor.extract(path).await?;

    let chunks = chunk_units(
        &units,
        deps.chunking.max_tokens,
        deps.chunking.overlap_tokens,
    );
    let total = chunks.len() as u64;

    deps.index
        .initialize(&collection, deps.embedder.dims())
        .await?;

    for (i, chunk) in chunks.iter().enumerate() {
        let vectors = deps.embedder.embed(std::slice::from_ref(&chunk.text)).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::EmbeddingService("empty embedding response".into()))?;

        let vector_id = vector_point_id(document_id, chunk.index);
        let point = VectorPoint {
            id: vector_id.clone(),
            vector,
            payload: ChunkPayload {
                knowledge_base_id: doc.knowledge_base_id,
                document_id,
                chunk_index: chunk.index,
                content: chunk.text.clone(),
                file_name: doc.file_name.clone(),
            },
        };

        // Vector first, row second: an orphaned vector is invisible to
        // retrieval joins, a row without a vector is a correctness bug.
        deps.index.upsert(&collection, vec![point]).await?;
        deps.store
            .insert_chunk(document_id, chunk.index, &chunk.text, &vector_id)
            .await?;

        progress.report(i as u64 + 1, total);
    }

    Ok(IngestSummary { chunk_count: total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_point_ids_deterministic_and_distinct() {
        let a = vector_point_id(1, 0);
        let b = vector_point_id(1, 0);
        let c = vector_point_id(1, 1);
        let d = vector_point_id(2, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        // Must parse back as a UUID for the vector store
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
