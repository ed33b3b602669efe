//! End-to-end ingestion tests against a real SQLite database, the real
//! extractors and chunker, an in-memory vector index, and a controllable
//! embedder.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use kb_engine::config::{ChunkingConfig, MediaConfig};
use kb_engine::embedding::Embedder;
use kb_engine::error::EngineError;
use kb_engine::extract::ExtractorRegistry;
use kb_engine::models::{DocumentKind, DocumentStatus};
use kb_engine::pipeline::{process_document, PipelineDeps};
use kb_engine::progress::NoProgress;
use kb_engine::store::Store;
use kb_engine::vector_index::{collection_for, MemoryIndex};

/// Embeds every text as a fixed-dimension vector; optionally fails from
/// the nth call onward to simulate a provider outage mid-document.
struct CountingEmbedder {
    calls: AtomicUsize,
    fail_from_call: Option<usize>,
}

impl CountingEmbedder {
    fn healthy() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_from_call: None,
        }
    }

    fn failing_from(call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_from_call: Some(call),
        }
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting-test"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> kb_engine::Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(fail_from) = self.fail_from_call {
            if call >= fail_from {
                return Err(EngineError::EmbeddingService("provider outage".into()));
            }
        }
        Ok(texts
            .iter()
            .map(|t| vec![1.0, t.len() as f32, 0.0, 0.0])
            .collect())
    }
}

struct TestEnv {
    _tmp: TempDir,
    store: Store,
    index: Arc<MemoryIndex>,
    kb_id: i64,
    files: std::path::PathBuf,
}

impl TestEnv {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = kb_engine::db::connect(&tmp.path().join("data/engine.sqlite"))
            .await
            .unwrap();
        kb_engine::migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);
        let kb = store.create_knowledge_base("tenant", None).await.unwrap();
        let files = tmp.path().join("files");
        std::fs::create_dir_all(&files).unwrap();
        Self {
            _tmp: tmp,
            store,
            index: Arc::new(MemoryIndex::new()),
            kb_id: kb.id,
            files,
        }
    }

    fn deps(&self, embedder: Arc<dyn Embedder>, max_tokens: usize) -> PipelineDeps {
        PipelineDeps {
            store: self.store.clone(),
            registry: Arc::new(ExtractorRegistry::with_defaults(&MediaConfig::default())),
            embedder,
            index: self.index.clone(),
            chunking: ChunkingConfig {
                max_tokens,
                overlap_tokens: 0,
            },
        }
    }

    async fn upload(&self, name: &str, content: &str) -> i64 {
        let path = self.files.join(name);
        std::fs::write(&path, content).unwrap();
        let kind = kb_engine::classify::classify(Path::new(name));
        let document = self
            .store
            .create_document(self.kb_id, name, kind, &path.to_string_lossy())
            .await
            .unwrap();
        document.id
    }
}

#[tokio::test]
async fn text_document_lands_as_chunks_and_vectors() {
    let env = TestEnv::new().await;
    let doc_id = env.upload("notes.txt", "Alpha. Beta. Gamma.").await;
    let deps = env.deps(Arc::new(CountingEmbedder::healthy()), 2);

    let summary = process_document(&deps, doc_id, &NoProgress).await.unwrap();
    assert_eq!(summary.chunk_count, 3);

    let document = env.store.get_document(doc_id).await.unwrap();
    assert_eq!(document.status(), DocumentStatus::Processed);
    assert_eq!(document.kind, DocumentKind::FlatText.as_str());

    let chunks = env.store.list_chunks(doc_id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content, "Alpha.");

    let collection = collection_for(env.kb_id);
    assert_eq!(env.index.point_count(&collection).await, 3);
}

#[tokio::test]
async fn unknown_format_gets_a_stub_chunk() {
    let env = TestEnv::new().await;
    let doc_id = env.upload("mystery.xyz", "binary-ish payload").await;
    let deps = env.deps(Arc::new(CountingEmbedder::healthy()), 500);

    let summary = process_document(&deps, doc_id, &NoProgress).await.unwrap();
    assert_eq!(summary.chunk_count, 1);

    let document = env.store.get_document(doc_id).await.unwrap();
    assert_eq!(document.status(), DocumentStatus::Processed);
    assert_eq!(document.kind, DocumentKind::Generic.as_str());

    let chunks = env.store.list_chunks(doc_id).await.unwrap();
    assert!(chunks[0].content.contains("mystery.xyz"));
}

#[tokio::test]
async fn provider_outage_fails_document_but_keeps_finished_chunks() {
    let env = TestEnv::new().await;
    let doc_id = env.upload("notes.txt", "Alpha. Beta. Gamma.").await;

    // Chunks one and two embed fine; the third call hits the outage.
    let deps = env.deps(Arc::new(CountingEmbedder::failing_from(3)), 2);
    let err = process_document(&deps, doc_id, &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmbeddingService(_)));

    let document = env.store.get_document(doc_id).await.unwrap();
    assert_eq!(document.status(), DocumentStatus::Failed);
    assert!(document.error.unwrap().contains("provider outage"));
    assert_eq!(env.store.chunk_count(doc_id).await.unwrap(), 2);
}

#[tokio::test]
async fn retry_after_failure_reprocesses_from_scratch() {
    let env = TestEnv::new().await;
    let doc_id = env.upload("notes.txt", "Alpha. Beta. Gamma.").await;

    let broken = env.deps(Arc::new(CountingEmbedder::failing_from(3)), 2);
    process_document(&broken, doc_id, &NoProgress)
        .await
        .unwrap_err();
    assert_eq!(env.store.chunk_count(doc_id).await.unwrap(), 2);

    let healthy = env.deps(Arc::new(CountingEmbedder::healthy()), 2);
    let summary = process_document(&healthy, doc_id, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.chunk_count, 3);

    let document = env.store.get_document(doc_id).await.unwrap();
    assert_eq!(document.status(), DocumentStatus::Processed);
    assert_eq!(document.error, None);

    // The partial run's rows and vectors were purged, not duplicated
    assert_eq!(env.store.chunk_count(doc_id).await.unwrap(), 3);
    let collection = collection_for(env.kb_id);
    assert_eq!(env.index.point_count(&collection).await, 3);
}

#[tokio::test]
async fn processed_document_cannot_be_claimed_again() {
    let env = TestEnv::new().await;
    let doc_id = env.upload("notes.txt", "Alpha. Beta. Gamma.").await;
    let deps = env.deps(Arc::new(CountingEmbedder::healthy()), 2);

    process_document(&deps, doc_id, &NoProgress).await.unwrap();
    let err = process_document(&deps, doc_id, &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn documents_from_two_tenants_stay_in_their_collections() {
    let env = TestEnv::new().await;
    let other_kb = env
        .store
        .create_knowledge_base("other-tenant", None)
        .await
        .unwrap();

    let doc_a = env.upload("a.txt", "Tenant one content.").await;
    let path_b = env.files.join("b.txt");
    std::fs::write(&path_b, "Tenant two content.").unwrap();
    let doc_b = env
        .store
        .create_document(
            other_kb.id,
            "b.txt",
            DocumentKind::FlatText,
            &path_b.to_string_lossy(),
        )
        .await
        .unwrap()
        .id;

    let deps = env.deps(Arc::new(CountingEmbedder::healthy()), 500);
    process_document(&deps, doc_a, &NoProgress).await.unwrap();
    process_document(&deps, doc_b, &NoProgress).await.unwrap();

    assert_eq!(env.index.point_count(&collection_for(env.kb_id)).await, 1);
    assert_eq!(env.index.point_count(&collection_for(other_kb.id)).await, 1);
}
