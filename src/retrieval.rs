//! Semantic retrieval over an indexed knowledge base.
//!
//! Wraps the embedder and the vector index behind the one tool the chat
//! agent and the course generator call. Citation indices are assigned
//! here, offset by the conversation's running counter so every source a
//! conversation ever cites gets a distinct number.

use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::error::{EngineError, Result};
use crate::llm::ToolSpec;
use crate::models::RetrievedSource;
use crate::vector_index::{collection_for, VectorIndex};

pub const RETRIEVE_TOOL_NAME: &str = "search_knowledge_base";

pub struct RetrievalTool {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl RetrievalTool {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self {
            embedder,
            index,
            top_k,
        }
    }

    /// Function-calling spec handed to the model.
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: RETRIEVE_TOOL_NAME.into(),
            description: "Search the knowledge base for passages relevant to a query. \
                          Returns numbered source excerpts."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to search for, phrased as a standalone question or topic"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    /// Whether the knowledge base has anything indexed yet.
    pub async fn is_ready(&self, knowledge_base_id: i64) -> Result<bool> {
        self.index
            .is_initialized(&collection_for(knowledge_base_id))
            .await
    }

    /// Retrieve the top passages for `query`, numbering them from
    /// `start_index` upward.
    pub async fn retrieve(
        &self,
        knowledge_base_id: i64,
        query: &str,
        start_index: i64,
    ) -> Result<Vec<RetrievedSource>> {
        let collection = collection_for(knowledge_base_id);
        if !self.index.is_initialized(&collection).await? {
            return Err(EngineError::IndexNotInitialized(knowledge_base_id));
        }

        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self
            .index
            .search(&collection, vector, knowledge_base_id, self.top_k as u64)
            .await?;

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| RetrievedSource {
                index: start_index + i as i64,
                text: hit.payload.content,
                url: Some(format!(
                    "kb://{}/documents/{}#chunk-{}",
                    knowledge_base_id, hit.payload.document_id, hit.payload.chunk_index
                )),
                chunk_start: hit.payload.chunk_index,
                chunk_end: hit.payload.chunk_index,
            })
            .collect())
    }

    /// Render sources the way the model consumes tool output: numbered
    /// excerpts the answer can cite as `[n]`.
    pub fn render_for_model(sources: &[RetrievedSource]) -> String {
        if sources.is_empty() {
            return "No relevant passages found.".to_string();
        }
        let mut out = String::new();
        for source in sources {
            out.push_str(&format!("[{}] {}\n\n", source.index, source.text));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::{ChunkPayload, MemoryIndex, VectorPoint};
    use async_trait::async_trait;

    struct FixedEmbedder {
        dims: usize,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed-test"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            // First component scales with text length so ordering is stable
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    v[0] = 1.0;
                    v[1] = t.len() as f32 / 100.0;
                    v
                })
                .collect())
        }
    }

    fn point(id: &str, kb: i64, doc: i64, idx: i64, content: &str, v: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector: v,
            payload: ChunkPayload {
                knowledge_base_id: kb,
                document_id: doc,
                chunk_index: idx,
                content: content.to_string(),
                file_name: "notes.txt".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn retrieve_before_any_ingest_is_an_error() {
        let tool = RetrievalTool::new(
            Arc::new(FixedEmbedder { dims: 4 }),
            Arc::new(MemoryIndex::new()),
            5,
        );
        let err = tool.retrieve(1, "anything", 0).await.unwrap_err();
        assert!(matches!(err, EngineError::IndexNotInitialized(1)));
    }

    #[tokio::test]
    async fn retrieve_numbers_sources_from_start_index() {
        let index = Arc::new(MemoryIndex::new());
        let collection = collection_for(7);
        index.initialize(&collection, 4).await.unwrap();
        index
            .upsert(
                &collection,
                vec![
                    point("a", 7, 1, 0, "alpha text", vec![1.0, 0.1, 0.0, 0.0]),
                    point("b", 7, 1, 1, "beta text", vec![1.0, 0.2, 0.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let tool = RetrievalTool::new(Arc::new(FixedEmbedder { dims: 4 }), index, 5);
        let sources = tool.retrieve(7, "beta", 4).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].index, 4);
        assert_eq!(sources[1].index, 5);
    }

    #[tokio::test]
    async fn retrieve_is_scoped_to_one_knowledge_base() {
        let index = Arc::new(MemoryIndex::new());
        let collection = collection_for(2);
        index.initialize(&collection, 4).await.unwrap();
        index
            .upsert(
                &collection,
                vec![
                    point("a", 2, 1, 0, "mine", vec![1.0, 0.1, 0.0, 0.0]),
                    // A stray point tagged with another knowledge base id
                    // must never come back, even from the same collection.
                    point("b", 3, 9, 0, "theirs", vec![1.0, 0.1, 0.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let tool = RetrievalTool::new(Arc::new(FixedEmbedder { dims: 4 }), index, 5);
        let sources = tool.retrieve(2, "query", 0).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].text, "mine");
    }

    #[test]
    fn render_for_model_numbers_excerpts() {
        let sources = vec![RetrievedSource {
            index: 3,
            text: "excerpt".into(),
            url: None,
            chunk_start: 0,
            chunk_end: 0,
        }];
        let rendered = RetrievalTool::render_for_model(&sources);
        assert!(rendered.starts_with("[3] excerpt"));
    }
}
