//! Vector index collaborator.
//!
//! The engine keeps one vector collection per knowledge base (named by
//! [`collection_for`]) in an external store. [`VectorIndex`] is the seam:
//! [`QdrantIndex`] talks to a Qdrant instance over gRPC, [`MemoryIndex`]
//! is a brute-force in-process implementation used by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use qdrant_client::config::QdrantConfig;
use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, points_selector::PointsSelectorOneOf,
    r#match::MatchValue, value::Kind, vectors_config::Config as VectorsConfigKind, Condition,
    CreateCollection, DeletePoints, Distance, FieldCondition, Filter, Match, PointId, PointStruct,
    PointsIdsList, PointsSelector, SearchPoints, UpsertPoints, Value, VectorParams, VectorsConfig,
    WithPayloadSelector, WriteOrdering,
};
use qdrant_client::Qdrant;

use crate::error::{EngineError, Result};

/// Deterministic collection name for a knowledge base.
pub fn collection_for(knowledge_base_id: i64) -> String {
    format!("kb_{}", knowledge_base_id)
}

/// Payload stored alongside every chunk vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub knowledge_base_id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub file_name: String,
}

/// A vector plus payload, keyed by a UUID point id.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if it does not exist.
    async fn initialize(&self, collection: &str, vector_size: usize) -> Result<()>;

    /// Whether the collection has ever been created.
    async fn is_initialized(&self, collection: &str) -> Result<bool>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Nearest-neighbor search scoped to one knowledge base. Hits come
    /// back in descending score order.
    async fn search(
        &self,
        collection: &str,
        query: Vec<f32>,
        knowledge_base_id: i64,
        limit: u64,
    ) -> Result<Vec<VectorHit>>;

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<()>;
}

// ============ Qdrant implementation ============

pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    pub fn connect(url: &str) -> Result<Self> {
        let config = QdrantConfig::from_url(url);
        let client =
            Qdrant::new(config).map_err(|e| EngineError::VectorStore(e.to_string()))?;
        Ok(Self { client })
    }
}

fn chunk_payload_to_qdrant(payload: &ChunkPayload) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert(
        "knowledge_base_id".to_string(),
        Value::from(payload.knowledge_base_id),
    );
    map.insert("document_id".to_string(), Value::from(payload.document_id));
    map.insert("chunk_index".to_string(), Value::from(payload.chunk_index));
    map.insert("content".to_string(), Value::from(payload.content.clone()));
    map.insert(
        "file_name".to_string(),
        Value::from(payload.file_name.clone()),
    );
    map
}

fn payload_i64(map: &HashMap<String, Value>, key: &str) -> i64 {
    match map.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => *i,
        _ => 0,
    }
}

fn payload_string(map: &HashMap<String, Value>, key: &str) -> String {
    match map.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        _ => String::new(),
    }
}

fn chunk_payload_from_qdrant(map: &HashMap<String, Value>) -> ChunkPayload {
    ChunkPayload {
        knowledge_base_id: payload_i64(map, "knowledge_base_id"),
        document_id: payload_i64(map, "document_id"),
        chunk_index: payload_i64(map, "chunk_index"),
        content: payload_string(map, "content"),
        file_name: payload_string(map, "file_name"),
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn initialize(&self, collection: &str, vector_size: usize) -> Result<()> {
        if self.is_initialized(collection).await? {
            return Ok(());
        }

        let vectors_config = VectorsConfig {
            config: Some(VectorsConfigKind::Params(VectorParams {
                size: vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        let create_collection = CreateCollection {
            collection_name: collection.to_string(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))?;
        Ok(())
    }

    async fn is_initialized(&self, collection: &str) -> Result<bool> {
        self.client
            .collection_exists(collection)
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| PointStruct {
                id: Some(PointId {
                    point_id_options: Some(PointIdOptions::Uuid(p.id)),
                }),
                payload: chunk_payload_to_qdrant(&p.payload),
                vectors: Some(p.vector.into()),
            })
            .collect();

        let upsert_points = UpsertPoints {
            collection_name: collection.to_string(),
            points,
            ordering: Some(WriteOrdering::default()),
            ..Default::default()
        };

        self.client
            .upsert_points(upsert_points)
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: Vec<f32>,
        knowledge_base_id: i64,
        limit: u64,
    ) -> Result<Vec<VectorHit>> {
        let filter = Filter {
            must: vec![Condition {
                condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                    key: "knowledge_base_id".to_string(),
                    r#match: Some(Match {
                        match_value: Some(MatchValue::Integer(knowledge_base_id)),
                    }),
                    ..Default::default()
                })),
            }],
            ..Default::default()
        };

        let search_request = SearchPoints {
            collection_name: collection.to_string(),
            vector: query,
            limit,
            filter: Some(filter),
            with_payload: Some(WithPayloadSelector::from(true)),
            ..Default::default()
        };

        let results = self
            .client
            .search_points(search_request)
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|r| {
                let id = r.id.and_then(|id| match id.point_id_options {
                    Some(PointIdOptions::Uuid(u)) => Some(u),
                    Some(PointIdOptions::Num(n)) => Some(n.to_string()),
                    None => None,
                })?;
                Some(VectorHit {
                    id,
                    score: r.score,
                    payload: chunk_payload_from_qdrant(&r.payload),
                })
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<PointId> = ids
            .into_iter()
            .map(|id| PointId {
                point_id_options: Some(PointIdOptions::Uuid(id)),
            })
            .collect();

        let points_selector = PointsSelector {
            points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                ids: point_ids,
            })),
        };

        let delete_points = DeletePoints {
            collection_name: collection.to_string(),
            points: Some(points_selector),
            ordering: Some(WriteOrdering::default()),
            ..Default::default()
        };

        self.client
            .delete_points(delete_points)
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))?;
        Ok(())
    }
}

// ============ In-memory implementation ============

#[derive(Default)]
struct MemoryCollection {
    vector_size: usize,
    points: Vec<VectorPoint>,
}

/// Brute-force cosine index for tests and offline development.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total points in a collection (test helper).
    pub async fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn initialize(&self, collection: &str, vector_size: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection {
                vector_size,
                points: Vec::new(),
            });
        Ok(())
    }

    async fn is_initialized(&self, collection: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::VectorStore(format!("no collection {}", collection)))?;

        for point in points {
            if point.vector.len() != coll.vector_size {
                return Err(EngineError::VectorStore(format!(
                    "vector size {} does not match collection size {}",
                    point.vector.len(),
                    coll.vector_size
                )));
            }
            coll.points.retain(|p| p.id != point.id);
            coll.points.push(point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: Vec<f32>,
        knowledge_base_id: i64,
        limit: u64,
    ) -> Result<Vec<VectorHit>> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(collection)
            .ok_or_else(|| EngineError::VectorStore(format!("no collection {}", collection)))?;

        let mut hits: Vec<VectorHit> = coll
            .points
            .iter()
            .filter(|p| p.payload.knowledge_base_id == knowledge_base_id)
            .map(|p| VectorHit {
                id: p.id.clone(),
                score: cosine_similarity(&query, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(coll) = collections.get_mut(collection) {
            coll.points.retain(|p| !ids.contains(&p.id));
        }
        Ok(())
    }
}

/// Cosine similarity between two vectors. Returns `0.0` for empty or
/// mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, kb: i64, vector: Vec<f32>, content: &str) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: ChunkPayload {
                knowledge_base_id: kb,
                document_id: 1,
                chunk_index: 0,
                content: content.to_string(),
                file_name: "f.txt".to_string(),
            },
        }
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn memory_index_search_is_scoped_to_kb() {
        let index = MemoryIndex::new();
        index.initialize("kb_1", 2).await.unwrap();
        index
            .upsert(
                "kb_1",
                vec![
                    point("a", 1, vec![1.0, 0.0], "from kb 1"),
                    point("b", 2, vec![1.0, 0.0], "from kb 2"),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("kb_1", vec![1.0, 0.0], 1, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.content, "from kb 1");
    }

    #[tokio::test]
    async fn memory_index_ranks_by_similarity() {
        let index = MemoryIndex::new();
        index.initialize("kb_1", 2).await.unwrap();
        index
            .upsert(
                "kb_1",
                vec![
                    point("far", 1, vec![0.0, 1.0], "far"),
                    point("near", 1, vec![1.0, 0.1], "near"),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("kb_1", vec![1.0, 0.0], 1, 10).await.unwrap();
        assert_eq!(hits[0].payload.content, "near");
    }

    #[tokio::test]
    async fn upsert_replaces_same_id() {
        let index = MemoryIndex::new();
        index.initialize("kb_1", 2).await.unwrap();
        index
            .upsert("kb_1", vec![point("a", 1, vec![1.0, 0.0], "v1")])
            .await
            .unwrap();
        index
            .upsert("kb_1", vec![point("a", 1, vec![1.0, 0.0], "v2")])
            .await
            .unwrap();

        assert_eq!(index.point_count("kb_1").await, 1);
        let hits = index.search("kb_1", vec![1.0, 0.0], 1, 10).await.unwrap();
        assert_eq!(hits[0].payload.content, "v2");
    }

    #[tokio::test]
    async fn delete_removes_points() {
        let index = MemoryIndex::new();
        index.initialize("kb_1", 2).await.unwrap();
        index
            .upsert("kb_1", vec![point("a", 1, vec![1.0, 0.0], "x")])
            .await
            .unwrap();
        index.delete("kb_1", vec!["a".to_string()]).await.unwrap();
        assert_eq!(index.point_count("kb_1").await, 0);
    }

    #[tokio::test]
    async fn mismatched_dims_rejected() {
        let index = MemoryIndex::new();
        index.initialize("kb_1", 2).await.unwrap();
        let err = index
            .upsert("kb_1", vec![point("a", 1, vec![1.0, 0.0, 0.0], "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VectorStore(_)));
    }

    #[test]
    fn collection_names_are_deterministic() {
        assert_eq!(collection_for(7), "kb_7");
    }
}
