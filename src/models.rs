//! Core data models shared across the ingestion, chat, and course modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document lifecycle status. Transitions are enforced by the store:
/// `Uploaded → Processing → {Processed | Failed}`, and `Failed → Processing`
/// on retry. Everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(DocumentStatus::Uploaded),
            "processing" => Some(DocumentStatus::Processing),
            "processed" => Some(DocumentStatus::Processed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// Classified file kind. Drives extraction provider lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Docx,
    Pptx,
    FlatText,
    Video,
    Generic,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Pptx => "pptx",
            DocumentKind::FlatText => "flat_text",
            DocumentKind::Video => "video",
            DocumentKind::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(DocumentKind::Pdf),
            "docx" => Some(DocumentKind::Docx),
            "pptx" => Some(DocumentKind::Pptx),
            "flat_text" => Some(DocumentKind::FlatText),
            "video" => Some(DocumentKind::Video),
            "generic" => Some(DocumentKind::Generic),
            _ => None,
        }
    }
}

/// A tenant's document collection. Each knowledge base owns its documents,
/// conversations, lessons, and a dedicated vector collection (`kb_{id}`).
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An uploaded file and its processing state.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Document {
    pub id: i64,
    pub knowledge_base_id: i64,
    pub file_name: String,
    pub kind: String,
    pub file_path: String,
    pub status: String,
    pub error: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn status(&self) -> DocumentStatus {
        DocumentStatus::parse(&self.status).unwrap_or(DocumentStatus::Failed)
    }
}

/// One indexed slice of a document. Immutable once written; `chunk_index`
/// is gapless per document and `vector_id` points at the vector store entry.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DocumentChunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub vector_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub knowledge_base_id: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A chat message. `status` is `complete` for normal turns and `interrupted`
/// when a client disconnect flushed a partial assistant response.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender: String,
    pub content: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted citation. `source_index` is monotonic per conversation and
/// never reused, so citation numbering stays stable across turns.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SourceRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub source_index: i64,
    pub content: String,
    pub url: Option<String>,
    pub chunk_start: i64,
    pub chunk_end: i64,
}

/// A published course lesson. `lesson_order` is contiguous per knowledge
/// base and continues from the current maximum on each course run.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Lesson {
    pub id: i64,
    pub knowledge_base_id: i64,
    pub title: String,
    pub content: String,
    pub lesson_order: i64,
}

/// Positional metadata attached to an extracted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Locator {
    Page { number: u32 },
    Slide { number: u32 },
    TimeRange { start_secs: u64, end_secs: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub file_name: String,
    pub locator: Option<Locator>,
    pub summary: Option<String>,
}

/// Output of an extraction provider: a text unit plus where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedUnit {
    pub text: String,
    pub metadata: UnitMetadata,
}

impl ExtractedUnit {
    pub fn plain(text: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: UnitMetadata {
                file_name: file_name.into(),
                locator: None,
                summary: None,
            },
        }
    }
}

/// A retrieval hit handed to the agent and streamed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSource {
    pub index: i64,
    pub text: String,
    pub url: Option<String>,
    pub chunk_start: i64,
    pub chunk_end: i64,
}
