//! Relational persistence for knowledge bases, documents, chunks,
//! conversations, messages, citations, and lessons.
//!
//! All operations use short-lived statements or transactions. The document
//! status machine is enforced here: [`Store::try_mark_processing`] is the
//! single mutual-exclusion point for the ingestion pipeline.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{EngineError, Result};
use crate::models::{
    Conversation, Document, DocumentChunk, DocumentKind, KnowledgeBase, Lesson, Message,
    RetrievedSource, SourceRecord,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Knowledge bases ============

    pub async fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<KnowledgeBase> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO knowledge_bases (name, description, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_knowledge_base(result.last_insert_rowid()).await
    }

    pub async fn get_knowledge_base(&self, id: i64) -> Result<KnowledgeBase> {
        sqlx::query_as::<_, KnowledgeBase>("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("knowledge base {}", id)))
    }

    // ============ Documents ============

    pub async fn create_document(
        &self,
        knowledge_base_id: i64,
        file_name: &str,
        kind: DocumentKind,
        file_path: &str,
    ) -> Result<Document> {
        // Reject uploads into a missing tenant up front
        self.get_knowledge_base(knowledge_base_id).await?;

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO documents (knowledge_base_id, file_name, kind, file_path, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'uploaded', ?, ?)
            "#,
        )
        .bind(knowledge_base_id)
        .bind(file_name)
        .bind(kind.as_str())
        .bind(file_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_document(result.last_insert_rowid()).await
    }

    pub async fn get_document(&self, id: i64) -> Result<Document> {
        sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {}", id)))
    }

    pub async fn set_document_kind(&self, id: i64, kind: DocumentKind) -> Result<()> {
        sqlx::query("UPDATE documents SET kind = ?, updated_at = ? WHERE id = ?")
            .bind(kind.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_document_task(&self, id: i64, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically claim a document for processing. Succeeds only from
    /// `uploaded` or `failed`; a concurrent second run loses the conditional
    /// UPDATE and gets `InvalidStateTransition` without mutating anything.
    pub async fn try_mark_processing(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET status = 'processing', error = NULL, updated_at = ?
            WHERE id = ? AND status IN ('uploaded', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let doc = self.get_document(id).await?;
            return Err(EngineError::InvalidStateTransition(format!(
                "document {} is '{}', expected 'uploaded' or 'failed'",
                id, doc.status
            )));
        }
        Ok(())
    }

    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'processed', updated_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidStateTransition(format!(
                "document {} cannot move to 'processed'",
                id
            )));
        }
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'failed', error = ?, updated_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidStateTransition(format!(
                "document {} cannot move to 'failed'",
                id
            )));
        }
        Ok(())
    }

    // ============ Chunks ============

    pub async fn insert_chunk(
        &self,
        document_id: i64,
        chunk_index: i64,
        content: &str,
        vector_id: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO chunks (document_id, chunk_index, content, vector_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(chunk_index)
        .bind(content)
        .bind(vector_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_chunks(&self, document_id: i64) -> Result<Vec<DocumentChunk>> {
        let chunks = sqlx::query_as::<_, DocumentChunk>(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    pub async fn chunk_count(&self, document_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete all chunk rows for a document and return their vector ids so
    /// the caller can drop the matching vector store points.
    pub async fn purge_chunks(&self, document_id: i64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let vector_ids: Vec<String> =
            sqlx::query_scalar("SELECT vector_id FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(vector_ids)
    }

    // ============ Conversations & messages ============

    pub async fn create_conversation(&self, knowledge_base_id: i64) -> Result<Conversation> {
        self.get_knowledge_base(knowledge_base_id).await?;

        let result = sqlx::query(
            "INSERT INTO conversations (knowledge_base_id, created_at) VALUES (?, ?)",
        )
        .bind(knowledge_base_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_conversation(result.last_insert_rowid()).await
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Conversation> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conversation {}", id)))
    }

    /// Set the conversation title only if one was never set. Returns whether
    /// this call won — the title is generated exactly once per conversation.
    pub async fn set_title_if_unset(&self, conversation_id: i64, title: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE conversations SET title = ? WHERE id = ? AND title IS NULL")
                .bind(title)
                .bind(conversation_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn append_message(
        &self,
        conversation_id: i64,
        sender: &str,
        content: &str,
        status: &str,
    ) -> Result<Message> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, sender, content, status, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation_id)
        .bind(sender)
        .bind(content)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let message =
            sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
                .bind(result.last_insert_rowid())
                .fetch_one(&self.pool)
                .await?;
        Ok(message)
    }

    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn user_message_count(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND sender = 'user'",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ============ Sources ============

    /// Next free citation index for a conversation. Zero-based; indices
    /// are monotonic and never reused, so citations from earlier turns
    /// stay valid.
    pub async fn next_source_index(&self, conversation_id: i64) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(source_index) FROM sources WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    pub async fn insert_sources(
        &self,
        conversation_id: i64,
        message_id: i64,
        sources: &[RetrievedSource],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in sources {
            sqlx::query(
                r#"
                INSERT INTO sources (conversation_id, message_id, source_index, content, url, chunk_start, chunk_end)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(message_id)
            .bind(s.index)
            .bind(&s.text)
            .bind(&s.url)
            .bind(s.chunk_start)
            .bind(s.chunk_end)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_sources(&self, message_id: i64) -> Result<Vec<SourceRecord>> {
        let sources = sqlx::query_as::<_, SourceRecord>(
            "SELECT * FROM sources WHERE message_id = ? ORDER BY source_index",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    // ============ Lessons ============

    /// The order the next inserted lesson will receive. Lets streaming
    /// callers announce an order that matches what [`insert_lessons`]
    /// later writes.
    ///
    /// [`insert_lessons`]: Store::insert_lessons
    pub async fn next_lesson_order(&self, knowledge_base_id: i64) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(lesson_order) FROM lessons WHERE knowledge_base_id = ?",
        )
        .bind(knowledge_base_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.map(|m| m + 1).unwrap_or(1))
    }

    /// Insert a batch of lessons with contiguous `lesson_order`, continuing
    /// from the knowledge base's current maximum.
    pub async fn insert_lessons(
        &self,
        knowledge_base_id: i64,
        lessons: &[(String, String)],
    ) -> Result<Vec<Lesson>> {
        let mut tx = self.pool.begin().await?;

        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(lesson_order) FROM lessons WHERE knowledge_base_id = ?",
        )
        .bind(knowledge_base_id)
        .fetch_one(&mut *tx)
        .await?;
        let mut order = max.map(|m| m + 1).unwrap_or(1);

        let mut ids = Vec::with_capacity(lessons.len());
        for (title, content) in lessons {
            let result = sqlx::query(
                r#"
                INSERT INTO lessons (knowledge_base_id, title, content, lesson_order)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(knowledge_base_id)
            .bind(title)
            .bind(content)
            .bind(order)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
            order += 1;
        }

        tx.commit().await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let lesson = sqlx::query_as::<_, Lesson>("SELECT * FROM lessons WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            out.push(lesson);
        }
        Ok(out)
    }

    pub async fn list_lessons(&self, knowledge_base_id: i64) -> Result<Vec<Lesson>> {
        let lessons = sqlx::query_as::<_, Lesson>(
            "SELECT * FROM lessons WHERE knowledge_base_id = ? ORDER BY lesson_order",
        )
        .bind(knowledge_base_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lessons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("kb.db")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (Store::new(pool), dir)
    }

    #[tokio::test]
    async fn document_lifecycle_happy_path() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let doc = store
            .create_document(kb.id, "a.txt", DocumentKind::FlatText, "/tmp/a.txt")
            .await
            .unwrap();
        assert_eq!(doc.status(), DocumentStatus::Uploaded);

        store.try_mark_processing(doc.id).await.unwrap();
        assert_eq!(
            store.get_document(doc.id).await.unwrap().status(),
            DocumentStatus::Processing
        );

        store.mark_processed(doc.id).await.unwrap();
        assert_eq!(
            store.get_document(doc.id).await.unwrap().status(),
            DocumentStatus::Processed
        );
    }

    #[tokio::test]
    async fn processing_twice_is_rejected() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let doc = store
            .create_document(kb.id, "a.txt", DocumentKind::FlatText, "/tmp/a.txt")
            .await
            .unwrap();

        store.try_mark_processing(doc.id).await.unwrap();
        let err = store.try_mark_processing(doc.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn failed_document_can_be_reclaimed() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let doc = store
            .create_document(kb.id, "a.txt", DocumentKind::FlatText, "/tmp/a.txt")
            .await
            .unwrap();

        store.try_mark_processing(doc.id).await.unwrap();
        store.mark_failed(doc.id, "boom").await.unwrap();
        let failed = store.get_document(doc.id).await.unwrap();
        assert_eq!(failed.status(), DocumentStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        // Retry clears the error and claims the document again
        store.try_mark_processing(doc.id).await.unwrap();
        let doc = store.get_document(doc.id).await.unwrap();
        assert_eq!(doc.status(), DocumentStatus::Processing);
        assert!(doc.error.is_none());
    }

    #[tokio::test]
    async fn processed_document_cannot_be_reprocessed() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let doc = store
            .create_document(kb.id, "a.txt", DocumentKind::FlatText, "/tmp/a.txt")
            .await
            .unwrap();
        store.try_mark_processing(doc.id).await.unwrap();
        store.mark_processed(doc.id).await.unwrap();

        let err = store.try_mark_processing(doc.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn purge_chunks_returns_vector_ids() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let doc = store
            .create_document(kb.id, "a.txt", DocumentKind::FlatText, "/tmp/a.txt")
            .await
            .unwrap();

        store.insert_chunk(doc.id, 0, "alpha", "v0").await.unwrap();
        store.insert_chunk(doc.id, 1, "beta", "v1").await.unwrap();

        let ids = store.purge_chunks(doc.id).await.unwrap();
        assert_eq!(ids, vec!["v0".to_string(), "v1".to_string()]);
        assert_eq!(store.chunk_count(doc.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn source_indices_are_monotonic_per_conversation() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let conv = store.create_conversation(kb.id).await.unwrap();
        // A fresh conversation cites from zero
        assert_eq!(store.next_source_index(conv.id).await.unwrap(), 0);

        let msg = store
            .append_message(conv.id, "assistant", "hi", "complete")
            .await
            .unwrap();
        let sources = vec![
            RetrievedSource {
                index: 0,
                text: "s1".into(),
                url: None,
                chunk_start: 0,
                chunk_end: 0,
            },
            RetrievedSource {
                index: 1,
                text: "s2".into(),
                url: None,
                chunk_start: 0,
                chunk_end: 0,
            },
        ];
        store.insert_sources(conv.id, msg.id, &sources).await.unwrap();
        assert_eq!(store.next_source_index(conv.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn title_set_only_once() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        let conv = store.create_conversation(kb.id).await.unwrap();

        assert!(store.set_title_if_unset(conv.id, "First").await.unwrap());
        assert!(!store.set_title_if_unset(conv.id, "Second").await.unwrap());
        assert_eq!(
            store.get_conversation(conv.id).await.unwrap().title.as_deref(),
            Some("First")
        );
    }

    #[tokio::test]
    async fn lesson_order_continues_from_max() {
        let (store, _dir) = test_store().await;
        let kb = store.create_knowledge_base("kb", None).await.unwrap();
        assert_eq!(store.next_lesson_order(kb.id).await.unwrap(), 1);

        let first = store
            .insert_lessons(kb.id, &[("A".into(), "a".into()), ("B".into(), "b".into())])
            .await
            .unwrap();
        assert_eq!(first[0].lesson_order, 1);
        assert_eq!(first[1].lesson_order, 2);

        let second = store
            .insert_lessons(kb.id, &[("C".into(), "c".into())])
            .await
            .unwrap();
        assert_eq!(second[0].lesson_order, 3);
        assert_eq!(store.next_lesson_order(kb.id).await.unwrap(), 4);
    }
}
