//! Course generation.
//!
//! Turns a knowledge base into a sequence of lessons through a
//! plan-draft-review loop: a planner lays out sections, each section is
//! drafted against retrieved passages, and a reviewer either accepts the
//! draft or sends it back with notes. Revision rounds are bounded; a
//! draft that exhausts them ships as-is. Progress streams to the client
//! as log, review and section events, and finished lessons are stored in
//! order.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::CourseConfig;
use crate::error::{EngineError, Result};
use crate::llm::{ChatMessage, LlmClient};
use crate::models::Lesson;
use crate::retrieval::RetrievalTool;
use crate::store::Store;
use crate::transport::{Transport, TransportEvent};

const PLANNER_PROMPT: &str = "You plan short courses. Given a topic and optional \
    reference passages, answer with JSON only, in the shape \
    {\"title\": string, \"sections\": [{\"title\": string, \"objective\": string}]}. \
    No prose, no code fences.";

const DRAFT_PROMPT: &str = "You write course sections in Markdown. Write the body \
    for the given section, grounded in the reference passages when they are \
    relevant. Answer with the section body only.";

const REVIEW_PROMPT: &str = "You review course sections for accuracy and clarity. \
    Answer with JSON only, in the shape {\"accept\": boolean, \"notes\": string}. \
    Notes must name concrete fixes when rejecting.";

const REVISE_PROMPT: &str = "Revise the course section below to address the \
    reviewer's notes. Answer with the revised section body only.";

#[derive(Debug, Deserialize)]
struct CoursePlan {
    title: String,
    sections: Vec<PlannedSection>,
}

#[derive(Debug, Deserialize)]
struct PlannedSection {
    title: String,
    #[serde(default)]
    objective: String,
}

#[derive(Debug, Deserialize)]
struct ReviewVerdict {
    accept: bool,
    #[serde(default)]
    notes: String,
}

pub struct CourseGenerator {
    store: Store,
    llm: Arc<dyn LlmClient>,
    retrieval: Arc<RetrievalTool>,
    config: CourseConfig,
}

impl CourseGenerator {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmClient>,
        retrieval: Arc<RetrievalTool>,
        config: CourseConfig,
    ) -> Self {
        Self {
            store,
            llm,
            retrieval,
            config,
        }
    }

    /// Generate a course on `topic` and store its lessons. Events stream
    /// to `transport` throughout; a closed transport aborts the run
    /// without storing anything.
    pub async fn generate(
        &self,
        knowledge_base_id: i64,
        topic: &str,
        transport: &dyn Transport,
    ) -> Result<Vec<Lesson>> {
        match self.run(knowledge_base_id, topic, transport).await {
            Ok(lessons) => {
                let _ = transport.send(TransportEvent::End).await;
                Ok(lessons)
            }
            Err(EngineError::TransportClosed) => Err(EngineError::TransportClosed),
            Err(e) => {
                tracing::warn!(knowledge_base_id, error = %e, "course generation failed");
                let _ = transport
                    .send(TransportEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                let _ = transport.send(TransportEvent::End).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        knowledge_base_id: i64,
        topic: &str,
        transport: &dyn Transport,
    ) -> Result<Vec<Lesson>> {
        // Fail on a bad id before spending any model calls
        self.store.get_knowledge_base(knowledge_base_id).await?;

        transport
            .send(TransportEvent::Log {
                message: format!("Planning course on '{topic}'"),
            })
            .await?;
        if !self.retrieval.is_ready(knowledge_base_id).await? {
            transport
                .send(TransportEvent::Log {
                    message: "Nothing indexed yet; drafting without retrieved passages".into(),
                })
                .await?;
        }

        let plan = self.plan(knowledge_base_id, topic).await?;
        let section_count = plan.sections.len();
        transport
            .send(TransportEvent::Log {
                message: format!("Planned '{}' with {} sections", plan.title, section_count),
            })
            .await?;

        // Streamed orders match what insert_lessons will assign below.
        let base_order = self.store.next_lesson_order(knowledge_base_id).await?;
        let mut finished: Vec<(String, String)> = Vec::new();
        for (i, section) in plan.sections.iter().enumerate() {
            transport
                .send(TransportEvent::Log {
                    message: format!(
                        "Drafting section {}/{}: {}",
                        i + 1,
                        section_count,
                        section.title
                    ),
                })
                .await?;

            let content = self
                .draft_section(knowledge_base_id, &plan.title, section, transport)
                .await?;
            transport
                .send(TransportEvent::Section {
                    title: section.title.clone(),
                    content: content.clone(),
                    lesson_order: base_order + i as i64,
                })
                .await?;
            finished.push((section.title.clone(), content));
        }

        let lessons = self
            .store
            .insert_lessons(knowledge_base_id, &finished)
            .await?;
        tracing::info!(
            knowledge_base_id,
            lessons = lessons.len(),
            "course generation complete"
        );
        Ok(lessons)
    }

    async fn plan(&self, knowledge_base_id: i64, topic: &str) -> Result<CoursePlan> {
        let context = self.research(knowledge_base_id, topic).await?;
        let request = if context.is_empty() {
            format!("Topic: {topic}")
        } else {
            format!("Topic: {topic}\n\nReference passages:\n{context}")
        };

        let raw = self
            .llm
            .complete(&[ChatMessage::system(PLANNER_PROMPT), ChatMessage::user(request)])
            .await?;
        let mut plan: CoursePlan = parse_json_reply(&raw)
            .map_err(|e| EngineError::Generation(format!("unusable course plan: {e}")))?;

        if plan.sections.is_empty() {
            return Err(EngineError::Generation("course plan has no sections".into()));
        }
        plan.sections.truncate(self.config.max_sections);
        Ok(plan)
    }

    async fn draft_section(
        &self,
        knowledge_base_id: i64,
        course_title: &str,
        section: &PlannedSection,
        transport: &dyn Transport,
    ) -> Result<String> {
        let context = self
            .research(knowledge_base_id, &format!("{} {}", section.title, section.objective))
            .await?;
        let request = format!(
            "Course: {course_title}\nSection: {}\nObjective: {}\n\nReference passages:\n{}",
            section.title,
            section.objective,
            if context.is_empty() { "(none)" } else { &context }
        );

        let mut draft = self
            .llm
            .complete(&[ChatMessage::system(DRAFT_PROMPT), ChatMessage::user(request)])
            .await?;

        for _ in 0..self.config.max_revisions {
            let verdict = self.review(&section.title, &draft).await?;
            transport
                .send(TransportEvent::ReviewFeedback {
                    section: section.title.clone(),
                    accepted: verdict.accept,
                    notes: verdict.notes.clone(),
                })
                .await?;
            if verdict.accept {
                return Ok(draft);
            }
            draft = self.revise(&section.title, &draft, &verdict.notes).await?;
        }

        // Out of revision rounds: the latest draft stands
        transport
            .send(TransportEvent::Log {
                message: format!(
                    "Section '{}' kept after {} revisions",
                    section.title, self.config.max_revisions
                ),
            })
            .await?;
        Ok(draft)
    }

    async fn review(&self, section_title: &str, draft: &str) -> Result<ReviewVerdict> {
        let raw = self
            .llm
            .complete(&[
                ChatMessage::system(REVIEW_PROMPT),
                ChatMessage::user(format!("Section: {section_title}\n\n{draft}")),
            ])
            .await?;
        // An unparseable verdict counts as acceptance rather than
        // burning a revision round on reviewer noise.
        Ok(parse_json_reply(&raw).unwrap_or(ReviewVerdict {
            accept: true,
            notes: String::new(),
        }))
    }

    async fn revise(&self, section_title: &str, draft: &str, notes: &str) -> Result<String> {
        self.llm
            .complete(&[
                ChatMessage::system(REVISE_PROMPT),
                ChatMessage::user(format!(
                    "Section: {section_title}\n\nReviewer notes: {notes}\n\n{draft}"
                )),
            ])
            .await
    }

    /// Retrieved context for a query, or empty when nothing is indexed.
    async fn research(&self, knowledge_base_id: i64, query: &str) -> Result<String> {
        if !self.retrieval.is_ready(knowledge_base_id).await? {
            return Ok(String::new());
        }
        let sources = self.retrieval.retrieve(knowledge_base_id, query, 0).await?;
        Ok(sources
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n"))
    }
}

/// Parse a JSON reply, tolerating code fences around the payload.
fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> std::result::Result<T, serde_json::Error> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(stripped.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use crate::llm::{LlmTurn, ToolSpec};
    use crate::transport::BufferTransport;
    use crate::vector_index::MemoryIndex;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed-test"
        }

        fn dims(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok(self.replies.lock().unwrap().remove(0))
        }

        async fn complete_light(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok("title".into())
        }

        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
            _tokens: mpsc::Sender<String>,
        ) -> Result<LlmTurn> {
            Ok(LlmTurn::default())
        }
    }

    async fn setup() -> (tempfile::TempDir, Store, i64) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("test.db")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);
        let kb = store.create_knowledge_base("test", None).await.unwrap();
        (dir, store, kb.id)
    }

    fn generator(store: Store, replies: Vec<&str>, max_revisions: u32) -> CourseGenerator {
        let retrieval = Arc::new(RetrievalTool::new(
            Arc::new(FixedEmbedder),
            Arc::new(MemoryIndex::new()),
            5,
        ));
        CourseGenerator::new(
            store,
            Arc::new(ScriptedLlm::new(replies)),
            retrieval,
            CourseConfig {
                max_revisions,
                max_sections: 10,
            },
        )
    }

    const PLAN: &str = r#"{"title":"Intro","sections":[{"title":"Basics","objective":"learn"}]}"#;

    #[tokio::test]
    async fn accepted_draft_is_stored_as_lesson() {
        let (_dir, store, kb_id) = setup().await;
        let generator = generator(
            store.clone(),
            vec![PLAN, "draft body", r#"{"accept":true,"notes":""}"#],
            3,
        );
        let transport = BufferTransport::new();

        let lessons = generator.generate(kb_id, "topic", &transport).await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].title, "Basics");
        assert_eq!(lessons[0].content, "draft body");
        assert_eq!(lessons[0].lesson_order, 1);

        let stored = store.list_lessons(kb_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(transport
            .events()
            .iter()
            .any(|e| matches!(e, TransportEvent::Section { lesson_order: 1, .. })));
    }

    #[tokio::test]
    async fn streamed_section_order_continues_from_stored_lessons() {
        let (_dir, store, kb_id) = setup().await;
        store
            .insert_lessons(kb_id, &[("Old".into(), "old content".into())])
            .await
            .unwrap();
        let generator = generator(
            store.clone(),
            vec![PLAN, "draft body", r#"{"accept":true,"notes":""}"#],
            3,
        );
        let transport = BufferTransport::new();

        let lessons = generator.generate(kb_id, "topic", &transport).await.unwrap();
        assert_eq!(lessons[0].lesson_order, 2);
        assert!(transport
            .events()
            .iter()
            .any(|e| matches!(e, TransportEvent::Section { lesson_order: 2, .. })));
    }

    #[tokio::test]
    async fn rejected_draft_is_revised_then_accepted() {
        let (_dir, store, kb_id) = setup().await;
        let generator = generator(
            store.clone(),
            vec![
                PLAN,
                "first draft",
                r#"{"accept":false,"notes":"too thin"}"#,
                "revised draft",
                r#"{"accept":true,"notes":""}"#,
            ],
            3,
        );
        let transport = BufferTransport::new();

        let lessons = generator.generate(kb_id, "topic", &transport).await.unwrap();
        assert_eq!(lessons[0].content, "revised draft");

        let verdicts: Vec<bool> = transport
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::ReviewFeedback { accepted, .. } => Some(accepted),
                _ => None,
            })
            .collect();
        assert_eq!(verdicts, vec![false, true]);
    }

    #[tokio::test]
    async fn revision_rounds_are_bounded() {
        let (_dir, store, kb_id) = setup().await;
        // Reviewer always rejects; with max_revisions = 2 the second
        // revision ships without another review.
        let generator = generator(
            store.clone(),
            vec![
                PLAN,
                "draft v1",
                r#"{"accept":false,"notes":"no"}"#,
                "draft v2",
                r#"{"accept":false,"notes":"still no"}"#,
                "draft v3",
            ],
            2,
        );
        let transport = BufferTransport::new();

        let lessons = generator.generate(kb_id, "topic", &transport).await.unwrap();
        assert_eq!(lessons[0].content, "draft v3");
    }

    #[tokio::test]
    async fn unusable_plan_fails_with_error_event() {
        let (_dir, store, kb_id) = setup().await;
        let generator = generator(store.clone(), vec!["not json at all"], 3);
        let transport = BufferTransport::new();

        let err = generator
            .generate(kb_id, "topic", &transport)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
        assert!(transport
            .events()
            .iter()
            .any(|e| matches!(e, TransportEvent::Error { .. })));
        assert!(store.list_lessons(kb_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_sections_are_capped() {
        let (_dir, store, kb_id) = setup().await;
        let plan = r#"{"title":"Big","sections":[
            {"title":"A","objective":""},
            {"title":"B","objective":""},
            {"title":"C","objective":""}
        ]}"#;
        let mut replies = vec![plan];
        for _ in 0..2 {
            replies.push("body");
            replies.push(r#"{"accept":true,"notes":""}"#);
        }
        let retrieval = Arc::new(RetrievalTool::new(
            Arc::new(FixedEmbedder),
            Arc::new(MemoryIndex::new()),
            5,
        ));
        let generator = CourseGenerator::new(
            store.clone(),
            Arc::new(ScriptedLlm::new(replies)),
            retrieval,
            CourseConfig {
                max_revisions: 3,
                max_sections: 2,
            },
        );

        let lessons = generator
            .generate(kb_id, "topic", &BufferTransport::new())
            .await
            .unwrap();
        assert_eq!(lessons.len(), 2);
    }

    #[test]
    fn parse_json_reply_strips_code_fences() {
        let fenced = "```json\n{\"accept\": true, \"notes\": \"\"}\n```";
        let verdict: ReviewVerdict = parse_json_reply(fenced).unwrap();
        assert!(verdict.accept);
    }
}
