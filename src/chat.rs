//! Conversational agent.
//!
//! Drives one turn of a knowledge-base conversation: the user message is
//! persisted up front, the model streams its answer token by token, and
//! a bounded tool loop lets it search the knowledge base. Cited sources
//! get conversation-wide sequential numbers. The very first user turn
//! also names the conversation, exactly once.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::llm::{ChatMessage, LlmClient, LlmTurn, ToolSpec};
use crate::models::{Message, RetrievedSource};
use crate::retrieval::{RetrievalTool, RETRIEVE_TOOL_NAME};
use crate::store::Store;
use crate::transport::{Transport, TransportEvent};

/// Upper bound on retrieve-then-answer rounds in a single turn.
const MAX_TOOL_ROUNDS: usize = 4;

const SYSTEM_PROMPT: &str = "You are a knowledge-base assistant. Answer using the \
    search_knowledge_base tool when the question concerns the knowledge base's \
    content. Cite sources inline as [n] using the numbers from tool results. \
    If the knowledge base has nothing relevant, say so plainly.";

const TITLE_PROMPT: &str = "Write a title for a conversation that opened with the \
    following exchange. Answer with the title only: at most six words, no quotes, \
    no trailing punctuation.";

pub struct ChatAgent {
    store: Store,
    llm: Arc<dyn LlmClient>,
    retrieval: Arc<RetrievalTool>,
}

struct TurnOutcome {
    content: String,
    sources: Vec<RetrievedSource>,
}

impl ChatAgent {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>, retrieval: Arc<RetrievalTool>) -> Self {
        Self {
            store,
            llm,
            retrieval,
        }
    }

    /// Run one conversation turn, streaming events to `transport`.
    ///
    /// The user message is stored before anything else, so a failed turn
    /// never loses it. A closed transport persists whatever streamed so
    /// far as an `interrupted` assistant message; any other failure emits
    /// an `error` event and stores no assistant message at all.
    pub async fn run_turn(
        &self,
        conversation_id: i64,
        user_text: &str,
        transport: &dyn Transport,
    ) -> Result<Message> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        let is_first_turn = self.store.user_message_count(conversation_id).await? == 0;
        self.store
            .append_message(conversation_id, "user", user_text, "complete")
            .await?;

        match self
            .drive(conversation_id, conversation.knowledge_base_id, transport)
            .await
        {
            Ok(outcome) => {
                let message = self
                    .store
                    .append_message(conversation_id, "assistant", &outcome.content, "complete")
                    .await?;
                if !outcome.sources.is_empty() {
                    self.store
                        .insert_sources(conversation_id, message.id, &outcome.sources)
                        .await?;
                }
                if is_first_turn {
                    self.assign_title(conversation_id, user_text, &outcome.content, transport)
                        .await?;
                }
                let _ = transport.send(TransportEvent::End).await;
                Ok(message)
            }
            Err(EngineError::TransportClosed) => {
                tracing::info!(conversation_id, "client disconnected mid-turn");
                Err(EngineError::TransportClosed)
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "turn failed");
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

    async fn drive(
        &self,
        conversation_id: i64,
        knowledge_base_id: i64,
        transport: &dyn Transport,
    ) -> Result<TurnOutcome> {
        let mut messages = self.transcript(conversation_id).await?;
        let tools: Vec<ToolSpec> = vec![self.retrieval.spec()];
        let mut next_source_index = self.store.next_source_index(conversation_id).await?;
        let mut collected_sources: Vec<RetrievedSource> = Vec::new();
        let mut full_content = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            self.send_or_flush(
                transport,
                TransportEvent::Status {
                    state: "thinking".into(),
                },
                conversation_id,
                &full_content,
            )
            .await?;

            let turn = self
                .stream_round(&messages, &tools, transport, conversation_id, &mut full_content)
                .await?;

            if turn.tool_calls.is_empty() || round == MAX_TOOL_ROUNDS - 1 {
                return Ok(TurnOutcome {
                    content: full_content,
                    sources: collected_sources,
                });
            }

            self.send_or_flush(
                transport,
                TransportEvent::Status {
                    state: "retrieving".into(),
                },
                conversation_id,
                &full_content,
            )
            .await?;

            messages.push(ChatMessage::assistant_tool_calls(&turn.tool_calls));
            for call in &turn.tool_calls {
                let result = self
                    .run_tool(knowledge_base_id, call.name.as_str(), &call.arguments, next_source_index)
                    .await;
                let rendered = match result {
                    Ok(sources) => {
                        next_source_index += sources.len() as i64;
                        // Citations go to the client the moment retrieval
                        // returns, not when the answer finishes.
                        if !sources.is_empty() {
                            self.send_or_flush(
                                transport,
                                TransportEvent::Sources {
                                    sources: sources.clone(),
                                },
                                conversation_id,
                                &full_content,
                            )
                            .await?;
                        }
                        let rendered = RetrievalTool::render_for_model(&sources);
                        collected_sources.extend(sources);
                        rendered
                    }
                    // The model gets the failure as tool output and can
                    // still answer; index errors are not fatal to a chat.
                    Err(EngineError::IndexNotInitialized(_)) => {
                        "The knowledge base has no indexed documents yet.".to_string()
                    }
                    Err(e) => return Err(e),
                };
                messages.push(ChatMessage::tool(call.id.clone(), rendered));
            }
        }

        // The for loop always returns on its last round
        Ok(TurnOutcome {
            content: full_content,
            sources: collected_sources,
        })
    }

    /// One streaming model call, forwarding tokens as they arrive. A
    /// closed transport flushes the partial text as an interrupted
    /// message and surfaces [`EngineError::TransportClosed`].
    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        transport: &dyn Transport,
        conversation_id: i64,
        full_content: &mut String,
    ) -> Result<LlmTurn> {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let stream = self.llm.chat_stream(messages, tools, tx);
        tokio::pin!(stream);

        let mut tokens_done = false;
        let mut disconnected = false;
        let outcome = loop {
            tokio::select! {
                token = rx.recv(), if !tokens_done => {
                    match token {
                        Some(text) => {
                            full_content.push_str(&text);
                            if !disconnected
                                && transport
                                    .send(TransportEvent::Message { text })
                                    .await
                                    .is_err()
                            {
                                disconnected = true;
                                // Closing the channel makes the producer
                                // return its partial turn.
                                rx.close();
                            }
                        }
                        None => tokens_done = true,
                    }
                }
                result = &mut stream => {
                    // Drain tokens still buffered in the channel
                    while let Ok(text) = rx.try_recv() {
                        full_content.push_str(&text);
                        if !disconnected
                            && transport
                                .send(TransportEvent::Message { text })
                                .await
                                .is_err()
                        {
                            disconnected = true;
                        }
                    }
                    break result;
                }
            }
        };

        // Disconnect wins over an upstream stream error: the partial text
        // still gets flushed as interrupted.
        if disconnected {
            self.flush_interrupted(conversation_id, full_content).await?;
            return Err(EngineError::TransportClosed);
        }
        outcome
    }

    /// Send a non-token event, flushing partial output if the client has
    /// gone away.
    async fn send_or_flush(
        &self,
        transport: &dyn Transport,
        event: TransportEvent,
        conversation_id: i64,
        partial: &str,
    ) -> Result<()> {
        if transport.send(event).await.is_err() {
            self.flush_interrupted(conversation_id, partial).await?;
            return Err(EngineError::TransportClosed);
        }
        Ok(())
    }

    async fn flush_interrupted(&self, conversation_id: i64, partial: &str) -> Result<()> {
        if !partial.is_empty() {
            self.store
                .append_message(conversation_id, "assistant", partial, "interrupted")
                .await?;
        }
        Ok(())
    }

    async fn run_tool(
        &self,
        knowledge_base_id: i64,
        name: &str,
        arguments: &str,
        start_index: i64,
    ) -> Result<Vec<RetrievedSource>> {
        if name != RETRIEVE_TOOL_NAME {
            return Err(EngineError::Generation(format!("unknown tool '{name}'")));
        }
        let args: serde_json::Value = serde_json::from_str(arguments)
            .map_err(|e| EngineError::Generation(format!("bad tool arguments: {e}")))?;
        let query = args["query"]
            .as_str()
            .ok_or_else(|| EngineError::Generation("tool arguments missing 'query'".into()))?;
        self.retrieval
            .retrieve(knowledge_base_id, query, start_index)
            .await
    }

    async fn transcript(&self, conversation_id: i64) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        for message in self.store.list_messages(conversation_id).await? {
            if message.content.is_empty() {
                continue;
            }
            match message.sender.as_str() {
                "user" => messages.push(ChatMessage::user(message.content)),
                "assistant" => messages.push(ChatMessage::assistant(message.content)),
                _ => {}
            }
        }
        Ok(messages)
    }

    /// Name the conversation from its opening exchange. Falls back to a
    /// truncation of the assistant's response if the model call fails;
    /// either way the title is written at most once.
    async fn assign_title(
        &self,
        conversation_id: i64,
        user_text: &str,
        assistant_text: &str,
        transport: &dyn Transport,
    ) -> Result<()> {
        let fallback = || {
            if assistant_text.trim().is_empty() {
                truncate_title(user_text)
            } else {
                truncate_title(assistant_text)
            }
        };

        let title = match self
            .llm
            .complete_light(&[
                ChatMessage::system(TITLE_PROMPT),
                ChatMessage::user(format!(
                    "User: {user_text}\n\nAssistant: {assistant_text}"
                )),
            ])
            .await
        {
            Ok(generated) => {
                let trimmed = generated.trim().trim_matches('"').to_string();
                if trimmed.is_empty() {
                    fallback()
                } else {
                    trimmed
                }
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "title generation failed");
                fallback()
            }
        };

        if self.store.set_title_if_unset(conversation_id, &title).await? {
            let _ = transport.send(TransportEvent::Title { title }).await;
        }
        Ok(())
    }
}

fn truncate_title(text: &str) -> String {
    let trimmed = text.trim();
    let mut title: String = trimmed.chars().take(60).collect();
    if title.len() < trimmed.len() {
        title.push('…');
    }
    title
}
