//! Client-facing event stream.
//!
//! The chat agent and the course generator emit [`TransportEvent`]s as
//! they work; a [`Transport`] carries them to whoever is listening. The
//! HTTP server bridges a [`ChannelTransport`] onto an NDJSON response
//! body; tests collect events in a [`BufferTransport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::models::RetrievedSource;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// One streamed content token.
    Message { text: String },
    /// Sources cited by the turn, sent before the final token flush ends.
    Sources { sources: Vec<RetrievedSource> },
    /// Coarse progress state ("thinking", "retrieving", "generating").
    Status { state: String },
    /// Conversation title, emitted at most once per conversation.
    Title { title: String },
    /// Human-readable progress line from a long-running generation.
    Log { message: String },
    /// Reviewer verdict on one drafted section.
    ReviewFeedback {
        section: String,
        accepted: bool,
        notes: String,
    },
    /// One finished course section.
    Section {
        title: String,
        content: String,
        lesson_order: i64,
    },
    Error { message: String },
    /// Terminates the stream; nothing follows.
    End,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one event. [`EngineError::TransportClosed`] means the
    /// client has gone away.
    async fn send(&self, event: TransportEvent) -> Result<()>;
}

/// Transport over a tokio channel; the receiving half typically feeds an
/// HTTP response body.
pub struct ChannelTransport {
    tx: mpsc::Sender<TransportEvent>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { tx }
    }

    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, event: TransportEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::TransportClosed)
    }
}

/// In-memory transport that records everything it is sent.
#[derive(Default)]
pub struct BufferTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl BufferTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Concatenation of all streamed message tokens.
    pub fn message_text(&self) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for BufferTransport {
    async fn send(&self, event: TransportEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| EngineError::TransportClosed)?
            .push(event);
        Ok(())
    }
}
