//! Chat-completion client abstraction.
//!
//! [`LlmClient`] is the seam the agent modules talk through: a plain
//! completion for short structured calls (titles, plans, reviews) and a
//! streaming tool-use call for conversation turns. [`OpenAiChat`] speaks
//! the OpenAI-compatible `/chat/completions` protocol, parsing the SSE
//! stream and accumulating tool-call deltas; tests substitute scripted
//! fakes.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Assistant message carrying tool calls, echoed back into the
    /// transcript during the tool loop.
    pub fn assistant_tool_calls(calls: &[ToolCall]) -> Self {
        Self {
            role: "assistant".into(),
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(calls.iter().map(ToolCallRequest::from).collect()),
        }
    }

    /// Tool result message answering one tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool the model may call, in OpenAI function-calling shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool call the model asked for. `arguments` is the raw JSON string
/// exactly as the model produced it.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCall> for ToolCallRequest {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// One finished model turn: streamed text plus any tool calls.
#[derive(Debug, Clone, Default)]
pub struct LlmTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion with the primary model.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// One-shot completion with the lightweight model (titles and other
    /// cheap auxiliary calls).
    async fn complete_light(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Streaming turn: content tokens go to `tokens` as they arrive; the
    /// assembled turn (full text + tool calls) is the return value.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tokens: mpsc::Sender<String>,
    ) -> Result<LlmTurn>;
}

// ============ OpenAI-compatible implementation ============

pub struct OpenAiChat {
    model: String,
    title_model: String,
    temperature: f64,
    api_base: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EngineError::Config(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(120)))
            .build()
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            title_model: config.title_model.clone(),
            temperature: config.temperature,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            client,
        })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::Config("OPENAI_API_KEY not set".into()))
    }

    async fn complete_with_model(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "temperature": self.temperature,
            "messages": messages,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key()?))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "chat API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::Generation("chat response missing content".into()))
    }
}

#[async_trait]
impl LlmClient for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.complete_with_model(&self.model, messages).await
    }

    async fn complete_light(&self, messages: &[ChatMessage]) -> Result<String> {
        self.complete_with_model(&self.title_model, messages).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tokens: mpsc::Sender<String>,
    ) -> Result<LlmTurn> {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.iter().map(|t| t.to_wire()).collect());
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key()?))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "chat API error {}: {}",
                status, body_text
            )));
        }

        let mut stream = response.bytes_stream();
        let mut accumulator = StreamAccumulator::default();
        let mut buffer = String::new();

        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| EngineError::Generation(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE events are newline-framed; keep the trailing partial line
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(accumulator.finish());
                }
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(token) = accumulator.apply(&event) {
                    // A closed receiver means the client went away; the
                    // caller decides what to do with the partial turn.
                    if tokens.send(token).await.is_err() {
                        return Ok(accumulator.finish());
                    }
                }
            }
        }

        Ok(accumulator.finish())
    }
}

/// Accumulates streamed deltas into a complete turn.
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    // (id, name, arguments) indexed by the wire's tool_calls[].index
    tool_calls: Vec<(String, String, String)>,
}

impl StreamAccumulator {
    /// Apply one SSE event; returns the content token, if any.
    fn apply(&mut self, event: &serde_json::Value) -> Option<String> {
        let delta = &event["choices"][0]["delta"];

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls
                        .push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = call["id"].as_str() {
                    slot.0.push_str(id);
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    slot.1.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    slot.2.push_str(args);
                }
            }
        }

        let token = delta["content"].as_str()?;
        if token.is_empty() {
            return None;
        }
        self.content.push_str(token);
        Some(token.to_string())
    }

    fn finish(self) -> LlmTurn {
        LlmTurn {
            content: self.content,
            tool_calls: self
                .tool_calls
                .into_iter()
                .filter(|(_, name, _)| !name.is_empty())
                .map(|(id, name, arguments)| ToolCall {
                    id,
                    name,
                    arguments,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_collects_content_tokens() {
        let mut acc = StreamAccumulator::default();
        let e1 = serde_json::json!({"choices":[{"delta":{"content":"Hel"}}]});
        let e2 = serde_json::json!({"choices":[{"delta":{"content":"lo"}}]});
        assert_eq!(acc.apply(&e1).as_deref(), Some("Hel"));
        assert_eq!(acc.apply(&e2).as_deref(), Some("lo"));
        let turn = acc.finish();
        assert_eq!(turn.content, "Hello");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn accumulator_assembles_tool_call_deltas() {
        let mut acc = StreamAccumulator::default();
        let e1 = serde_json::json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"call_1","function":{"name":"retrieve","arguments":"{\"qu"}}
        ]}}]});
        let e2 = serde_json::json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"function":{"arguments":"ery\": \"x\"}"}}
        ]}}]});
        acc.apply(&e1);
        acc.apply(&e2);
        let turn = acc.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_1");
        assert_eq!(turn.tool_calls[0].name, "retrieve");
        assert_eq!(turn.tool_calls[0].arguments, "{\"query\": \"x\"}");
    }

    #[test]
    fn tool_spec_wire_shape() {
        let spec = ToolSpec {
            name: "retrieve".into(),
            description: "Search the knowledge base".into(),
            parameters: serde_json::json!({"type":"object","properties":{}}),
        };
        let wire = spec.to_wire();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "retrieve");
    }
}
