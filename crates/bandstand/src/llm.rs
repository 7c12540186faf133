//! The tool-calling LLM seam.
//!
//! Bandstand treats the language model as an opaque oracle that emits
//! batches of tool invocations. This module defines the trait the
//! orchestrator calls through, the minimal conversation types, and two
//! stand-ins: [`NullOracle`] for deployments without a model wired in,
//! and [`ScriptedOracle`] for deterministic tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use bandproto::tools::ToolCall;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model unavailable: {0}")]
    Unavailable(String),

    #[error("language model protocol error: {0}")]
    Protocol(String),
}

/// One conversation message in the multi-turn loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content: None,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// One request to the oracle.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Names of the tools the model may call this turn.
    pub tools: Vec<String>,
    pub max_tokens: u32,
    pub reasoning_fraction: f64,
}

/// Final response of a non-streamed call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Value>,
}

/// Streamed response fragments.
#[derive(Debug, Clone)]
pub enum ChatChunk {
    ReasoningDelta(String),
    ContentDelta(String),
    Done {
        tool_calls: Vec<ToolCall>,
        usage: Option<Value>,
    },
}

/// The opaque tool-calling oracle.
#[async_trait]
pub trait ToolCallingLlm: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, ChatChunk>, LlmError>;
}

/// Buffers streamed reasoning text and releases it on word boundaries,
/// so the client sees readable fragments instead of sub-token dribble.
#[derive(Debug, Default)]
pub struct ReasoningBuffer {
    pending: String,
}

impl ReasoningBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta; returns completed text up to the last whitespace.
    pub fn add(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);
        let cut = self.pending.rfind(char::is_whitespace)?;
        let ready: String = self.pending.drain(..=cut).collect();
        if ready.trim().is_empty() {
            None
        } else {
            Some(ready)
        }
    }

    /// Release whatever is left.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Oracle for deployments without a model wired in: every call fails
/// loudly so misconfiguration is visible instead of silent.
pub struct NullOracle;

#[async_trait]
impl ToolCallingLlm for NullOracle {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
        Err(LlmError::Unavailable(
            "no language model configured".to_string(),
        ))
    }

    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<BoxStream<'static, ChatChunk>, LlmError> {
        Err(LlmError::Unavailable(
            "no language model configured".to_string(),
        ))
    }
}

/// One pre-scripted oracle turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub reasoning: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Deterministic oracle for tests: pops one scripted turn per call.
/// When the script runs dry it returns an empty response, which ends
/// the agent turn loop.
pub struct ScriptedOracle {
    turns: Mutex<VecDeque<ScriptedTurn>>,
}

impl ScriptedOracle {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    fn next_turn(&self) -> ScriptedTurn {
        self.turns
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolCallingLlm for ScriptedOracle {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let turn = self.next_turn();
        Ok(ChatResponse {
            content: turn.content,
            tool_calls: turn.tool_calls,
            usage: None,
        })
    }

    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<BoxStream<'static, ChatChunk>, LlmError> {
        let turn = self.next_turn();
        let mut chunks = Vec::new();
        if let Some(reasoning) = turn.reasoning {
            for word in reasoning.split_inclusive(' ') {
                chunks.push(ChatChunk::ReasoningDelta(word.to_string()));
            }
        }
        if let Some(content) = turn.content {
            chunks.push(ChatChunk::ContentDelta(content));
        }
        chunks.push(ChatChunk::Done {
            tool_calls: turn.tool_calls,
            usage: None,
        });
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasoning_buffer_releases_on_word_boundary() {
        let mut buf = ReasoningBuffer::new();
        assert_eq!(buf.add("stea"), None);
        assert_eq!(buf.add("dy gro"), Some("steady ".to_string()));
        assert_eq!(buf.flush(), Some("gro".to_string()));
        assert_eq!(buf.flush(), None);
    }

    #[tokio::test]
    async fn test_scripted_oracle_pops_turns_in_order() {
        let oracle = ScriptedOracle::new(vec![
            ScriptedTurn {
                tool_calls: vec![ToolCall::new("1", "set_tempo", serde_json::json!({"tempo": 120}))],
                ..Default::default()
            },
            ScriptedTurn::default(),
        ]);
        let first = oracle.chat(empty_request()).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        let second = oracle.chat(empty_request()).await.unwrap();
        assert!(second.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_null_oracle_fails_loudly() {
        let result = NullOracle.chat(empty_request()).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }

    fn empty_request() -> ChatRequest {
        ChatRequest {
            messages: vec![],
            tools: vec![],
            max_tokens: 100,
            reasoning_fraction: 0.0,
        }
    }
}
