//! Model backend abstraction
//!
//! Two provider protocols (Gemini function calling, OpenRouter JSON-string
//! tool calls) behind one adapter trait. The orchestration loop only ever
//! sees `Conversation` in and `ModelReply` out; the adapter is chosen once
//! at construction from configuration.

pub mod gemini;
pub mod openrouter;

pub use gemini::GeminiAdapter;
pub use openrouter::OpenRouterAdapter;

use crate::config::{EngineConfig, ProviderKind};
use crate::models::{ImageData, ModelReply, ToolCallRequest};
use crate::tools::ToolSpec;
use crate::Result;
use std::sync::Arc;

/// Who produced a turn, protocol-independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    System,
    User,
    Model,
}

/// One executed tool call, ready to be fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolResultMsg {
    pub call_id: Option<String>,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// One transcript entry. Model turns may carry tool calls; the turn that
/// answers them carries tool results.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub images: Vec<ImageData>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_results: Vec<ToolResultMsg>,
}

impl Turn {
    fn empty(role: TurnRole) -> Self {
        Self {
            role,
            text: String::new(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::empty(TurnRole::System)
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::empty(TurnRole::User)
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        Self {
            text: text.into(),
            images,
            ..Self::empty(TurnRole::User)
        }
    }

    pub fn model(reply: &ModelReply) -> Self {
        Self {
            text: reply.text.clone(),
            tool_calls: reply.tool_calls.clone(),
            ..Self::empty(TurnRole::Model)
        }
    }

    pub fn tool_results(results: Vec<ToolResultMsg>) -> Self {
        Self {
            tool_results: results,
            ..Self::empty(TurnRole::User)
        }
    }
}

/// Adapter-agnostic transcript of one operation's exchange with the model.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Sampling profile for one request. `Boosted` nudges the configured
/// temperature up by 0.1 and is used only by the finalizer retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Default,
    Boosted,
}

impl Sampling {
    pub fn adjust(&self, temperature: f32) -> f32 {
        match self {
            Sampling::Default => temperature,
            Sampling::Boosted => temperature + 0.1,
        }
    }
}

/// One round trip to the model provider.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send the conversation and tool catalog, returning aggregated free
    /// text and tool calls across every candidate/choice. A response with
    /// zero candidates is `EngineError::EmptyModelResponse`.
    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        sampling: Sampling,
    ) -> Result<ModelReply>;
}

/// Select the adapter implementation from configuration.
pub fn build_backend(config: &EngineConfig) -> Arc<dyn BackendAdapter> {
    match config.provider {
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(config.gemini.clone(), config.http_timeout)),
        ProviderKind::OpenRouter => Arc::new(OpenRouterAdapter::new(
            config.openrouter.clone(),
            config.http_timeout,
        )),
    }
}

/// Scripted backend for tests and offline runs: pops one canned reply per
/// `send` call and records every conversation it saw.
pub struct ScriptedBackend {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<ModelReply>>>,
    pub sent: std::sync::Mutex<Vec<(usize, Sampling)>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<ModelReply>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into_iter().collect()),
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn text_reply(text: &str) -> Result<ModelReply> {
        Ok(ModelReply {
            text: text.to_string(),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_reply(calls: Vec<ToolCallRequest>) -> Result<ModelReply> {
        Ok(ModelReply {
            text: String::new(),
            tool_calls: calls,
        })
    }

    /// Number of `send` calls served so far.
    pub fn calls_served(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl BackendAdapter for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(
        &self,
        conversation: &Conversation,
        _tools: &[ToolSpec],
        sampling: Sampling,
    ) -> Result<ModelReply> {
        self.sent.lock().unwrap().push((conversation.len(), sampling));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(crate::error::EngineError::EmptyModelResponse))
    }
}
