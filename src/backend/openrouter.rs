//! OpenRouter backend adapter (OpenAI-compatible chat completions)
//!
//! Tool arguments travel as JSON-encoded strings inside
//! `tool_calls[].function.arguments`; results go back as `role: "tool"`
//! messages correlated by `tool_call_id`. Images ride as `image_url`
//! data URLs inside a mixed content array.

use crate::backend::{BackendAdapter, Conversation, Sampling, Turn, TurnRole};
use crate::config::OpenRouterConfig;
use crate::error::EngineError;
use crate::models::{ModelReply, ToolCallRequest};
use crate::tools::ToolSpec;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct OpenRouterAdapter {
    client: Client,
    config: OpenRouterConfig,
}

impl OpenRouterAdapter {
    pub fn new(config: OpenRouterConfig, timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    fn build_request(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        sampling: Sampling,
    ) -> Value {
        let mut messages = Vec::with_capacity(conversation.len());
        for turn in conversation.turns() {
            append_messages(&mut messages, turn);
        }

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": sampling.adjust(self.config.params.temperature),
            "top_p": self.config.params.top_p,
            "max_tokens": self.config.params.max_output_tokens,
        });

        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.parameters,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

/// One transcript turn can expand into several wire messages: each tool
/// result becomes its own `role: "tool"` message.
fn append_messages(messages: &mut Vec<Value>, turn: &Turn) {
    match turn.role {
        TurnRole::System => messages.push(json!({
            "role": "system",
            "content": turn.text,
        })),
        TurnRole::User => {
            for result in &turn.tool_results {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": result
                        .call_id
                        .clone()
                        .unwrap_or_else(|| result.name.clone()),
                    "name": result.name,
                    "content": result.content,
                }));
            }
            if !turn.text.is_empty() || !turn.images.is_empty() {
                messages.push(json!({
                    "role": "user",
                    "content": user_content(turn),
                }));
            }
        }
        TurnRole::Model => {
            let mut message = json!({
                "role": "assistant",
                "content": turn.text,
            });
            if !turn.tool_calls.is_empty() {
                message["tool_calls"] = turn
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(i, call)| {
                        json!({
                            "id": call.id.clone().unwrap_or_else(|| format!("call_{}", i)),
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": Value::Object(call.arguments.clone()).to_string(),
                            }
                        })
                    })
                    .collect();
            }
            messages.push(message);
        }
    }
}

fn user_content(turn: &Turn) -> Value {
    if turn.images.is_empty() {
        return json!(turn.text);
    }

    let mut blocks = vec![json!({ "type": "text", "text": turn.text })];
    for image in &turn.images {
        if image.data.is_empty() {
            continue;
        }
        blocks.push(json!({
            "type": "image_url",
            "image_url": {
                "url": format!(
                    "data:{};base64,{}",
                    image.resolved_mime(),
                    BASE64.encode(&image.data)
                )
            }
        }));
    }
    Value::Array(blocks)
}

#[async_trait::async_trait]
impl BackendAdapter for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        sampling: Sampling,
    ) -> Result<ModelReply> {
        if self.config.api_key.is_empty() {
            return Err(EngineError::ConfigError(
                "OPENROUTER_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", self.config.base_url);
        let request = self.build_request(conversation, tools, sampling);

        info!(model = %self.config.model, turns = conversation.len(), "Calling OpenRouter API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("OpenRouter API request failed: {}", e);
                EngineError::BackendError(format!("OpenRouter API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenRouter API error response: {}", error_text);
            return Err(EngineError::BackendError(format!(
                "OpenRouter API error: {}",
                error_text
            )));
        }

        let parsed: OpenRouterResponse = response.json().await.map_err(|e| {
            error!("Failed to parse OpenRouter response: {}", e);
            EngineError::BackendError(format!("OpenRouter parse error: {}", e))
        })?;

        extract_reply(parsed)
    }
}

fn extract_reply(response: OpenRouterResponse) -> Result<ModelReply> {
    if response.choices.is_empty() {
        return Err(EngineError::EmptyModelResponse);
    }

    let mut reply = ModelReply::default();

    for choice in response.choices {
        if let Some(content) = choice.message.content {
            reply.text.push_str(&content);
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            reply.tool_calls.push(ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            });
        }
    }

    Ok(reply)
}

/// Arguments arrive as a JSON string; a malformed or non-object payload
/// degrades to no arguments so backfill can still salvage the call.
fn parse_arguments(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!("Tool call arguments were not an object: {}", other);
            Map::new()
        }
        Err(e) => {
            warn!("Failed to parse tool call arguments: {}", e);
            Map::new()
        }
    }
}

//
// ================= Wire types =================
//

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: String,
}
