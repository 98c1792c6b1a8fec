//! Gemini backend adapter (structured function-calling protocol)
//!
//! Tool arguments arrive as typed JSON objects in `functionCall.args`; tool
//! results go back as `functionResponse` parts. Images are inline base64.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::backend::{BackendAdapter, Conversation, Sampling, ToolResultMsg, Turn, TurnRole};
use crate::config::GeminiConfig;
use crate::error::EngineError;
use crate::models::{ModelReply, ToolCallRequest};
use crate::tools::ToolSpec;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{error, info};

pub struct GeminiAdapter {
    client: Client,
    config: GeminiConfig,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(config: GeminiConfig, timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let base_url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            config.model
        );

        Self {
            client,
            config,
            base_url,
        }
    }

    fn build_request(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        sampling: Sampling,
    ) -> GeminiRequest {
        let mut system_instruction = None;
        let mut contents = Vec::with_capacity(conversation.len());

        for turn in conversation.turns() {
            match turn.role {
                TurnRole::System if system_instruction.is_none() => {
                    system_instruction = Some(SystemInstruction {
                        parts: vec![Part::text(&turn.text)],
                    });
                }
                // Extra system turns have no slot in this protocol.
                TurnRole::System => contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part::text(&turn.text)],
                }),
                TurnRole::User => contents.push(Content {
                    role: "user".to_string(),
                    parts: user_parts(turn),
                }),
                TurnRole::Model => contents.push(Content {
                    role: "model".to_string(),
                    parts: model_parts(turn),
                }),
            }
        }

        let tools = if tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|spec| FunctionDeclaration {
                        name: spec.name.clone(),
                        description: spec.description.clone(),
                        parameters: spec.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        GeminiRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: sampling.adjust(self.config.params.temperature),
                top_p: self.config.params.top_p,
                top_k: self.config.params.top_k,
                max_output_tokens: self.config.params.max_output_tokens,
            },
            system_instruction,
            tools,
        }
    }
}

fn user_parts(turn: &Turn) -> Vec<Part> {
    let mut parts = Vec::new();

    for image in &turn.images {
        if image.data.is_empty() {
            continue;
        }
        parts.push(Part {
            inline_data: Some(InlineData {
                mime_type: image.resolved_mime(),
                data: BASE64.encode(&image.data),
            }),
            ..Part::default()
        });
    }

    for result in &turn.tool_results {
        parts.push(Part {
            function_response: Some(FunctionResponse {
                name: result.name.clone(),
                response: tool_response_payload(result),
            }),
            ..Part::default()
        });
    }

    if !turn.text.is_empty() {
        parts.push(Part::text(&turn.text));
    }

    if parts.is_empty() {
        parts.push(Part::text(""));
    }

    parts
}

fn model_parts(turn: &Turn) -> Vec<Part> {
    let mut parts = Vec::new();

    if !turn.text.is_empty() {
        parts.push(Part::text(&turn.text));
    }

    for call in &turn.tool_calls {
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: call.name.clone(),
                args: Some(call.arguments.clone()),
            }),
            ..Part::default()
        });
    }

    if parts.is_empty() {
        parts.push(Part::text(""));
    }

    parts
}

fn tool_response_payload(result: &ToolResultMsg) -> Value {
    if result.is_error {
        json!({ "error": result.content })
    } else {
        json!({ "result": result.content })
    }
}

#[async_trait::async_trait]
impl BackendAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        sampling: Sampling,
    ) -> Result<ModelReply> {
        if self.config.api_key.is_empty() {
            return Err(EngineError::ConfigError(
                "GOOGLE_AI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.config.api_key);
        let request = self.build_request(conversation, tools, sampling);

        info!(model = %self.config.model, turns = conversation.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                EngineError::BackendError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(EngineError::BackendError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            EngineError::BackendError(format!("Gemini parse error: {}", e))
        })?;

        extract_reply(gemini_response)
    }
}

/// Aggregate free text and function calls across every candidate.
fn extract_reply(response: GeminiResponse) -> Result<ModelReply> {
    if response.candidates.is_empty() {
        return Err(EngineError::EmptyModelResponse);
    }

    let mut reply = ModelReply::default();

    for candidate in response.candidates {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(text) = part.text {
                reply.text.push_str(&text);
            }
            if let Some(call) = part.function_call {
                reply.tool_calls.push(ToolCallRequest {
                    id: None,
                    name: call.name,
                    arguments: call.args.unwrap_or_default(),
                });
            }
        }
    }

    Ok(reply)
}

//
// ================= Wire types =================
//

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(
        default,
        alias = "functionCall",
        skip_serializing_if = "Option::is_none"
    )]
    function_call: Option<FunctionCall>,
    #[serde(
        default,
        alias = "functionResponse",
        skip_serializing_if = "Option::is_none"
    )]
    function_response: Option<FunctionResponse>,
    #[serde(default, alias = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;
    use crate::models::ImageData;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new(
            GeminiConfig {
                api_key: "test".to_string(),
                model: "gemini-2.0-flash-lite".to_string(),
                params: ModelParams::default(),
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn request_carries_tools_and_system_instruction() {
        let mut convo = Conversation::new();
        convo.push(Turn::system("You are StockAssist AI"));
        convo.push(Turn::user("What is RSI?"));

        let tools = vec![ToolSpec {
            name: "web_search".to_string(),
            description: "Search".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let request = adapter().build_request(&convo, &tools, Sampling::Default);
        let encoded = serde_json::to_value(&request).unwrap();

        assert_eq!(encoded["contents"][0]["role"], "user");
        assert_eq!(
            encoded["system_instruction"]["parts"][0]["text"],
            "You are StockAssist AI"
        );
        assert_eq!(
            encoded["tools"][0]["function_declarations"][0]["name"],
            "web_search"
        );
    }

    #[test]
    fn images_become_inline_data() {
        let mut convo = Conversation::new();
        convo.push(Turn::user_with_images(
            "analyze this chart",
            vec![ImageData {
                data: vec![0xFF, 0xD8],
                mime_type: None,
                name: Some("chart.png".to_string()),
            }],
        ));

        let request = adapter().build_request(&convo, &[], Sampling::Default);
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded["contents"][0]["parts"][0]["inline_data"]["mime_type"],
            "image/png"
        );
    }

    #[test]
    fn camel_case_function_calls_parse() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Let me check."},
                        {"functionCall": {"name": "web_search", "args": {"query": "AAPL"}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        });

        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        let reply = extract_reply(response).unwrap();
        assert_eq!(reply.text, "Let me check.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "web_search");
        assert_eq!(
            reply.tool_calls[0].arguments.get("query").unwrap(),
            "AAPL"
        );
    }

    #[test]
    fn zero_candidates_is_empty_response() {
        let response: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(
            extract_reply(response),
            Err(EngineError::EmptyModelResponse)
        ));
    }
}
