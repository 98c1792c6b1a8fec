//! Engine configuration
//!
//! One explicit struct built at startup and passed into constructors.
//! Environment variable names mirror the StockAssist deployment so the
//! same .env file keeps working.

use std::env;
use std::time::Duration;

use crate::error::EngineError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenRouter,
}

/// Sampling parameters shared by both backend protocols.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_output_tokens: i32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub params: ModelParams,
}

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub params: ModelParams,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    pub gemini: GeminiConfig,
    pub openrouter: OpenRouterConfig,
    pub alpha_vantage_key: String,
    /// ISO language code for responses ("en" skips the language preamble).
    pub language: String,
    pub http_timeout: Duration,
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Read configuration from the environment. Call `dotenv::dotenv()`
    /// first if a .env file should be honored.
    pub fn from_env() -> Result<Self> {
        let provider = match env::var("AI_PROVIDER")
            .unwrap_or_else(|_| "google".to_string())
            .as_str()
        {
            "google" => ProviderKind::Gemini,
            "openrouter" => ProviderKind::OpenRouter,
            other => {
                return Err(EngineError::ConfigError(format!(
                    "Unsupported AI_PROVIDER: {}",
                    other
                )))
            }
        };

        let gemini = GeminiConfig {
            api_key: env::var("GOOGLE_AI_API_KEY").unwrap_or_default(),
            model: env::var("GOOGLE_AI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash-lite".to_string()),
            params: ModelParams {
                temperature: env_f32("GOOGLE_AI_TEMPERATURE", 0.7),
                top_p: env_f32("GOOGLE_AI_TOP_P", 0.95),
                top_k: env_i32("GOOGLE_AI_TOP_K", 40),
                max_output_tokens: env_i32("GOOGLE_AI_MAX_OUTPUT_TOKENS", 4096),
            },
        };

        let openrouter = OpenRouterConfig {
            api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            base_url: env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            model: env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3-opus:beta".to_string()),
            params: ModelParams {
                temperature: env_f32("OPENROUTER_TEMPERATURE", 0.7),
                top_p: env_f32("OPENROUTER_TOP_P", 0.95),
                top_k: 0,
                max_output_tokens: env_i32("OPENROUTER_MAX_TOKENS", 4096),
            },
        };

        Ok(Self {
            provider,
            gemini,
            openrouter,
            alpha_vantage_key: env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default(),
            language: env::var("RESPONSE_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            http_timeout: Duration::from_secs(30),
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gemini,
            gemini: GeminiConfig {
                api_key: String::new(),
                model: "gemini-2.0-flash-lite".to_string(),
                params: ModelParams::default(),
            },
            openrouter: OpenRouterConfig {
                api_key: String::new(),
                base_url: "https://openrouter.ai/api/v1".to_string(),
                model: "anthropic/claude-3-opus:beta".to_string(),
                params: ModelParams::default(),
            },
            alpha_vantage_key: String::new(),
            language: "en".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}
