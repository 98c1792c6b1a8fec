//! Webpage fetch tool
//!
//! Fetches a URL and extracts readable text, bounded to 2000 characters.

use crate::error::EngineError;
use crate::tools::Tool;
use crate::Result;
use reqwest::Client;
use serde_json::{Map, Value};

const MAX_CONTENT_CHARS: usize = 2000;

pub struct FetchWebpageTool {
    client: Client,
}

impl FetchWebpageTool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max - 3).collect();
    format!("{}...", cut)
}

#[async_trait::async_trait]
impl Tool for FetchWebpageTool {
    fn name(&self) -> &'static str {
        "fetch_webpage"
    }

    fn description(&self) -> &'static str {
        "Extract and analyze content from financial websites, news articles, company reports, or market analyses. Use this to get detailed information from specific sources."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL of the financial webpage to analyze (must be a complete URL including https://)"
                }
            },
            "required": ["url"]
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["url"]
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .ok_or_else(|| {
                EngineError::InvalidToolInput("Missing or malformed 'url' parameter".to_string())
            })?;

        let response = self.client.get(url).send().await.map_err(|e| {
            EngineError::ToolError(format!("Error fetching webpage: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(EngineError::ToolError(format!(
                "Error fetching webpage: HTTP {}",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            EngineError::ToolError(format!("Error reading webpage body: {}", e))
        })?;

        let text = html2text::from_read(body.as_ref(), 100);
        let text = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(truncate_chars(&text, MAX_CONTENT_CHARS))
    }
}
