//! Web and news search tools
//!
//! DuckDuckGo HTML endpoint, no API key required. Result links arrive as
//! redirect URLs carrying the target in the `uddg` query parameter.
//! The news tool falls back to a plain web search when the news-scoped
//! request fails — a tool-level concern, not engine retry policy.

use crate::error::EngineError;
use crate::tools::Tool;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_NUM_RESULTS: usize = 5;
const MAX_NUM_RESULTS: usize = 10;

lazy_static! {
    static ref RESULT_LINK: Regex =
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap();
    static ref RESULT_SNIPPET: Regex =
        Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#).unwrap();
}

#[derive(Debug, Clone)]
struct SearchResult {
    title: String,
    description: String,
    url: String,
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unwrap DuckDuckGo redirect URLs to the real target.
fn resolve_url(href: &str) -> String {
    if let Some(start) = href.find("uddg=") {
        let rest = &href[start + 5..];
        let end = rest.find('&').unwrap_or(rest.len());
        return urlencoding::decode(&rest[..end])
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| rest[..end].to_string());
    }
    href.to_string()
}

fn parse_results(html: &str, max: usize) -> Vec<SearchResult> {
    let snippets: Vec<String> = RESULT_SNIPPET
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| strip_tags(m.as_str()))
        .collect();

    RESULT_LINK
        .captures_iter(html)
        .take(max)
        .enumerate()
        .map(|(i, caps)| SearchResult {
            title: strip_tags(caps.get(2).map(|m| m.as_str()).unwrap_or_default()),
            description: snippets.get(i).cloned().unwrap_or_default(),
            url: resolve_url(caps.get(1).map(|m| m.as_str()).unwrap_or_default()),
        })
        .collect()
}

fn format_results(header: &str, results: &[SearchResult]) -> String {
    let mut out = format!("{}\n\n", header);
    for result in results {
        out.push_str(&format!(
            "Title: {}\nDescription: {}\nURL: {}\n\n",
            result.title, result.description, result.url
        ));
    }
    out
}

async fn run_search(client: &Client, query: &str, recent_only: bool, max: usize) -> Result<Vec<SearchResult>> {
    let mut request = client
        .get(SEARCH_ENDPOINT)
        .query(&[("q", query), ("kl", "us-en")]);
    if recent_only {
        // Past-week filter for news-flavored queries
        request = request.query(&[("df", "w")]);
    }

    let response = request.send().await.map_err(|e| {
        EngineError::ToolError(format!("Search request failed for '{}': {}", query, e))
    })?;

    if !response.status().is_success() {
        return Err(EngineError::ToolError(format!(
            "Search provider returned {} for '{}'",
            response.status(),
            query
        )));
    }

    let html = response.text().await.map_err(|e| {
        EngineError::ToolError(format!("Search response unreadable: {}", e))
    })?;

    let results = parse_results(&html, max);
    debug!(query, count = results.len(), "Search completed");

    if results.is_empty() {
        return Err(EngineError::ToolError(format!(
            "No search results for '{}'",
            query
        )));
    }

    Ok(results)
}

fn extract_query(args: &Map<String, Value>) -> Result<&str> {
    args.get("query")
        .and_then(|v| v.as_str())
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| EngineError::InvalidToolInput("Missing 'query' parameter".to_string()))
}

fn extract_num_results(args: &Map<String, Value>) -> usize {
    args.get("num_results")
        .and_then(|v| v.as_u64())
        .map(|n| (n as usize).clamp(1, MAX_NUM_RESULTS))
        .unwrap_or(DEFAULT_NUM_RESULTS)
}

/// General web search for financial information.
pub struct WebSearchTool {
    client: Client,
}

impl WebSearchTool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for up-to-date financial information, market trends, company news, and investment concepts. Use this for general information needs."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The specific financial information, company, concept, or market trend to search for"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of search results to return (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["query"]
    }

    fn is_search(&self) -> bool {
        true
    }

    fn query_param(&self) -> Option<&'static str> {
        Some("query")
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let query = extract_query(args)?;
        let max = extract_num_results(args);

        let results = run_search(&self.client, query, false, max).await?;
        Ok(format_results("Search Results:", &results))
    }
}

/// Recent-news search with a web-search fallback.
pub struct NewsSearchTool {
    client: Client,
}

impl NewsSearchTool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for NewsSearchTool {
    fn name(&self) -> &'static str {
        "news_search"
    }

    fn description(&self) -> &'static str {
        "Search for the most recent news articles about specific stocks, market events, or financial developments. Critical for event-driven analysis."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "News search query about specific stocks, companies, or market events"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of news articles to return (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["query"]
    }

    fn is_search(&self) -> bool {
        true
    }

    fn query_param(&self) -> Option<&'static str> {
        Some("query")
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let query = extract_query(args)?;
        let max = extract_num_results(args);
        let news_query = format!("{} news", query);

        match run_search(&self.client, &news_query, true, max).await {
            Ok(results) => Ok(format_results(
                &format!("News Search Results for '{}':", query),
                &results,
            )),
            Err(e) => {
                warn!(query, error = %e, "News search failed, falling back to web search");
                let results = run_search(&self.client, &news_query, false, max).await?;
                Ok(format_results(
                    &format!("News Search Results for '{}':", query),
                    &results,
                ))
            }
        }
    }
}
