//! In-band signal parsing
//!
//! The model embeds control markup in its free text: a tri-state
//! `<require_more_tools>` continuation tag and, during forced searches, a
//! `<search>` query tag. Only the first match of a tag is authoritative.
//! This module also owns the mandatory disclaimer suffix.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REQUIRE_MORE_TOOLS: Regex =
        Regex::new(r"(?s)<require_more_tools>(.*?)</require_more_tools>").unwrap();
    static ref SEARCH_QUERY: Regex = Regex::new(r"(?s)<search>(.*?)</search>").unwrap();
}

pub const DISCLAIMER: &str = "\n\n---\n**DISCLAIMER**: **This information is provided for research and educational purposes only. It is not financial advice and should not be construed as such. StockAssist is a research tool that aggregates publicly available information. All investment decisions should be made based on your own research and in consultation with a qualified financial advisor.**";

const DISCLAIMER_PHRASES: &[&str] = &[
    "DISCLAIMER",
    "disclaimer",
    "not financial advice",
    "not investment advice",
    "for educational purposes",
    "for informational purposes",
    "consult with a financial advisor",
    "consult a qualified financial advisor",
];

/// Parse the continuation signal.
///
/// Tri-state: `Some(true)` when the first tag's body contains "true",
/// `Some(false)` when it contains "false", `None` when the tag is absent or
/// carries neither value.
pub fn parse_require_more_tools_tag(text: &str) -> Option<bool> {
    if text.is_empty() {
        return None;
    }

    let body = REQUIRE_MORE_TOOLS
        .captures(text)?
        .get(1)?
        .as_str()
        .trim()
        .to_lowercase();

    if body.contains("true") {
        Some(true)
    } else if body.contains("false") {
        Some(false)
    } else {
        None
    }
}

/// Strip every continuation tag from the text. Idempotent.
pub fn clean_require_more_tools_tag(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    REQUIRE_MORE_TOOLS.replace_all(text, "").trim().to_string()
}

/// Parse the delimited search query out of a forced-search reply.
pub fn parse_search_query(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    SEARCH_QUERY
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
}

/// Append the mandatory disclaimer unless disclaimer-like language is
/// already present. Idempotent.
pub fn append_disclaimer(text: &str) -> String {
    if DISCLAIMER_PHRASES.iter().any(|p| text.contains(p)) {
        return text.to_string();
    }
    format!("{}{}", text, DISCLAIMER)
}
