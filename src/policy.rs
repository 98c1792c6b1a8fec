//! Search policy
//!
//! Decides, from the request text alone, how many search-class tool calls
//! must happen before the engine is allowed to finalize. Pure functions:
//! same input, same decision.

use lazy_static::lazy_static;
use regex::Regex;

/// Static keyword lists — zero allocation
const STOCK_KEYWORDS: &[&str] = &[
    "stock", "market", "company", "earnings", "revenue", "profit",
    "share", "price", "trading", "investor", "investment", "dividend",
    "nasdaq", "nyse", "dow", "s&p", "index", "etf", "fund",
    "bull", "bear", "trend", "analysis", "forecast", "prediction",
    "performance", "growth", "decline", "merger", "acquisition",
];

const LATEST_INFO_KEYWORDS: &[&str] = &[
    "latest", "recent", "current", "today", "now", "update",
    "news", "announcement", "development", "report", "release",
    "this week", "this month", "this year", "forecast", "outlook",
    "future", "upcoming", "expected", "planned", "scheduled",
];

const QUESTION_MARKERS: &[&str] = &["what", "when", "where", "who", "why", "how", "?"];

/// Uppercase words that are never ticker symbols.
const SYMBOL_STOP_LIST: &[&str] = &[
    "I", "A", "AN", "THE", "AND", "OR", "IF", "IS", "IT", "BE", "TO", "IN", "ON", "AT", "BY",
];

lazy_static! {
    static ref SYMBOL_PATTERN: Regex = Regex::new(r"\b[A-Z]{1,5}\b").unwrap();
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchDecision {
    /// Minimum search-class tool calls before finalization. Zero when
    /// explicit symbols were supplied (structured market data substitutes
    /// for searching).
    pub required_minimum: u32,
    pub is_question: bool,
    pub has_stock_keywords: bool,
    pub needs_latest_info: bool,
}

/// Classify the message and compute the minimum search count.
///
/// Matching is substring containment over the lowercased message, so
/// multi-word phrases like "this week" match too.
pub fn evaluate(message: &str, has_symbols: bool) -> SearchDecision {
    let lowered = message.to_lowercase();

    let is_question = QUESTION_MARKERS.iter().any(|q| lowered.contains(q));
    let has_stock_keywords = STOCK_KEYWORDS.iter().any(|k| lowered.contains(k));
    let needs_latest_info = LATEST_INFO_KEYWORDS.iter().any(|k| lowered.contains(k));

    let mut min_searches = 1;
    if is_question {
        if has_stock_keywords && needs_latest_info {
            min_searches = 3;
        } else if has_stock_keywords || needs_latest_info {
            min_searches = 2;
        }
    }

    // Symbol-scoped requests bypass the comprehensive-search requirement.
    let required_minimum = if has_symbols { 0 } else { min_searches };

    SearchDecision {
        required_minimum,
        is_question,
        has_stock_keywords,
        needs_latest_info,
    }
}

/// Extract candidate ticker symbols: runs of 1-5 uppercase letters, minus a
/// stop-list of common short words. Crude by design — false positives are an
/// accepted trade for determinism.
pub fn extract_potential_symbols(text: &str) -> Vec<String> {
    SYMBOL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|s| !SYMBOL_STOP_LIST.contains(&s.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finance_plus_recency_question_requires_three() {
        let decision = evaluate("What is the latest news on inflation forecasts?", false);
        assert!(decision.is_question);
        assert!(decision.has_stock_keywords); // "forecast"
        assert!(decision.needs_latest_info);
        assert_eq!(decision.required_minimum, 3);
    }

    #[test]
    fn single_category_question_requires_two() {
        let decision = evaluate("How do dividend payouts work?", false);
        assert!(decision.is_question);
        assert!(decision.has_stock_keywords);
        assert!(!decision.needs_latest_info);
        assert_eq!(decision.required_minimum, 2);
    }

    #[test]
    fn plain_statement_requires_one() {
        let decision = evaluate("Tell me about compounding.", false);
        assert!(!decision.is_question);
        assert_eq!(decision.required_minimum, 1);
    }

    #[test]
    fn explicit_symbols_waive_the_requirement() {
        // Finance + recency question, but symbol-scoped.
        let decision = evaluate("What's the outlook?", true);
        assert!(decision.is_question);
        assert_eq!(decision.required_minimum, 0);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let a = evaluate("What moved the NASDAQ today?", false);
        let b = evaluate("What moved the NASDAQ today?", false);
        assert_eq!(a, b);
    }

    #[test]
    fn symbol_extraction_finds_tickers() {
        assert_eq!(extract_potential_symbols("AAPL outlook?"), vec!["AAPL"]);
        assert_eq!(
            extract_potential_symbols("Compare MSFT AND GOOG"),
            vec!["MSFT", "GOOG"]
        );
    }

    #[test]
    fn symbol_extraction_skips_stop_words() {
        assert!(extract_potential_symbols("IF IT IS ON THE AND OR AT AN I A TO IN BE BY").is_empty());
        // Longer than five letters never matches.
        assert!(extract_potential_symbols("NASDAQ").is_empty());
        // Anything not on the stop list is kept, even ordinary words.
        assert_eq!(extract_potential_symbols("IS IT ON THE TABLE"), vec!["TABLE"]);
    }
}
