//! Final-response generation with layered fallbacks
//!
//! After the tool loop ends, one more model call asks for the comprehensive
//! answer. When that call fails or comes back too short, the finalizer
//! degrades gracefully: the last loop response, then a compact retry at a
//! slightly higher temperature, then a plain summary of tool output. The
//! operation always completes with text, never with an error from here.

use crate::backend::{BackendAdapter, Conversation, Sampling, Turn};
use crate::models::ToolRecord;
use crate::signals::{append_disclaimer, clean_require_more_tools_tag};
use crate::tracker::OperationStore;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const FINAL_REQUEST: &str = "Based on all the information gathered and analysis done, \
    please provide your complete and comprehensive final response to the user's query. \
    This will be shown directly to the user. Remember to word your response as if it's \
    not financial advice but just the answer to what the user asked.";

const COMPACT_RETRY_REQUEST: &str = "Please provide your complete, final answer based on \
    all the information you have gathered. Make sure it's comprehensive and directly \
    addresses my original question.";

const NO_TOOLS_FALLBACK: &str = "I should use tools to provide you with real-time \
    financial data and analysis. Let me try again with specific tool calls to get you \
    accurate information.";

/// A reply this short is treated as a refusal to answer and falls through
/// to the next stage.
const MIN_USABLE_LEN: usize = 20;

const SUMMARY_SNIPPET_LEN: usize = 300;

/// Everything the finalizer needs from the finished tool loop.
pub struct FinalizeInput<'a> {
    /// Full loop transcript, system prompt included.
    pub conversation: &'a Conversation,
    /// Cleaned text of the last loop reply, possibly empty.
    pub candidate: &'a str,
    /// The user's original message.
    pub message: &'a str,
    pub system_prompt: &'a str,
    pub tool_records: &'a [ToolRecord],
}

pub struct ResponseFinalizer {
    backend: Arc<dyn BackendAdapter>,
}

impl ResponseFinalizer {
    pub fn new(backend: Arc<dyn BackendAdapter>) -> Self {
        Self { backend }
    }

    /// Produce the final user-facing text. Infallible: every failure path
    /// lands on a usable fallback, and the disclaimer is always appended.
    pub async fn finalize(
        &self,
        store: &dyn OperationStore,
        operation_id: Uuid,
        input: FinalizeInput<'_>,
    ) -> String {
        let candidate = seed_candidate(input.candidate, input.tool_records);

        let _ = store
            .update_step(operation_id, "Requesting final comprehensive response")
            .await;

        let mut conversation = input.conversation.clone();
        conversation.push(Turn::user(FINAL_REQUEST));

        match self
            .backend
            .send(&conversation, &[], Sampling::Default)
            .await
        {
            Ok(reply) => {
                let cleaned = clean_require_more_tools_tag(&reply.text);
                if cleaned.chars().count() > MIN_USABLE_LEN {
                    return append_disclaimer(&cleaned);
                }
                info!(operation_id = %operation_id, "Final response too short, keeping candidate");
                let _ = store
                    .update_step(operation_id, "Using previous response as final output")
                    .await;
                append_disclaimer(&candidate)
            }
            Err(e) => {
                warn!(operation_id = %operation_id, "Final response request failed: {}", e);
                let _ = store
                    .update_step(
                        operation_id,
                        &format!("Error getting final comprehensive response: {}", e),
                    )
                    .await;
                let _ = store
                    .update_step(operation_id, "Retrying with simplified message structure")
                    .await;

                match self.compact_retry(&input).await {
                    Some(text) => append_disclaimer(&text),
                    None => {
                        let _ = store
                            .update_step(operation_id, "Summarizing tool results directly")
                            .await;
                        append_disclaimer(&summarize_tool_records(input.tool_records))
                    }
                }
            }
        }
    }

    /// Second attempt with a flat four-message transcript instead of the
    /// full tool-call history, sampled slightly hotter.
    async fn compact_retry(&self, input: &FinalizeInput<'_>) -> Option<String> {
        let gathered = input
            .tool_records
            .iter()
            .map(|r| format!("--- {} ---\n{}", r.name, r.text()))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut conversation = Conversation::new();
        conversation.push(Turn::system(input.system_prompt));
        conversation.push(Turn::user(format!(
            "{}\n\nTools have gathered the following information:\n\n{}",
            input.message, gathered
        )));
        conversation.push(Turn::model(&crate::models::ModelReply {
            text: "I've analyzed this data and am ready to respond.".to_string(),
            tool_calls: Vec::new(),
        }));
        conversation.push(Turn::user(COMPACT_RETRY_REQUEST));

        match self
            .backend
            .send(&conversation, &[], Sampling::Boosted)
            .await
        {
            Ok(reply) => {
                let cleaned = clean_require_more_tools_tag(&reply.text);
                (!cleaned.is_empty()).then_some(cleaned)
            }
            Err(e) => {
                warn!("Simplified retry failed: {}", e);
                None
            }
        }
    }
}

/// When the loop produced no usable text, synthesize a candidate from the
/// raw tool output so there is always something to fall back on.
fn seed_candidate(candidate: &str, records: &[ToolRecord]) -> String {
    if !candidate.trim().is_empty() {
        return candidate.to_string();
    }
    if records.is_empty() {
        return NO_TOOLS_FALLBACK.to_string();
    }

    let mut text =
        String::from("I've analyzed your request and gathered the following information:\n\n");
    for record in records {
        text.push_str(&format!("--- {} ---\n{}\n\n", record.name, record.text()));
    }
    text
}

/// Last resort: a bullet per tool result, clipped to a readable length.
/// With nothing gathered at all, a stock apology is the best we can do.
fn summarize_tool_records(records: &[ToolRecord]) -> String {
    if records.is_empty() {
        return NO_TOOLS_FALLBACK.to_string();
    }

    let mut summary = String::from("Based on the data I gathered:\n\n");
    for record in records {
        let text = record.text();
        let clipped: String = text.chars().take(SUMMARY_SNIPPET_LEN).collect();
        let suffix = if text.chars().count() > SUMMARY_SNIPPET_LEN {
            "..."
        } else {
            ""
        };
        summary.push_str(&format!("• {}: {}{}\n\n", record.name, clipped, suffix));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::models::ToolOutcome;
    use crate::signals::DISCLAIMER;
    use crate::tracker::InMemoryOperationStore;
    use serde_json::Map;

    fn record(name: &str, text: &str) -> ToolRecord {
        ToolRecord {
            name: name.to_string(),
            arguments: Map::new(),
            outcome: ToolOutcome::Result(text.to_string()),
        }
    }

    async fn run(
        backend: ScriptedBackend,
        candidate: &str,
        records: Vec<ToolRecord>,
    ) -> (String, usize) {
        let backend = Arc::new(backend);
        let calls = Arc::clone(&backend);
        let finalizer = ResponseFinalizer::new(backend);
        let store = InMemoryOperationStore::new();
        let operation_id = Uuid::new_v4();

        let mut conversation = Conversation::new();
        conversation.push(Turn::system("sys"));
        conversation.push(Turn::user("What is AAPL doing?"));

        let text = finalizer
            .finalize(
                &store,
                operation_id,
                FinalizeInput {
                    conversation: &conversation,
                    candidate,
                    message: "What is AAPL doing?",
                    system_prompt: "sys",
                    tool_records: &records,
                },
            )
            .await;
        (text, calls.calls_served())
    }

    #[tokio::test]
    async fn good_final_response_gets_disclaimer() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text_reply(
            "Apple stock has been trending upward this quarter on strong earnings.",
        )]);
        let (text, calls) = run(backend, "", vec![]).await;
        assert!(text.starts_with("Apple stock has been trending upward"));
        assert!(text.contains(DISCLAIMER.trim()));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn short_reply_falls_back_to_candidate() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text_reply("ok")]);
        let candidate = "AAPL closed at 230.12 today, up 1.4% on above-average volume.";
        let (text, calls) = run(backend, candidate, vec![]).await;
        assert!(text.starts_with(candidate));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn backend_failure_reaches_compact_retry() {
        let backend = ScriptedBackend::new(vec![
            Err(crate::error::EngineError::EmptyModelResponse),
            ScriptedBackend::text_reply("Here is the summary of the gathered market data."),
        ]);
        let (text, calls) = run(backend, "", vec![record("web_search", "result")]).await;
        assert!(text.starts_with("Here is the summary"));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn compact_retry_uses_boosted_sampling() {
        let backend = ScriptedBackend::new(vec![
            Err(crate::error::EngineError::EmptyModelResponse),
            ScriptedBackend::text_reply("Detailed enough final answer for the user."),
        ]);
        let backend = Arc::new(backend);
        let sent = Arc::clone(&backend);
        let finalizer = ResponseFinalizer::new(backend);
        let store = InMemoryOperationStore::new();

        let conversation = Conversation::new();
        finalizer
            .finalize(
                &store,
                Uuid::new_v4(),
                FinalizeInput {
                    conversation: &conversation,
                    candidate: "",
                    message: "m",
                    system_prompt: "s",
                    tool_records: &[],
                },
            )
            .await;

        let log = sent.sent.lock().unwrap();
        assert_eq!(log[1].1, Sampling::Boosted);
    }

    #[tokio::test]
    async fn total_failure_yields_bullet_summary() {
        let long_result = "x".repeat(400);
        let backend = ScriptedBackend::new(vec![
            Err(crate::error::EngineError::EmptyModelResponse),
            Err(crate::error::EngineError::EmptyModelResponse),
        ]);
        let (text, _) = run(backend, "", vec![record("get_earnings", &long_result)]).await;
        assert!(text.starts_with("Based on the data I gathered:"));
        assert!(text.contains("• get_earnings: "));
        assert!(text.contains("..."));
        assert!(!text.contains(&long_result));
    }

    #[tokio::test]
    async fn short_reply_with_no_candidate_uses_seeded_tool_digest() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text_reply("ok")]);
        let (text, _) = run(backend, "", vec![record("web_search", "headline here")]).await;
        assert!(text.starts_with("I've analyzed your request"));
        assert!(text.contains("--- web_search ---"));
        assert!(text.contains("headline here"));
    }

    #[test]
    fn empty_summary_apologizes() {
        assert!(summarize_tool_records(&[]).contains("I should use tools"));
    }
}
