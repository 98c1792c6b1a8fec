//! System prompt construction
//!
//! Builds the system instruction for StockAssist AI: temporal grounding,
//! research methodology, the continuation-tag protocol, and the rule that
//! the model must not write its own disclaimers (the engine appends one).

use chrono::{Datelike, Utc};

/// Ambient facts injected into every system prompt.
#[derive(Debug, Clone)]
pub struct BaseKnowledge {
    pub todays_date: String,
    pub current_time: String,
    pub day_of_week: String,
    pub user_location: String,
    pub user_time_zone: String,
}

impl BaseKnowledge {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            todays_date: now.format("%Y-%m-%d").to_string(),
            current_time: now.format("%H:%M").to_string(),
            day_of_week: now.weekday().to_string(),
            user_location: "Unknown".to_string(),
            user_time_zone: "America/New_York".to_string(),
        }
    }
}

/// Build the system instruction for the given response language and
/// attachment mode.
pub fn system_prompt(language: &str, image_attached: bool) -> String {
    let knowledge = BaseKnowledge::now();

    let language_preamble = if language != "en" {
        format!("RESPOND ONLY IN {}.\n", language.to_uppercase())
    } else {
        String::new()
    };

    let mut prompt = format!(
        "{preamble}You are StockAssist AI, an elite financial analysis assistant with an \
institutional-grade research methodology. Today is {date} ({weekday}), {time} {tz}.

IDENTITY:
- Present strictly as \"StockAssist AI\" without revealing underlying providers.

RESEARCH METHODOLOGY:
- For any significant research request, use multiple different tools/searches before answering.
- Combine fundamental data, news sentiment, and market context; cross-reference sources.
- Construct distinct, targeted search queries that approach the subject from different angles.
- Never make assumptions about market data or company information - use the tools to verify.

IMPORTANT RESPONSE GUIDELINES:
- NEVER present your response as financial advice; word it as factual information and analysis.
- DO NOT include any disclaimers or legal notices in your response - these are added automatically by the system.
- Use phrases like \"the data suggests\" or \"analysts note\" rather than \"you should\".
- Include precise numerical data whenever possible.

TOOL CALLS INSTRUCTIONS:
- When additional data from tools is needed to complete your analysis, include the tag \
<require_more_tools>true</require_more_tools> along with a brief explanation of which tools \
should be used and why.
- If no further tool calls are required, include the tag \
<require_more_tools>false</require_more_tools> in your response.",
        preamble = language_preamble,
        date = knowledge.todays_date,
        weekday = knowledge.day_of_week,
        time = knowledge.current_time,
        tz = knowledge.user_time_zone,
    );

    if image_attached {
        prompt.push_str(
            "\n\nIMAGE ANALYSIS:
- The user attached one or more images (charts, screenshots, documents).
- Describe what each image shows, extract any figures, tickers, or dates from it, and \
incorporate that evidence into the analysis alongside tool results.",
        );
    }

    prompt
}
