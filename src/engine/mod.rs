//! Orchestration loop
//!
//! Drives one operation from request to finalized answer: prepare the
//! conversation, call the model, execute any requested tools concurrently,
//! feed results back, and repeat until the model stops asking for tools,
//! the search budget blocks finalization, or the round cap is hit. Every
//! state change is mirrored into the operation store for live progress.

use crate::backend::{BackendAdapter, Conversation, Sampling, ToolResultMsg, Turn};
use crate::config::EngineConfig;
use crate::finalizer::{FinalizeInput, ResponseFinalizer};
use crate::models::{
    ChatRole, ChatTurn, ImageData, ModelReply, Operation, SearchBudget, ToolCallRequest,
    ToolRecord,
};
use crate::policy;
use crate::prompt;
use crate::signals::{clean_require_more_tools_tag, parse_require_more_tools_tag, parse_search_query};
use crate::tools::{ToolRegistry, ToolSpec};
use crate::tracker::OperationStore;
use crate::Result;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Hard cap on model round trips for one operation.
pub const MAX_ROUNDS: usize = 10;

/// How many trailing chat-history turns are replayed into the transcript.
const HISTORY_WINDOW: usize = 5;

/// The tool used when the search budget forces a search.
const FORCED_SEARCH_TOOL: &str = "web_search";

const FORCED_SEARCH_PROMPT: &str =
    "Respond only with a search query in this exact format: <search>your search query here</search>";

const MORE_TOOLS_PROMPT: &str = "Please use additional tools to enhance your analysis. \
    What specific data would be helpful to provide a more comprehensive response?";

/// Everything the caller supplies for one analysis run.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub message: String,
    pub images: Vec<ImageData>,
    pub symbols: Vec<String>,
    pub chat_history: Vec<ChatTurn>,
    /// Pre-fetched structured market data, prepended as context.
    pub context: Option<String>,
}

impl AnalysisRequest {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// How one requested tool call will be handled after validation.
enum PlannedCall {
    /// Run with (possibly backfilled) arguments.
    Execute(ToolCallRequest),
    /// Not runnable; the reason is fed back to the model as an error result.
    Skip { call: ToolCallRequest, reason: String },
}

pub struct AnalysisEngine {
    backend: Arc<dyn BackendAdapter>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn OperationStore>,
    finalizer: ResponseFinalizer,
    config: EngineConfig,
}

impl AnalysisEngine {
    pub fn new(
        backend: Arc<dyn BackendAdapter>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn OperationStore>,
        config: EngineConfig,
    ) -> Self {
        let finalizer = ResponseFinalizer::new(Arc::clone(&backend));
        Self {
            backend,
            registry,
            store,
            finalizer,
            config,
        }
    }

    pub fn store(&self) -> &dyn OperationStore {
        self.store.as_ref()
    }

    /// Register a new pending operation and return its id.
    pub async fn begin(&self, user_id: Uuid) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.store.create(Operation::new(id, user_id)).await?;
        Ok(id)
    }

    /// Run one operation to completion. The returned text always carries
    /// the financial disclaimer. Failures mark the operation failed before
    /// propagating.
    #[instrument(skip(self, request), fields(operation_id = %operation_id))]
    pub async fn run(&self, operation_id: Uuid, request: AnalysisRequest) -> Result<String> {
        if self.store.get(operation_id).await?.is_none() {
            return Err(crate::error::EngineError::InvalidOperation(format!(
                "Unknown operation: {}",
                operation_id
            )));
        }

        self.store.set_processing(operation_id).await?;
        self.step(operation_id, "Initializing analysis").await;

        match self.run_inner(operation_id, &request).await {
            Ok(text) => {
                self.store.complete(operation_id, &text).await?;
                Ok(text)
            }
            Err(e) => {
                warn!(operation_id = %operation_id, "Operation failed: {}", e);
                self.store.fail(operation_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Run on a background task; progress remains observable via the store.
    pub fn spawn(self: Arc<Self>, operation_id: Uuid, request: AnalysisRequest) {
        tokio::spawn(async move {
            let _ = self.run(operation_id, request).await;
        });
    }

    async fn run_inner(&self, operation_id: Uuid, request: &AnalysisRequest) -> Result<String> {
        self.step(operation_id, "Preparing request").await;

        let decision = policy::evaluate(&request.message, !request.symbols.is_empty());
        let mut budget = SearchBudget::new(decision.required_minimum);
        info!(
            operation_id = %operation_id,
            min_searches = budget.required_minimum,
            is_question = decision.is_question,
            "Search policy evaluated"
        );

        let system_prompt = prompt::system_prompt(&self.config.language, !request.images.is_empty());
        let mut conversation = self.prepare_conversation(operation_id, request, &system_prompt).await;
        let specs = self.registry.specs();

        self.step(operation_id, "Processing request").await;
        let mut reply = self.call_model(&mut conversation, &specs).await?;
        let mut response_text = reply.text.clone();

        let mut records: Vec<ToolRecord> = Vec::new();
        let mut round: usize = 0;

        while round < MAX_ROUNDS {
            self.step(
                operation_id,
                &format!("Checking for tool calls (round {}/{})", round + 1, MAX_ROUNDS),
            )
            .await;

            if !reply.has_tool_calls() {
                let tag = parse_require_more_tools_tag(&response_text);

                if !budget.satisfied() {
                    self.step(
                        operation_id,
                        &format!(
                            "Enforcing minimum web searches ({}/{})",
                            budget.performed, budget.required_minimum
                        ),
                    )
                    .await;
                    self.forced_search(
                        operation_id,
                        &mut conversation,
                        &specs,
                        &mut reply,
                        &mut response_text,
                        &mut budget,
                        &mut records,
                    )
                    .await;
                    round += 1;
                    continue;
                }

                if tag == Some(false) || round + 1 >= MAX_ROUNDS {
                    self.step(operation_id, "No more tool calls needed or reached round limit")
                        .await;
                    if round == 0 {
                        self.step(
                            operation_id,
                            "WARNING: No tools were used to process this request",
                        )
                        .await;
                    }
                    break;
                }

                if tag == Some(true) {
                    self.step(operation_id, "Explicitly requesting more tools").await;
                    conversation.push(Turn::user(MORE_TOOLS_PROMPT));
                    match self.call_model(&mut conversation, &specs).await {
                        Ok(next) if next.has_tool_calls() => {
                            reply = next;
                            response_text = reply.text.clone();
                            continue;
                        }
                        Ok(_) => {
                            self.step(operation_id, "No additional tools requested despite tag")
                                .await;
                            break;
                        }
                        Err(e) => {
                            self.step(
                                operation_id,
                                &format!("Error processing more tools request: {}", e),
                            )
                            .await;
                            break;
                        }
                    }
                }

                self.step(
                    operation_id,
                    "No explicit tool request found, proceeding with final response",
                )
                .await;
                break;
            }

            round += 1;

            let planned = self.plan_calls(operation_id, &reply.tool_calls, request).await;
            let executable: Vec<&ToolCallRequest> = planned
                .iter()
                .filter_map(|p| match p {
                    PlannedCall::Execute(call) => Some(call),
                    PlannedCall::Skip { .. } => None,
                })
                .collect();

            if executable.is_empty() {
                self.step(operation_id, "No valid tool calls found, skipping this round")
                    .await;
            } else {
                self.step(
                    operation_id,
                    &format!(
                        "Processing {} valid tool calls in round {}",
                        executable.len(),
                        round
                    ),
                )
                .await;
            }

            for call in &executable {
                self.step(operation_id, &format!("Using tool: {}", call.name)).await;
                self.step(
                    operation_id,
                    &format!(
                        "Calling {} with arguments: {}",
                        call.name,
                        Value::Object(call.arguments.clone())
                    ),
                )
                .await;
            }

            // All calls of one round run concurrently; results are matched
            // back by position.
            let outcomes = join_all(executable.iter().map(|call| self.registry.execute(call))).await;
            let mut outcomes = outcomes.into_iter();

            let mut result_msgs = Vec::with_capacity(planned.len());
            for plan in &planned {
                match plan {
                    PlannedCall::Execute(call) => {
                        let record = outcomes.next().unwrap_or_else(|| ToolRecord {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            outcome: crate::models::ToolOutcome::Error(format!(
                                "Error with {}: no result",
                                call.name
                            )),
                        });
                        // an attempted search spends budget even if it errors
                        if self.registry.is_search_tool(&call.name) {
                            budget.record_search();
                        }
                        if record.is_error() {
                            self.step(operation_id, record.text()).await;
                        }
                        result_msgs.push(ToolResultMsg {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            content: record.text().to_string(),
                            is_error: record.is_error(),
                        });
                        records.push(record);
                    }
                    PlannedCall::Skip { call, reason } => {
                        result_msgs.push(ToolResultMsg {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            content: reason.clone(),
                            is_error: true,
                        });
                    }
                }
            }

            conversation.push(Turn::tool_results(result_msgs));

            self.step(
                operation_id,
                &format!("Sending tool results to AI (round {})", round),
            )
            .await;
            match self.call_model(&mut conversation, &specs).await {
                Ok(next) => {
                    reply = next;
                    response_text = reply.text.clone();
                }
                Err(e) => {
                    self.step(operation_id, &format!("Error sending tool results: {}", e))
                        .await;
                    break;
                }
            }

            if round < MAX_ROUNDS - 1 && parse_require_more_tools_tag(&response_text) == Some(false)
            {
                self.step(
                    operation_id,
                    &format!("Model indicated no more tools needed after round {}", round),
                )
                .await;
                break;
            }

            response_text = clean_require_more_tools_tag(&response_text);
        }

        self.step(operation_id, "Generating final analysis").await;
        let candidate = clean_require_more_tools_tag(&response_text);

        let final_text = self
            .finalizer
            .finalize(
                self.store.as_ref(),
                operation_id,
                FinalizeInput {
                    conversation: &conversation,
                    candidate: &candidate,
                    message: &request.message,
                    system_prompt: &system_prompt,
                    tool_records: &records,
                },
            )
            .await;

        Ok(final_text)
    }

    /// Assemble the initial transcript: system prompt, market context,
    /// trailing chat history, then the user message with attachments.
    async fn prepare_conversation(
        &self,
        operation_id: Uuid,
        request: &AnalysisRequest,
        system_prompt: &str,
    ) -> Conversation {
        let mut conversation = Conversation::new();
        conversation.push(Turn::system(system_prompt));

        if let Some(context) = request.context.as_deref() {
            self.step(operation_id, "Processing market data").await;
            conversation.push(Turn::user(format!("Current market data:\n{}", context)));
        }

        if !request.chat_history.is_empty() {
            self.step(operation_id, "Processing chat history").await;
            let start = request.chat_history.len().saturating_sub(HISTORY_WINDOW);
            for turn in &request.chat_history[start..] {
                if turn.content.is_empty() {
                    continue;
                }
                conversation.push(match turn.role {
                    ChatRole::User => Turn::user(turn.content.clone()),
                    ChatRole::Assistant => Turn::model(&ModelReply {
                        text: turn.content.clone(),
                        tool_calls: Vec::new(),
                    }),
                });
            }
        }

        if !request.images.is_empty() {
            self.step(operation_id, "Processing images").await;
        }

        let content = if request.symbols.is_empty() {
            request.message.clone()
        } else {
            format!(
                "Regarding stocks: {}\n{}",
                request.symbols.join(", "),
                request.message
            )
        };
        conversation.push(Turn::user_with_images(content, request.images.clone()));

        conversation
    }

    /// One model round trip; the reply is appended to the transcript so
    /// both adapters always see a complete exchange.
    async fn call_model(
        &self,
        conversation: &mut Conversation,
        specs: &[ToolSpec],
    ) -> Result<ModelReply> {
        let reply = self
            .backend
            .send(conversation, specs, Sampling::Default)
            .await?;
        conversation.push(Turn::model(&reply));
        Ok(reply)
    }

    /// Validate requested calls and backfill missing arguments. A call
    /// with no recoverable symbol is skipped; unknown tools pass through
    /// and fail at execution with a structured error.
    async fn plan_calls(
        &self,
        operation_id: Uuid,
        calls: &[ToolCallRequest],
        request: &AnalysisRequest,
    ) -> Vec<PlannedCall> {
        let mut planned = Vec::with_capacity(calls.len());

        for call in calls {
            let mut call = call.clone();
            let Some(tool) = self.registry.get(&call.name) else {
                planned.push(PlannedCall::Execute(call));
                continue;
            };

            if let Some(key) = tool.symbol_param() {
                if !has_value(&call.arguments, key) {
                    if let Some(symbol) = request.symbols.first() {
                        call.arguments
                            .insert(key.to_string(), Value::String(symbol.clone()));
                        self.step(
                            operation_id,
                            &format!("Added missing symbol parameter ({}) to {}", symbol, call.name),
                        )
                        .await;
                    } else if let Some(symbol) =
                        policy::extract_potential_symbols(&request.message).into_iter().next()
                    {
                        self.step(
                            operation_id,
                            &format!("Extracted symbol {} from message for {}", symbol, call.name),
                        )
                        .await;
                        call.arguments.insert(key.to_string(), Value::String(symbol));
                    } else {
                        self.step(
                            operation_id,
                            &format!("Skipping {} call due to missing symbol parameter", call.name),
                        )
                        .await;
                        let reason =
                            format!("Error with {}: missing required symbol parameter", call.name);
                        planned.push(PlannedCall::Skip { call, reason });
                        continue;
                    }
                }
            }

            if let Some(key) = tool.query_param() {
                if !has_value(&call.arguments, key) {
                    let query = match (call.name.as_str(), request.symbols.first()) {
                        ("news_search", Some(symbol)) => format!("{} latest news", symbol),
                        _ => request.message.clone(),
                    };
                    call.arguments.insert(key.to_string(), Value::String(query));
                    self.step(
                        operation_id,
                        &format!("Added missing query parameter to {}", call.name),
                    )
                    .await;
                }
            }

            planned.push(PlannedCall::Execute(call));
        }

        planned
    }

    /// The model refused to search while the budget is unmet: ask for a
    /// bare query, run it directly, and feed the results back.
    #[allow(clippy::too_many_arguments)]
    async fn forced_search(
        &self,
        operation_id: Uuid,
        conversation: &mut Conversation,
        specs: &[ToolSpec],
        reply: &mut ModelReply,
        response_text: &mut String,
        budget: &mut SearchBudget,
        records: &mut Vec<ToolRecord>,
    ) {
        conversation.push(Turn::user(FORCED_SEARCH_PROMPT));

        let forced = match self.call_model(conversation, specs).await {
            Ok(forced) => forced,
            Err(e) => {
                self.step(
                    operation_id,
                    &format!("Error requesting additional web searches: {}", e),
                )
                .await;
                return;
            }
        };

        let Some(query) = parse_search_query(&forced.text) else {
            self.step(operation_id, "No valid search query found in response").await;
            *reply = forced;
            *response_text = reply.text.clone();
            return;
        };

        self.step(operation_id, &format!("Executing search query: {}", query)).await;

        let mut arguments = Map::new();
        arguments.insert("query".to_string(), Value::String(query.clone()));
        let record = self
            .registry
            .execute(&ToolCallRequest {
                id: None,
                name: FORCED_SEARCH_TOOL.to_string(),
                arguments,
            })
            .await;

        if record.is_error() {
            self.step(operation_id, &format!("Search failed: {}", record.text())).await;
            records.push(record);
            *reply = forced;
            *response_text = reply.text.clone();
            return;
        }

        self.step(operation_id, "Sending search results to AI").await;
        budget.record_search();
        conversation.push(Turn::user(format!(
            "Search Results for '{}':\n\n{}\n\nPlease analyze these results and continue with your response.",
            query,
            record.text()
        )));
        records.push(record);

        match self.call_model(conversation, specs).await {
            Ok(next) => {
                *reply = next;
                *response_text = reply.text.clone();
            }
            Err(e) => {
                self.step(
                    operation_id,
                    &format!("Error requesting additional web searches: {}", e),
                )
                .await;
                *reply = forced;
                *response_text = reply.text.clone();
            }
        }
    }

    /// Progress recording must never take the operation down.
    async fn step(&self, operation_id: Uuid, description: &str) {
        if let Err(e) = self.store.update_step(operation_id, description).await {
            warn!(operation_id = %operation_id, "Failed to record step: {}", e);
        }
    }
}

fn has_value(arguments: &Map<String, Value>, key: &str) -> bool {
    match arguments.get(key) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::error::EngineError;
    use crate::models::OperationStatus;
    use crate::signals::DISCLAIMER;
    use crate::tools::Tool;
    use crate::tracker::InMemoryOperationStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct StubTool {
        name: &'static str,
        is_search: bool,
        symbol_param: Option<&'static str>,
        query_param: Option<&'static str>,
        response: String,
        fail: bool,
        seen: Mutex<Vec<Map<String, Value>>>,
    }

    impl StubTool {
        fn new(name: &'static str, response: &str) -> Self {
            Self {
                name,
                is_search: false,
                symbol_param: None,
                query_param: None,
                response: response.to_string(),
                fail: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &'static str {
            self.name
        }
        fn description(&self) -> &'static str {
            "stub"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn required(&self) -> &'static [&'static str] {
            &[]
        }
        fn is_search(&self) -> bool {
            self.is_search
        }
        fn symbol_param(&self) -> Option<&'static str> {
            self.symbol_param
        }
        fn query_param(&self) -> Option<&'static str> {
            self.query_param
        }
        async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
            self.seen.lock().unwrap().push(args.clone());
            if self.fail {
                return Err(EngineError::ToolError("provider unavailable".to_string()));
            }
            Ok(self.response.clone())
        }
    }

    fn engine_with(
        replies: Vec<Result<ModelReply>>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> (Arc<AnalysisEngine>, Arc<ScriptedBackend>, Arc<InMemoryOperationStore>) {
        let backend = Arc::new(ScriptedBackend::new(replies));
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let store = Arc::new(InMemoryOperationStore::new());
        let engine = Arc::new(AnalysisEngine::new(
            Arc::clone(&backend) as Arc<dyn BackendAdapter>,
            Arc::new(registry),
            Arc::clone(&store) as Arc<dyn OperationStore>,
            EngineConfig::default(),
        ));
        (engine, backend, store)
    }

    fn tool_call(name: &str, arguments: Value) -> ToolCallRequest {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ToolCallRequest {
            id: None,
            name: name.to_string(),
            arguments,
        }
    }

    async fn step_descriptions(store: &InMemoryOperationStore, id: Uuid) -> Vec<String> {
        store
            .get(id)
            .await
            .unwrap()
            .unwrap()
            .steps
            .into_iter()
            .map(|s| s.description)
            .collect()
    }

    #[tokio::test]
    async fn answer_without_tools_warns_and_completes() {
        let (engine, backend, store) = engine_with(
            vec![
                ScriptedBackend::text_reply(
                    "NVDA closed higher today.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply(
                    "NVDA closed higher today on strong data-center demand.",
                ),
            ],
            vec![],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("Tell me about this stock.");
        request.symbols = vec!["NVDA".to_string()];

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("NVDA closed higher today on strong data-center demand."));
        assert!(text.contains(DISCLAIMER.trim()));
        // one loop call plus the finalizer call
        assert_eq!(backend.calls_served(), 2);

        let steps = step_descriptions(&store, id).await;
        assert!(steps
            .iter()
            .any(|s| s == "WARNING: No tools were used to process this request"));
        let operation = store.get(id).await.unwrap().unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn tool_round_executes_and_reports() {
        let echo: Arc<StubTool> = Arc::new(StubTool::new("echo", "echoed data"));
        let (engine, backend, store) = engine_with(
            vec![
                ScriptedBackend::tool_reply(vec![tool_call("echo", json!({}))]),
                ScriptedBackend::text_reply(
                    "Done analyzing.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply("Here is the complete analysis of the echoed data."),
            ],
            vec![Arc::clone(&echo) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("Analyze this.");
        request.symbols = vec!["AAPL".to_string()];

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("Here is the complete analysis"));
        assert_eq!(backend.calls_served(), 3);
        assert_eq!(echo.seen.lock().unwrap().len(), 1);

        let steps = step_descriptions(&store, id).await;
        assert!(steps.iter().any(|s| s == "Processing 1 valid tool calls in round 1"));
        assert!(steps.iter().any(|s| s == "Using tool: echo"));
        assert!(steps
            .iter()
            .any(|s| s == "Model indicated no more tools needed after round 1"));
    }

    #[tokio::test]
    async fn unmet_search_budget_forces_a_search() {
        let search: Arc<StubTool> = Arc::new({
            let mut t = StubTool::new("web_search", "Title: market recap\nURL: x");
            t.is_search = true;
            t.query_param = Some("query");
            t
        });
        let (engine, backend, store) = engine_with(
            vec![
                // refuses to call tools
                ScriptedBackend::text_reply("Markets were mixed."),
                // answers the forced-search prompt
                ScriptedBackend::text_reply("<search>market overview today</search>"),
                // reacts to the injected search results
                ScriptedBackend::text_reply(
                    "Markets were mixed.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply(
                    "Markets were mixed today with tech leading the losses.",
                ),
            ],
            vec![Arc::clone(&search) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        // statement, no symbols: policy requires one search
        let request = AnalysisRequest::from_message("Tell me about the market today.");

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("Markets were mixed today"));
        assert_eq!(backend.calls_served(), 4);

        let queries = search.seen.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].get("query").unwrap(), "market overview today");

        let steps = step_descriptions(&store, id).await;
        assert!(steps.iter().any(|s| s == "Enforcing minimum web searches (0/1)"));
        assert!(steps.iter().any(|s| s == "Executing search query: market overview today"));
    }

    #[tokio::test]
    async fn failed_search_still_counts_toward_minimum() {
        let search: Arc<StubTool> = Arc::new({
            let mut t = StubTool::new("web_search", "");
            t.is_search = true;
            t.query_param = Some("query");
            t.fail = true;
            t
        });
        let (engine, backend, store) = engine_with(
            vec![
                ScriptedBackend::tool_reply(vec![tool_call(
                    "web_search",
                    json!({"query": "market overview"}),
                )]),
                // no tag, no calls: the loop should finish here, not
                // demand another search because the first one errored
                ScriptedBackend::text_reply("Markets were mixed."),
                ScriptedBackend::text_reply(
                    "Markets were mixed today with tech leading the losses.",
                ),
            ],
            vec![Arc::clone(&search) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        // statement, no symbols: policy requires one search
        let request = AnalysisRequest::from_message("Tell me about the market today.");

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("Markets were mixed today"));
        assert_eq!(backend.calls_served(), 3);
        assert_eq!(search.seen.lock().unwrap().len(), 1);

        let steps = step_descriptions(&store, id).await;
        assert!(!steps.iter().any(|s| s.starts_with("Enforcing minimum web searches")));
        assert!(steps
            .iter()
            .any(|s| s == "No explicit tool request found, proceeding with final response"));
    }

    #[tokio::test]
    async fn missing_symbol_is_backfilled_from_request() {
        let earnings: Arc<StubTool> = Arc::new({
            let mut t = StubTool::new("get_earnings", "Quarterly Earnings for TSLA:");
            t.symbol_param = Some("symbol");
            t
        });
        let (engine, _, store) = engine_with(
            vec![
                ScriptedBackend::tool_reply(vec![tool_call("get_earnings", json!({}))]),
                ScriptedBackend::text_reply(
                    "Earnings look strong.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply("Tesla's earnings came in ahead of expectations."),
            ],
            vec![Arc::clone(&earnings) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("How were the earnings?");
        request.symbols = vec!["TSLA".to_string()];

        engine.run(id, request).await.unwrap();

        let seen = earnings.seen.lock().unwrap();
        assert_eq!(seen[0].get("symbol").unwrap(), "TSLA");

        let steps = step_descriptions(&store, id).await;
        assert!(steps
            .iter()
            .any(|s| s == "Added missing symbol parameter (TSLA) to get_earnings"));
    }

    #[tokio::test]
    async fn unrecoverable_symbol_skips_the_call() {
        let earnings: Arc<StubTool> = Arc::new({
            let mut t = StubTool::new("get_earnings", "unused");
            t.symbol_param = Some("symbol");
            t
        });
        let (engine, _, store) = engine_with(
            vec![
                ScriptedBackend::tool_reply(vec![tool_call("get_earnings", json!({}))]),
                ScriptedBackend::text_reply(
                    "Cannot fetch earnings.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply(
                    "I could not retrieve earnings without a ticker symbol.",
                ),
            ],
            vec![Arc::clone(&earnings) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        // no symbols anywhere in the message
        let request = AnalysisRequest::from_message("how were the earnings?");

        engine.run(id, request).await.unwrap();
        assert!(earnings.seen.lock().unwrap().is_empty());

        let steps = step_descriptions(&store, id).await;
        assert!(steps
            .iter()
            .any(|s| s == "Skipping get_earnings call due to missing symbol parameter"));
        assert!(steps.iter().any(|s| s == "No valid tool calls found, skipping this round"));
    }

    #[tokio::test]
    async fn first_call_failure_fails_the_operation() {
        let (engine, _, store) = engine_with(vec![Err(EngineError::EmptyModelResponse)], vec![]);

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("anything at all");
        request.symbols = vec!["AAPL".to_string()];

        let result = engine.run(id, request).await;
        assert!(result.is_err());

        let operation = store.get(id).await.unwrap().unwrap();
        assert_eq!(operation.status, OperationStatus::Failed);
        assert_eq!(operation.error.as_deref(), Some("No response generated"));
    }

    #[tokio::test]
    async fn explicit_more_tools_tag_triggers_another_round() {
        let echo: Arc<StubTool> = Arc::new(StubTool::new("echo", "fresh data"));
        let (engine, backend, store) = engine_with(
            vec![
                ScriptedBackend::text_reply(
                    "I need more data.<require_more_tools>true</require_more_tools>",
                ),
                ScriptedBackend::tool_reply(vec![tool_call("echo", json!({}))]),
                ScriptedBackend::text_reply(
                    "Now I have it.<require_more_tools>false</require_more_tools>",
                ),
                ScriptedBackend::text_reply("With the fresh data, here is the full picture."),
            ],
            vec![Arc::clone(&echo) as Arc<dyn Tool>],
        );

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("Give me the full picture.");
        request.symbols = vec!["MSFT".to_string()];

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("With the fresh data"));
        assert_eq!(backend.calls_served(), 4);
        assert_eq!(echo.seen.lock().unwrap().len(), 1);

        let steps = step_descriptions(&store, id).await;
        assert!(steps.iter().any(|s| s == "Explicitly requesting more tools"));
    }

    #[tokio::test]
    async fn round_cap_bounds_the_loop() {
        let echo: Arc<StubTool> = Arc::new(StubTool::new("echo", "data"));
        // the model asks for a tool on every single reply
        let mut replies = Vec::new();
        for _ in 0..=MAX_ROUNDS {
            replies.push(ScriptedBackend::tool_reply(vec![tool_call("echo", json!({}))]));
        }
        replies.push(ScriptedBackend::text_reply(
            "Final answer assembled from the repeated tool output.",
        ));
        let (engine, backend, _) = engine_with(replies, vec![Arc::clone(&echo) as Arc<dyn Tool>]);

        let id = engine.begin(Uuid::new_v4()).await.unwrap();
        let mut request = AnalysisRequest::from_message("Keep digging.");
        request.symbols = vec!["AAPL".to_string()];

        let text = engine.run(id, request).await.unwrap();
        assert!(text.starts_with("Final answer assembled"));
        assert_eq!(echo.seen.lock().unwrap().len(), MAX_ROUNDS);
        // initial call, one per round, then the finalizer
        assert_eq!(backend.calls_served(), MAX_ROUNDS + 2);
    }

    #[tokio::test]
    async fn unknown_operation_id_is_rejected() {
        let (engine, _, _) = engine_with(vec![], vec![]);
        let result = engine
            .run(Uuid::new_v4(), AnalysisRequest::from_message("hello"))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidOperation(_))));
    }

    #[test]
    fn has_value_treats_blank_strings_as_missing() {
        let mut args = Map::new();
        assert!(!has_value(&args, "symbol"));
        args.insert("symbol".to_string(), Value::String("  ".to_string()));
        assert!(!has_value(&args, "symbol"));
        args.insert("symbol".to_string(), Value::String("AAPL".to_string()));
        assert!(has_value(&args, "symbol"));
    }
}
