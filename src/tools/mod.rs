//! Tool trait and registry
//!
//! Tools are single-attempt, fire-and-forget network operations. Execution
//! failures are converted into structured error records and fed back to the
//! model; they never abort the engine.

mod market;
mod search;
mod webpage;

pub use market::{CheckMarketHoursTool, ConvertCurrencyTool, GetEarningsTool};
pub use search::{NewsSearchTool, WebSearchTool};
pub use webpage::FetchWebpageTool;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ToolCallRequest, ToolOutcome, ToolRecord};
use crate::Result;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema for the argument object, as advertised to the model.
    fn parameters(&self) -> Value;
    /// Parameter names that must be present before execution.
    fn required(&self) -> &'static [&'static str];
    /// Search-class tools count against the per-operation search budget.
    fn is_search(&self) -> bool {
        false
    }
    /// Name of the ticker-symbol parameter, if the tool has one. Used by
    /// the engine's argument backfill.
    fn symbol_param(&self) -> Option<&'static str> {
        None
    }
    /// Name of the free-text query parameter, if the tool has one.
    fn query_param(&self) -> Option<&'static str> {
        None
    }
    async fn execute(&self, args: &Map<String, Value>) -> Result<String>;
}

/// Serializable tool contract handed to the backend adapters.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Contracts for every registered tool, for the model's tool catalog.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Whether the named tool counts as a search for budget purposes.
    pub fn is_search_tool(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.is_search()).unwrap_or(false)
    }

    /// Execute one call. Unknown tools, missing required parameters, and
    /// execution failures become structured error records, never engine
    /// errors.
    pub async fn execute(&self, call: &ToolCallRequest) -> ToolRecord {
        let outcome = match self.tools.get(&call.name) {
            Some(tool) => match tool
                .required()
                .iter()
                .find(|p| !call.arguments.contains_key(**p))
            {
                Some(param) => {
                    warn!(tool = %call.name, param, "Missing required parameter");
                    ToolOutcome::Error(format!(
                        "Error with {}: missing required parameter: {}",
                        call.name, param
                    ))
                }
                None => match tool.execute(&call.arguments).await {
                    Ok(result) => ToolOutcome::Result(result),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool execution failed");
                        ToolOutcome::Error(format!("Error with {}: {}", call.name, e))
                    }
                },
            },
            None => {
                warn!(tool = %call.name, "Unknown tool requested");
                ToolOutcome::Error(EngineError::ToolNotFound(call.name.clone()).to_string())
            }
        };

        ToolRecord {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            outcome,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared pooled HTTP client for all network-backed tools.
fn build_tool_client(timeout: Duration) -> Client {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(timeout)
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .build()
        .unwrap_or_default()
}

/// Build the default registry with every production tool.
pub fn create_default_registry(config: &EngineConfig) -> ToolRegistry {
    let client = build_tool_client(config.http_timeout);

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(WebSearchTool::new(client.clone())));
    registry.register(Arc::new(NewsSearchTool::new(client.clone())));
    registry.register(Arc::new(FetchWebpageTool::new(client.clone())));
    registry.register(Arc::new(ConvertCurrencyTool::new(client.clone())));
    registry.register(Arc::new(CheckMarketHoursTool));
    registry.register(Arc::new(GetEarningsTool::new(
        client,
        config.alpha_vantage_key.clone(),
    )));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "Echo the query back"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}})
        }
        fn required(&self) -> &'static [&'static str] {
            &["query"]
        }
        async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
            Ok(args
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        }
    }

    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn description(&self) -> &'static str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn required(&self) -> &'static [&'static str] {
            &[]
        }
        async fn execute(&self, _args: &Map<String, Value>) -> Result<String> {
            Err(EngineError::ToolError("provider outage".to_string()))
        }
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: None,
            name: name.to_string(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_error() {
        let registry = ToolRegistry::new();
        let record = registry
            .execute(&call("nonexistent_tool", serde_json::json!({})))
            .await;
        assert!(record.is_error());
        assert_eq!(record.text(), "Unknown tool: nonexistent_tool");
    }

    #[tokio::test]
    async fn execution_failure_is_a_structured_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));

        let record = registry.execute(&call("broken", serde_json::json!({}))).await;
        assert!(record.is_error());
        assert!(record.text().contains("provider outage"));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_rejected_before_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let record = registry.execute(&call("echo", serde_json::json!({}))).await;
        assert!(record.is_error());
        assert_eq!(
            record.text(),
            "Error with echo: missing required parameter: query"
        );
    }

    #[tokio::test]
    async fn successful_execution_carries_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let record = registry
            .execute(&call("echo", serde_json::json!({"query": "AAPL"})))
            .await;
        assert!(!record.is_error());
        assert_eq!(record.text(), "AAPL");
    }
}
