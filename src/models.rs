//! Core data models for the analysis engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// `current_step` is capped so it fits the tracker column; the full
/// description is still kept in the step history.
const MAX_STEP_LEN: usize = 190;

//
// ================= Operation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStep {
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// One tracked unit of orchestration work, from request to final answer.
///
/// Steps are append-only; terminal status (completed/failed) is set at most
/// once and never left again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OperationStatus,
    pub current_step: Option<String>,
    pub steps: Vec<OperationStep>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(id: Uuid, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            status: OperationStatus::Pending,
            current_step: None,
            steps: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed
        )
    }

    /// Append a progress step and update the current-step marker.
    pub fn record_step(&mut self, description: &str) {
        let truncated = if description.len() > MAX_STEP_LEN {
            let mut cut = MAX_STEP_LEN - 3;
            while !description.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &description[..cut])
        } else {
            description.to_string()
        };

        self.current_step = Some(truncated);
        self.steps.push(OperationStep {
            description: description.to_string(),
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Mark the operation completed. No-op once terminal.
    pub fn complete(&mut self, result: String) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Completed;
        self.result = Some(result);
        self.current_step = Some("Completed".to_string());
        self.updated_at = Utc::now();
    }

    /// Mark the operation failed. No-op once terminal.
    pub fn fail(&mut self, error: String) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Failed;
        self.error = Some(error);
        self.current_step = Some("Failed".to_string());
        self.updated_at = Utc::now();
    }
}

//
// ================= Chat history =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

//
// ================= Images =================
//

/// Raw attached image as supplied by the image store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
    pub name: Option<String>,
}

impl ImageData {
    /// Resolve the MIME type, preferring the filename extension over the
    /// supplied type, defaulting to JPEG when neither says otherwise.
    pub fn resolved_mime(&self) -> String {
        if let Some(name) = self.name.as_deref() {
            let lowered = name.to_lowercase();
            if lowered.ends_with(".png") {
                return "image/png".to_string();
            } else if lowered.ends_with(".jpg") || lowered.ends_with(".jpeg") {
                return "image/jpeg".to_string();
            } else if lowered.ends_with(".gif") {
                return "image/gif".to_string();
            } else if lowered.ends_with(".webp") {
                return "image/webp".to_string();
            }
        }
        self.mime_type
            .clone()
            .unwrap_or_else(|| "image/jpeg".to_string())
    }
}

//
// ================= Tool calls =================
//

/// One tool invocation requested by the model, arguments possibly incomplete.
/// `id` is only populated by protocols that correlate calls and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Result of one tool execution: exactly one of result/error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ToolOutcome {
    Result(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub outcome: ToolOutcome,
}

impl ToolRecord {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Result text on success, error text on failure.
    pub fn text(&self) -> &str {
        match &self.outcome {
            ToolOutcome::Result(s) => s,
            ToolOutcome::Error(s) => s,
        }
    }
}

//
// ================= Model reply =================
//

/// What one backend round trip produced: free text plus any tool calls,
/// aggregated across every candidate/choice the provider returned.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

//
// ================= Search budget =================
//

/// Policy-driven minimum of search-class tool invocations per operation.
#[derive(Debug, Clone, Copy)]
pub struct SearchBudget {
    pub required_minimum: u32,
    pub performed: u32,
}

impl SearchBudget {
    pub fn new(required_minimum: u32) -> Self {
        Self {
            required_minimum,
            performed: 0,
        }
    }

    pub fn record_search(&mut self) {
        self.performed += 1;
    }

    pub fn satisfied(&self) -> bool {
        self.performed >= self.required_minimum
    }
}
