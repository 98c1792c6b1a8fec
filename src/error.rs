//! Error types for the analysis engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Setup Errors (fatal for the operation)
    // =============================

    #[error("Invalid operation ID: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // Model Communication
    // =============================

    #[error("Model backend error: {0}")]
    BackendError(String),

    #[error("No response generated")]
    EmptyModelResponse,

    // =============================
    // Tools
    // =============================

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    // =============================
    // Persistence
    // =============================

    #[error("Operation store error: {0}")]
    StoreError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
