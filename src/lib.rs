//! StockAssist Engine
//!
//! A bounded tool-calling orchestration engine for financial analysis:
//! - Repeatedly calls an LLM backend, executing the tools it requests
//! - Enforces a minimum number of web searches for time-sensitive questions
//! - Backfills missing tool arguments from request symbols or the message
//! - Tracks per-operation progress in a pluggable store
//! - Finalizes every answer with layered fallbacks and a disclaimer
//!
//! LOOP:
//! PREPARE → MODEL CALL → (TOOLS → RESULTS → MODEL CALL)* → FINALIZE

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod models;
pub mod policy;
pub mod prompt;
pub mod signals;
pub mod tools;
pub mod tracker;

pub use error::Result;

// Re-export common types
pub use config::EngineConfig;
pub use engine::{AnalysisEngine, AnalysisRequest, MAX_ROUNDS};
pub use models::*;
