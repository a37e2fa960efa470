//! Error types for the fiscal pipeline orchestrator

use crate::models::Stage;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Stage / Pipeline Errors
    // =============================

    /// Raised inside a stage's own logic; converted to `task:failed`.
    #[error("Stage execution error: {0}")]
    StageExecution(String),

    /// A single external registry call failed. Captured per item.
    #[error("External lookup error for {identifier}: {message}")]
    ExternalLookup { identifier: String, message: String },

    #[error("Tool invocation error: {0}")]
    ToolInvocation(String),

    #[error("Malformed provider response at {step}: {detail}")]
    MalformedProviderResponse { step: &'static str, detail: String },

    #[error("Missing output of stage '{0}' in accumulated payload")]
    MissingStageOutput(Stage),

    #[error("Invalid step transition: {0}")]
    InvalidTransition(String),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
