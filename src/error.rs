//! Error types for MailMaestro.

use std::time::Duration;

/// Top-level error type for the triage core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// A malformed or incomplete inbound email context.
///
/// Fatal for the email: nothing is audited and nothing is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Missing required context field: {0}")]
    MissingField(&'static str),

    #[error("Malformed context field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("Context is not valid JSON: {0}")]
    Json(String),
}

/// Violations of the tool-gateway protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A tool was called before its prerequisite step for the item.
    #[error("Tool '{tool}' called out of order for item {item_id}: {reason}")]
    Order {
        tool: String,
        item_id: String,
        reason: String,
    },

    /// A call outside the closed tool set, or an attempt to re-enter the orchestrator.
    #[error("Call '{name}' is outside the permitted tool set: {reason}")]
    Scope { name: String, reason: String },

    /// An immutable context field differs from the original.
    #[error("Context field '{field}' was altered before reaching tool '{tool}'")]
    ContextIntegrity { field: &'static str, tool: String },
}

/// Failures from the external extraction/validation function.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extractor {extractor} failed: {reason}")]
    Failed { extractor: String, reason: String },

    #[error("Extractor output could not be parsed: {0}")]
    InvalidOutput(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),
}

impl ExtractionError {
    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Timeout(_))
    }
}

/// Scheduling failures. All of these leave the identity key unrecorded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulingError {
    #[error("Scheduling backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Schedule store failed: {0}")]
    Store(String),

    #[error("Scheduling timed out after {0:?}")]
    Timeout(Duration),
}

impl SchedulingError {
    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Anything a gateway tool call can fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}

/// Database-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-level failures.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No pipeline registered for route {0}")]
    NoPipeline(String),

    #[error("Audit write failed: {0}")]
    Audit(#[from] DatabaseError),
}

/// Result type alias for the triage core.
pub type Result<T> = std::result::Result<T, Error>;
