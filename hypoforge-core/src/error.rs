//! Error types for the Hypoforge pipeline core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering persistence, AI collaborator calls, configuration, and pipeline
//! state problems. `HypoforgeError` is what a step can fail with;
//! configuration problems surface before any step runs and have their own
//! type.

/// Top-level error type for the Hypoforge core library.
#[derive(Debug, thiserror::Error)]
pub enum HypoforgeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Errors from the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: i64 },

    #[error("Hypothesis not found: {id}")]
    HypothesisNotFound { id: i64 },

    #[error("Resource not found: {id}")]
    ResourceNotFound { id: i64 },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },
}

/// Errors from the AI collaborator (content generation and deep research).
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Deep research failed: {message}")]
    ResearchFailed { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration:\n  {}", .problems.join("\n  "))]
    Invalid { problems: Vec<String> },
}

/// Errors raised by phase handlers when persisted state is inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Run {run_id} has no research output to structure")]
    NoResearchOutput { run_id: i64 },

    #[error("No pending research handle on {owner}")]
    MissingHandle { owner: String },

    #[error("Step did not finish within {timeout_secs}s")]
    StepTimeout { timeout_secs: u64 },
}

/// A type alias for results using the top-level `HypoforgeError`.
pub type Result<T> = std::result::Result<T, HypoforgeError>;
