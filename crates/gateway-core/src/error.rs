//! Error Types

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error taxonomy
///
/// Tool-level and single-provider failures are recovered locally
/// (fallback or narrated failure); only exhaustion of all providers or
/// an auth failure surfaces as a turn-level error.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Provider returned an error response
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider call exceeded its timeout
    #[error("Provider '{0}' timed out")]
    ProviderTimeout(String),

    /// Provider unavailable or not responding (triggers fallback)
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Every candidate in the fallback chain failed
    #[error("All providers failed for model '{model}': {detail}")]
    AllProvidersFailed { model: String, detail: String },

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments failed schema validation (scoped to one call)
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    ToolInvalidArgument { tool: String, reason: String },

    /// Tool execution failed (scoped, narrated back to the model)
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Agent loop hit its round bound (non-fatal; partial text returned)
    #[error("Tool loop exhausted after {0} rounds")]
    LoopExhausted(usize),

    /// Transient persistence failure (retried, then surfaced as warning)
    #[error("Transient persistence error: {0}")]
    PersistenceTransient(String),

    /// Non-transient persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Missing or invalid bearer token (rejected before any provider call)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error (fatal at startup, not per-request)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Whether a bounded retry is worth attempting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout(_)
                | Self::ProviderUnavailable(_)
                | Self::PersistenceTransient(_)
                | Self::Io(_)
        )
    }

    /// Whether the error should advance the fallback chain
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout(_) | Self::ProviderUnavailable(_) | Self::Provider(_)
        )
    }

    /// Convert to a plain assistant-style message for the caller
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderTimeout(_) | Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::AllProvidersFailed { .. } => {
                "I couldn't reach any AI model to answer that. Please try again in a moment."
                    .into()
            }
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolInvalidArgument { tool, reason } => {
                format!("Invalid input for '{tool}': {reason}")
            }
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::LoopExhausted(_) => {
                "The request took too many steps to process. Please try a simpler query.".into()
            }
            Self::PersistenceTransient(_) | Self::Persistence(_) => {
                "Your message was answered but may not have been saved.".into()
            }
            Self::Unauthorized(_) => "Authentication required.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
