//! Unified error types for LLM provider clients.
//!
//! Transport failures map onto a small set of variants (401/429/5xx/timeout)
//! so callers can classify retries without inspecting reqwest internals.

use thiserror::Error;

/// Convenient alias for client operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors produced by the thin provider clients.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Unauthorized (HTTP 401) — bad or expired API key.
    #[error("llm unauthorized")]
    Unauthorized,

    /// Rate limited (HTTP 429).
    #[error("llm rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Server-side failure (HTTP 5xx).
    #[error("llm server error: status {0}")]
    Server(u16),

    /// Any other unexpected HTTP status.
    #[error("llm http status error: {0}")]
    HttpStatus(u16),

    /// Transport-level timeout.
    #[error("llm timeout")]
    Timeout,

    /// Network failure without a status (DNS/connect/reset).
    #[error("llm network error: {0}")]
    Network(String),

    /// JSON (de)serialization failure.
    #[error("llm serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Response body did not have the expected shape.
    #[error("llm invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Transient failures that a bounded backoff may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Server(_) | LlmError::Timeout
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return LlmError::Timeout;
        }
        if let Some(status) = e.status() {
            let code = status.as_u16();
            return match code {
                401 => LlmError::Unauthorized,
                429 => LlmError::RateLimited {
                    retry_after_secs: None,
                },
                500..=599 => LlmError::Server(code),
                _ => LlmError::HttpStatus(code),
            };
        }
        LlmError::Network(e.to_string())
    }
}
