//! Crate-wide error hierarchy for the review pipeline.
//!
//! Goals:
//! - Single root `Error` for all public functions.
//! - Taxonomy matches the run's exit semantics: configuration, trust,
//!   budget, agent, forge, parse, validation.
//! - Forge-aware HTTP mapping (401→Unauthorized, 429→RateLimited, 5xx→Server).
//! - No dynamic dispatch, ergonomic `?` via `From` impls.

use thiserror::Error;

/// Convenient alias for crate-wide results.
pub type PrResult<T> = Result<T, Error>;

/// Root error type for the review pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration problems: bad schema values, provider resolution,
    /// legacy env vars, model/provider mismatch.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Trust boundary: fork PR blocked, draft PR, missing PR context.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// A budget cap would be exceeded.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// Agent-local failure that escalated (required pass).
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Forge (GitHub/Azure DevOps) API failure.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// Diff/path parsing failure.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The run was cancelled from outside.
    #[error("run cancelled")]
    Cancelled,

    /// Input validation errors that fit no other bucket.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Configuration and preflight errors. Fatal; the run exits before agents.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Provider resolution failed (legacy vars, ambiguity, missing keys...).
    #[error(transparent)]
    Provider(#[from] llm_providers::ResolveError),

    /// A config value failed semantic validation after deserialization.
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// A required pass references an agent the registry does not know.
    #[error("required pass '{pass}' references unknown agent '{agent}'")]
    UnknownAgentInRequiredPass { pass: String, agent: String },

    /// Forge context could not be established from the CI environment.
    #[error("forge context error: {0}")]
    ForgeContext(String),
}

/// Trust decisions that stop or restrict a run. Logged and usually non-fatal.
#[derive(Debug, Clone, Error)]
pub enum TrustError {
    #[error("fork pull request blocked (source '{source_repo}' != target '{target}'); set trusted_only=false to opt in")]
    ForkBlocked { source_repo: String, target: String },

    #[error("draft pull request; review skipped")]
    DraftSkipped,

    #[error("no pull request in context")]
    NotAPullRequest,
}

/// Budget caps. Per-agent skips use the reason string; a strict-mode run
/// surfaces the error itself.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("per-PR budget exceeded: estimated ${estimated:.4} over remaining ${remaining:.4}")]
    PerPrExceeded { estimated: f64, remaining: f64 },

    #[error("monthly budget exceeded: estimated ${estimated:.4} over remaining ${remaining:.4}")]
    MonthlyExceeded { estimated: f64, remaining: f64 },
}

/// Agent-local failures. Only fatal when the owning pass is required.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("timeout")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("agent exited with status {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    #[error("agent produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("required pass '{pass}' failed at agent '{agent}': {error}")]
    RequiredPassFailed {
        pass: String,
        agent: String,
        error: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Llm(#[from] llm_providers::LlmError),
}

/// Forge transport/API failures with HTTP-status mapping.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("forge unauthorized")]
    Unauthorized,

    #[error("forge forbidden")]
    Forbidden,

    #[error("forge not found")]
    NotFound,

    #[error("forge rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("forge server error: status {0}")]
    Server(u16),

    #[error("forge http status error: {0}")]
    HttpStatus(u16),

    #[error("forge timeout")]
    Timeout,

    #[error("forge network error: {0}")]
    Network(String),

    #[error("forge serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("forge invalid response: {0}")]
    InvalidResponse(String),
}

impl ForgeError {
    /// Transient failures worth a bounded retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::RateLimited { .. }
                | ForgeError::Server(_)
                | ForgeError::Timeout
                | ForgeError::Network(_)
        )
    }
}

/// Path canonicalization and unified diff parsing failures.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid hunk header: {0}")]
    InvalidHunkHeader(String),
}

// ===== Conversions for `?` ergonomics =====

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Forge(ForgeError::from(e))
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ForgeError::Timeout;
        }
        if let Some(status) = e.status() {
            let code = status.as_u16();
            return match code {
                401 => ForgeError::Unauthorized,
                403 => ForgeError::Forbidden,
                404 => ForgeError::NotFound,
                429 => ForgeError::RateLimited {
                    retry_after_secs: None,
                },
                500..=599 => ForgeError::Server(code),
                _ => ForgeError::HttpStatus(code),
            };
        }
        ForgeError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Forge(ForgeError::Serde(e))
    }
}
