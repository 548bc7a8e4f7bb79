//! Forge facade: provider-neutral types plus enum-dispatch clients.
//!
//! Exactly two bindings exist (GitHub, Azure DevOps); both expose the same
//! narrow surface the reporter needs: a build status lifecycle, summary
//! comment find/update/create, inline comments with marker-carrying bodies,
//! and body updates for resolution. No async-trait, no boxed futures.

pub mod ado;
pub mod github;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ForgeError;

/// Bounded retry policy for transient forge failures.
const MAX_FORGE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Supported forges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeKind {
    GitHub,
    Ado,
}

impl ForgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForgeKind::GitHub => "github",
            ForgeKind::Ado => "ado",
        }
    }
}

/// GitHub run coordinates.
#[derive(Debug, Clone)]
pub struct GitHubContext {
    pub owner: String,
    pub repo: String,
    pub pr_number: Option<u64>,
    pub head_sha: String,
    pub token: String,
}

/// Azure DevOps run coordinates.
#[derive(Debug, Clone)]
pub struct AdoContext {
    /// Collection URL, e.g. "https://dev.azure.com/org".
    pub collection_url: String,
    pub project: String,
    pub repository: String,
    pub pr_number: Option<u64>,
    pub head_sha: String,
    pub token: String,
}

/// Where this run is reporting to. The token lives here and nowhere else;
/// agent environments are built from an allowlist that never includes it.
#[derive(Debug, Clone)]
pub enum ForgeContext {
    GitHub(GitHubContext),
    Ado(AdoContext),
}

impl ForgeContext {
    pub fn kind(&self) -> ForgeKind {
        match self {
            ForgeContext::GitHub(_) => ForgeKind::GitHub,
            ForgeContext::Ado(_) => ForgeKind::Ado,
        }
    }

    pub fn pr_number(&self) -> Option<u64> {
        match self {
            ForgeContext::GitHub(c) => c.pr_number,
            ForgeContext::Ado(c) => c.pr_number,
        }
    }

    pub fn head_sha(&self) -> &str {
        match self {
            ForgeContext::GitHub(c) => &c.head_sha,
            ForgeContext::Ado(c) => &c.head_sha,
        }
    }
}

/// PR metadata needed for trust decisions and reporting.
#[derive(Debug, Clone, Default)]
pub struct PrMeta {
    pub title: String,
    pub draft: bool,
    /// "owner/repo" (GitHub) or repository URI (ADO) of the source side.
    pub source_repo: Option<String>,
    pub target_repo: Option<String>,
    pub head_sha: Option<String>,
}

/// Handle to the in-progress status created at orchestration start.
#[derive(Debug, Clone, Copy)]
pub struct CheckHandle {
    /// GitHub check-run id; ADO statuses are keyed by context name instead.
    pub id: Option<u64>,
}

/// Terminal check state chosen by gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
}

impl CheckConclusion {
    pub fn as_github_str(&self) -> &'static str {
        match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
            CheckConclusion::Neutral => "neutral",
        }
    }
}

/// GitHub check-run annotation (inline marker in the Checks tab).
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub annotation_level: &'static str,
    pub message: String,
}

/// Annotations per check-run request are capped by the GitHub API.
pub const MAX_CHECK_ANNOTATIONS: usize = 50;

/// An already-posted comment, normalized across forges.
///
/// `id` is forge-shaped: a numeric comment id on GitHub,
/// `"<threadId>/<commentId>"` on Azure DevOps.
#[derive(Debug, Clone)]
pub struct ExistingComment {
    pub id: String,
    pub body: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Marker payloads extracted from the body (possibly malformed).
    pub markers: Vec<String>,
}

/// One inline comment ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineComment {
    pub file: String,
    pub line: u32,
    pub end_line: Option<u32>,
    pub body: String,
}

/// Concrete forge client (enum-dispatch).
pub enum ForgeClient {
    GitHub(github::GitHubForge),
    Ado(ado::AdoForge),
}

impl ForgeClient {
    pub fn from_context(ctx: &ForgeContext) -> Result<Self, ForgeError> {
        let http = reqwest::Client::builder()
            .user_agent("pr-ai-review/0.1")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ForgeError::from)?;
        Ok(match ctx {
            ForgeContext::GitHub(c) => Self::GitHub(github::GitHubForge::new(http, c.clone())?),
            ForgeContext::Ado(c) => Self::Ado(ado::AdoForge::new(http, c.clone())?),
        })
    }

    pub async fn fetch_pr_meta(&self) -> Result<PrMeta, ForgeError> {
        match self {
            Self::GitHub(c) => c.fetch_pr_meta().await,
            Self::Ado(c) => c.fetch_pr_meta().await,
        }
    }

    /// Create the in-progress status. Callers treat failures as non-fatal.
    pub async fn start_check(&self, title: &str) -> Result<CheckHandle, ForgeError> {
        match self {
            Self::GitHub(c) => c.start_check(title).await,
            Self::Ado(c) => c.start_status(title).await,
        }
    }

    /// Transition to completed. With no handle the binding falls back to a
    /// create-on-complete path.
    pub async fn complete_check(
        &self,
        handle: Option<&CheckHandle>,
        conclusion: CheckConclusion,
        title: &str,
        summary: &str,
        annotations: &[Annotation],
    ) -> Result<(), ForgeError> {
        match self {
            Self::GitHub(c) => {
                c.complete_check(handle, conclusion, title, summary, annotations)
                    .await
            }
            Self::Ado(c) => c.complete_status(conclusion, title).await,
        }
    }

    /// Find the bot-owned summary comment by its distinctive header line.
    pub async fn find_summary_comment(
        &self,
        header: &str,
    ) -> Result<Option<ExistingComment>, ForgeError> {
        match self {
            Self::GitHub(c) => c.find_summary_comment(header).await,
            Self::Ado(c) => c.find_summary_thread(header).await,
        }
    }

    pub async fn create_summary_comment(&self, body: &str) -> Result<(), ForgeError> {
        match self {
            Self::GitHub(c) => c.create_summary_comment(body).await,
            Self::Ado(c) => c.create_summary_thread(body).await,
        }
    }

    pub async fn update_comment(&self, id: &str, body: &str) -> Result<(), ForgeError> {
        match self {
            Self::GitHub(c) => c.update_comment(id, body).await,
            Self::Ado(c) => c.update_comment(id, body).await,
        }
    }

    /// All existing inline comments (review comments / threads with file
    /// context), markers pre-extracted.
    pub async fn list_inline_comments(&self) -> Result<Vec<ExistingComment>, ForgeError> {
        match self {
            Self::GitHub(c) => c.list_inline_comments().await,
            Self::Ado(c) => c.list_inline_threads().await,
        }
    }

    pub async fn post_inline(&self, comment: &InlineComment) -> Result<(), ForgeError> {
        match self {
            Self::GitHub(c) => c.post_inline(comment).await,
            Self::Ado(c) => c.post_inline(comment).await,
        }
    }
}

/// Run `op` with bounded exponential backoff on transient failures
/// (rate limits, 5xx, connection errors).
pub(crate) async fn with_retries<T, Fut, F>(what: &str, mut op: F) -> Result<T, ForgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ForgeError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_FORGE_RETRIES && e.is_retryable() => {
                let delay = retry_delay(attempt, &e);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "forge: transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(what, attempt, error = %e, "forge: giving up");
                return Err(e);
            }
        }
    }
}

fn retry_delay(attempt: u32, error: &ForgeError) -> Duration {
    if let ForgeError::RateLimited {
        retry_after_secs: Some(secs),
    } = error
    {
        return Duration::from_secs(*secs);
    }
    Duration::from_millis(RETRY_BASE_DELAY_MS << attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially() {
        let e = ForgeError::Server(502);
        assert_eq!(retry_delay(0, &e), Duration::from_millis(500));
        assert_eq!(retry_delay(1, &e), Duration::from_millis(1000));
        assert_eq!(retry_delay(2, &e), Duration::from_millis(2000));
    }

    #[test]
    fn retry_delay_honors_retry_after() {
        let e = ForgeError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(retry_delay(0, &e), Duration::from_secs(7));
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(ForgeError::Timeout.is_retryable());
        assert!(ForgeError::Server(500).is_retryable());
        assert!(
            ForgeError::RateLimited {
                retry_after_secs: None
            }
            .is_retryable()
        );
        assert!(!ForgeError::Unauthorized.is_retryable());
        assert!(!ForgeError::NotFound.is_retryable());
    }
}
