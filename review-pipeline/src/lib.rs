//! Public entry for the review pipeline.
//!
//! Single high-level function to run the whole review for one change:
//!
//! 1) **Preflight** — config validation, provider/credential/model
//!    resolution, legacy env rejection, trust decision (fork/draft/push).
//! 2) **Status start** — the in-progress check/status is created before any
//!    agent runs; failures degrade to create-on-complete.
//! 3) **Orchestration** — ordered passes of ordered agents, sequentially,
//!    under budget, per-agent deadline, and a shared cancellation scope;
//!    partial failures feed the advisory pipeline.
//! 4) **Publication** — findings are canonicalized against the diff,
//!    deduplicated (exact + proximity), sorted, rendered, and posted with
//!    idempotent fingerprint markers; stale prior-run comments are resolved;
//!    the check completes with the gated conclusion.
//!
//! The pipeline uses `tracing` for step logging and avoids `async-trait`
//! and heap trait objects; provider and forge dispatch are enum-based.

pub mod agents;
pub mod config;
pub mod dedup;
pub mod diff;
pub mod errors;
pub mod findings;
pub mod forge;
pub mod orchestrator;
pub mod report;
pub mod resolution;
pub mod resolve;

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use errors::{Error, PrResult};
use forge::{CheckConclusion, PrMeta};
use orchestrator::preflight::{TrustDecision, run_preflight};
use orchestrator::{RunContext, budget};
use report::{PublishInput, PublishOutcome, Reporter};

/// Final run report handed back to the CLI layer.
#[derive(Debug, Default)]
pub struct ReviewRunReport {
    pub conclusion: Option<CheckConclusion>,
    pub publish: Option<PublishOutcome>,
    pub statuses: Vec<orchestrator::AgentStatus>,
    /// Set when trust checks skipped the run (fork, draft).
    pub skipped: Option<String>,
    pub cancelled: bool,
}

/// Run preflight, all passes, and publication for a single change.
///
/// # Errors
/// Fatal conditions only: configuration/preflight failures, a required pass
/// failing, or the check/status itself failing after retries. Everything
/// else is degraded and reported in the summary.
pub async fn run_review(ctx: RunContext, cancel: CancellationToken) -> PrResult<ReviewRunReport> {
    let t0 = Instant::now();

    debug!("pipeline: init reporter");
    let reporter = Reporter::new(&ctx.forge, ctx.config.clone(), ctx.dry_run)?;

    debug!("pipeline: fetch PR metadata");
    let pr_meta: Option<PrMeta> = if ctx.forge.pr_number().is_some() {
        match reporter.fetch_pr_meta().await {
            Ok(meta) => Some(meta),
            Err(e) => {
                // Per the trust rules a failed draft lookup must not block
                // the run; treat the PR as a plain non-draft one.
                warn!(error = %e, "pipeline: PR metadata fetch failed; assuming non-draft PR");
                Some(PrMeta::default())
            }
        }
    } else {
        None
    };

    debug!("pipeline: preflight");
    let preflight = run_preflight(&ctx.config, &ctx.env, ctx.forge.kind(), pr_meta.as_ref())?;

    if let TrustDecision::Skip { error } = &preflight.trust {
        info!(reason = %error, "pipeline: trust check skipped the run");
        let reason = error.to_string();
        let handle = reporter.start().await;
        reporter
            .complete_simple(
                handle,
                CheckConclusion::Neutral,
                "AI Review skipped",
                &format!("Review skipped: {reason}"),
            )
            .await?;
        return Ok(ReviewRunReport {
            conclusion: Some(CheckConclusion::Neutral),
            skipped: Some(reason),
            ..Default::default()
        });
    }

    debug!("pipeline: start in-progress status");
    let handle = reporter.start().await;

    // Budget state is owned here and mutated nowhere else.
    let month = budget::current_month();
    let monthly_spent = match &ctx.config.limits.ledger_path {
        Some(path) => budget::load_monthly_spent(path, &month).await,
        None => 0.0,
    };
    let mut budget_state = budget::BudgetState::new(&ctx.config.limits, monthly_spent);

    debug!("pipeline: run passes");
    let outcome = match orchestrator::run_passes(
        &ctx,
        preflight.provider.as_ref(),
        preflight.provider_skip_reason.as_deref(),
        &mut budget_state,
        &cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // The status must still be set on fatal orchestration errors.
            let _ = reporter
                .complete_simple(
                    handle,
                    CheckConclusion::Failure,
                    "AI Review failed",
                    &format!("Run aborted: {e}"),
                )
                .await;
            return Err(e);
        }
    };

    if outcome.spent_usd > 0.0 {
        if let Some(path) = &ctx.config.limits.ledger_path {
            budget::store_monthly_spent(path, &month, monthly_spent + outcome.spent_usd).await;
        }
    }

    debug!(
        findings = outcome.findings.len(),
        partials = outcome.partial_findings.len(),
        "pipeline: publish"
    );
    let cancelled = outcome.cancelled;
    let statuses = outcome.statuses.clone();
    let publish = reporter
        .publish(
            handle,
            PublishInput {
                findings: outcome.findings,
                partial_findings: outcome.partial_findings,
                diff_files: ctx.diff_files.clone(),
                statuses: outcome.statuses,
                cancelled,
            },
        )
        .await?;

    info!(
        conclusion = ?publish.conclusion,
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "pipeline: done"
    );

    if cancelled {
        // Partial results are published, but the run itself is a
        // cancellation for exit purposes.
        return Err(Error::Cancelled);
    }

    Ok(ReviewRunReport {
        conclusion: publish.conclusion,
        publish: Some(publish),
        statuses,
        skipped: None,
        cancelled,
    })
}

// -----------------------------------------------------------------------------
// Convenience re-exports for downstream users
// -----------------------------------------------------------------------------

pub use config::ReviewConfig;
pub use diff::{DiffFile, FileStatus, git::collect_changed_files};
pub use errors::Error as ReviewError;
pub use findings::{AgentResult, Finding, Severity};
pub use forge::{AdoContext, ForgeContext, ForgeKind, GitHubContext};
pub use orchestrator::{AgentState, AgentStatus, RunContext as ReviewRunContext};
