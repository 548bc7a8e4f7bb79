//! Orchestrator: runs ordered passes of ordered agents, sequentially.
//!
//! Sequential by design: forge rate limits and LLM cost determinism
//! dominate, budget has a single mutator, and output ordering depends on
//! sequential accumulation. Per agent the lifecycle is
//! `Pending → Running → (Success | Failure | Skipped | Cached)`; terminal
//! states feed the reporter's status table.
//!
//! A failing agent never aborts the run unless its pass is required. Its
//! partial findings flow into the advisory pipeline instead.

pub mod budget;
pub mod cache;
pub mod envmap;
pub mod preflight;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentKind, build_agent_input, builtin_agent, local_llm, runtime};
use crate::config::ReviewConfig;
use crate::diff::{CanonicalDiff, DiffFile, canonicalize_files};
use crate::errors::{AgentError, Error, PrResult};
use crate::findings::{AgentResult, Finding, PartialFinding};
use crate::forge::ForgeContext;
use budget::BudgetState;
use llm_providers::ResolvedProvider;

/// Everything a run owns. The orchestrator has exclusive ownership of the
/// budget; agents see read-only slices of the rest.
pub struct RunContext {
    pub config: ReviewConfig,
    pub forge: ForgeContext,
    /// Environment snapshot taken once at startup.
    pub env: BTreeMap<String, String>,
    /// Raw changed files from the diff source.
    pub diff_files: Vec<DiffFile>,
    /// Agent result cache root; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    pub dry_run: bool,
}

/// Terminal agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Success,
    Failure,
    Skipped,
    Cached,
}

/// One row of the reporter's agent status table.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent: String,
    pub pass: String,
    pub state: AgentState,
    pub detail: Option<String>,
    pub findings: usize,
    pub elapsed_ms: u128,
}

/// Aggregate result of all passes.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub findings: Vec<Finding>,
    pub partial_findings: Vec<PartialFinding>,
    pub statuses: Vec<AgentStatus>,
    pub cancelled: bool,
    /// USD charged against the monthly ledger by this run.
    pub spent_usd: f64,
}

/// Run every enabled pass in order. Returns partial results on
/// cancellation; errors only on required-pass failures.
pub async fn run_passes(
    ctx: &RunContext,
    provider: Option<&ResolvedProvider>,
    provider_skip_reason: Option<&str>,
    budget: &mut BudgetState,
    cancel: &CancellationToken,
) -> PrResult<RunOutcome> {
    let mut outcome = RunOutcome::default();

    // Canonical view, path filters applied, once for all agents.
    let diff = filtered_diff(ctx)?;
    let agent_input = build_agent_input(
        &diff,
        &ctx.config.limits,
        ctx.forge.pr_number(),
        ctx.forge.head_sha(),
    );
    let input_json = serde_json::to_vec(&agent_input)?;
    let diff_chars = agent_input.diff.len() as u64;
    let config_hash = ctx.config.config_hash();

    'passes: for pass in ctx.config.passes.iter() {
        if !pass.enabled {
            debug!(pass = %pass.name, "orchestrator: pass disabled, skipping");
            continue;
        }

        // One estimate per pass; each LLM agent in it is checked against it.
        let estimate = budget::estimate_for_diff(diff_chars, provider);
        debug!(
            pass = %pass.name,
            est_tokens = estimate.tokens,
            est_usd = estimate.usd,
            "orchestrator: pass start"
        );

        for agent_id in &pass.agents {
            if cancel.is_cancelled() {
                info!("orchestrator: cancelled, returning partial results");
                outcome.cancelled = true;
                break 'passes;
            }

            let started = Instant::now();
            let record = |state: AgentState, detail: Option<String>, found: usize| {
                AgentStatus {
                    agent: agent_id.clone(),
                    pass: pass.name.clone(),
                    state,
                    detail,
                    findings: found,
                    elapsed_ms: started.elapsed().as_millis(),
                }
            };

            let Some(spec) = builtin_agent(agent_id) else {
                outcome
                    .statuses
                    .push(record(AgentState::Skipped, Some("unknown_agent".into()), 0));
                continue;
            };

            if spec.is_llm() && provider.is_none() {
                let detail = provider_skip_reason
                    .map(|r| format!("no_llm_provider: {r}"))
                    .unwrap_or_else(|| "no_llm_provider".into());
                outcome
                    .statuses
                    .push(record(AgentState::Skipped, Some(detail), 0));
                continue;
            }

            if spec.is_llm() {
                if let Err(e) = budget.check_llm(estimate) {
                    // A required pass cannot be satisfied without its LLM
                    // agents; that blocks the whole run (exit 2 territory).
                    if pass.required {
                        return Err(e.into());
                    }
                    info!(agent = %agent_id, error = %e, "orchestrator: budget skip");
                    outcome.statuses.push(record(
                        AgentState::Skipped,
                        Some(format!("budget_exceeded: {e}")),
                        0,
                    ));
                    continue;
                }
            }

            // Cache lookup replaces the invocation entirely.
            if let Some(cached) = try_cache_load(ctx, &config_hash, agent_id).await {
                let found = match &cached {
                    AgentResult::Success { findings } => findings.len(),
                    _ => 0,
                };
                apply_result(ctx, &config_hash, agent_id, &cached, &mut outcome, false).await;
                outcome
                    .statuses
                    .push(record(AgentState::Cached, None, found));
                continue;
            }

            debug!(agent = %agent_id, pass = %pass.name, "orchestrator: agent running");
            let agent_cancel = cancel.child_token();
            let timeout = Duration::from_secs(runtime::AGENT_TIMEOUT_SECS);

            let result = match (spec.kind, provider) {
                (AgentKind::BuiltinLlm, Some(provider)) => {
                    local_llm::run(provider, &agent_input, timeout, &agent_cancel).await
                }
                (AgentKind::BuiltinLlm, None) => AgentResult::Skipped {
                    // Unreachable past the provider gate above.
                    reason: "no_llm_provider".into(),
                },
                (AgentKind::Static | AgentKind::LlmCommand, _) => {
                    let env = envmap::build_agent_env(&ctx.env, spec);
                    runtime::run_command_agent(
                        spec,
                        input_json.clone(),
                        &env,
                        timeout,
                        &agent_cancel,
                    )
                    .await
                }
            };

            if spec.is_llm() && matches!(result, AgentResult::Success { .. }) {
                budget.charge(estimate);
                outcome.spent_usd += estimate.usd;
            }

            let status = match &result {
                AgentResult::Success { findings } => {
                    record(AgentState::Success, None, findings.len())
                }
                AgentResult::Failure { error, .. } => {
                    record(AgentState::Failure, Some(error.clone()), 0)
                }
                AgentResult::Skipped { reason } => {
                    record(AgentState::Skipped, Some(reason.clone()), 0)
                }
            };
            let failed_error = match &result {
                AgentResult::Failure { error, .. } => Some(error.clone()),
                _ => None,
            };

            apply_result(ctx, &config_hash, agent_id, &result, &mut outcome, true).await;
            outcome.statuses.push(status);

            if let Some(error) = failed_error {
                if pass.required {
                    warn!(pass = %pass.name, agent = %agent_id, "orchestrator: required pass failed");
                    return Err(Error::Agent(AgentError::RequiredPassFailed {
                        pass: pass.name.clone(),
                        agent: agent_id.clone(),
                        error,
                    }));
                }
            }
        }
    }

    info!(
        findings = outcome.findings.len(),
        partials = outcome.partial_findings.len(),
        agents = outcome.statuses.len(),
        cancelled = outcome.cancelled,
        "orchestrator: passes done"
    );
    Ok(outcome)
}

/// Fold one agent result into the outcome; optionally store to cache.
async fn apply_result(
    ctx: &RunContext,
    config_hash: &str,
    agent_id: &str,
    result: &AgentResult,
    outcome: &mut RunOutcome,
    store: bool,
) {
    match result {
        AgentResult::Success { findings } => {
            outcome.findings.extend(findings.iter().cloned());
            if store {
                if let (Some(root), Some(pr)) = (&ctx.cache_dir, ctx.forge.pr_number()) {
                    cache::store(
                        root,
                        pr,
                        ctx.forge.head_sha(),
                        config_hash,
                        agent_id,
                        result,
                    )
                    .await;
                }
            }
        }
        AgentResult::Failure {
            partial_findings, ..
        } => {
            outcome.partial_findings.extend(partial_findings.iter().cloned());
        }
        AgentResult::Skipped { .. } => {}
    }
}

async fn try_cache_load(
    ctx: &RunContext,
    config_hash: &str,
    agent_id: &str,
) -> Option<AgentResult> {
    let root = ctx.cache_dir.as_ref()?;
    let pr = ctx.forge.pr_number()?;
    cache::load(root, pr, ctx.forge.head_sha(), config_hash, agent_id).await
}

/// Canonicalize the raw diff and apply configured path filters.
fn filtered_diff(ctx: &RunContext) -> PrResult<CanonicalDiff> {
    let mut diff = canonicalize_files(ctx.diff_files.clone())?;
    let Some(filters) = &ctx.config.path_filters else {
        return Ok(diff);
    };

    let include = build_globset(&filters.include)?;
    let exclude = build_globset(&filters.exclude)?;
    let before = diff.files.len();
    diff.files.retain(|f| {
        let included = include
            .as_ref()
            .map(|set| set.is_match(&f.path))
            .unwrap_or(true);
        let excluded = exclude
            .as_ref()
            .map(|set| set.is_match(&f.path))
            .unwrap_or(false);
        included && !excluded
    });
    if diff.files.len() != before {
        debug!(
            kept = diff.files.len(),
            filtered = before - diff.files.len(),
            "orchestrator: path filters applied"
        );
    }
    Ok(diff)
}

fn build_globset(patterns: &[String]) -> PrResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::Config(crate::errors::ConfigError::InvalidValue {
                field: "path_filters",
                reason: format!("bad glob '{pattern}': {e}"),
            })
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::Validation(format!("globset build failed: {e}")))
}
