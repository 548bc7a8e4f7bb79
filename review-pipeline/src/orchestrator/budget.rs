//! Budget state and cost estimation, owned exclusively by the orchestrator.
//!
//! Agents never mutate budget; LLM-backed agents are skipped up front when
//! an estimate would breach a cap. Deterministic agents ignore LLM budgets
//! entirely. The monthly ledger is a tiny month→USD JSON file; a missing
//! file means zero spend.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Limits;
use crate::errors::BudgetError;
use llm_providers::{ResolvedProvider, estimate_cost_usd, estimate_tokens};

/// Output-token allowance assumed per LLM agent call.
const OUTPUT_TOKEN_ALLOWANCE: u64 = 2_000;

/// Estimated cost of running one LLM agent over the bounded diff.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostEstimate {
    pub tokens: u64,
    pub usd: f64,
}

/// Remaining headroom for the run. Single owner; mutations happen through
/// `charge` only.
#[derive(Debug, Clone)]
pub struct BudgetState {
    pub files: u32,
    pub diff_lines: u32,
    pub tokens_remaining: i64,
    pub usd_pr_remaining: f64,
    pub usd_month_remaining: f64,
}

impl BudgetState {
    pub fn new(limits: &Limits, monthly_spent_usd: f64) -> Self {
        Self {
            files: limits.max_files,
            diff_lines: limits.max_diff_lines,
            tokens_remaining: limits.max_tokens_per_pr as i64,
            usd_pr_remaining: limits.max_usd_per_pr,
            usd_month_remaining: (limits.monthly_budget_usd - monthly_spent_usd).max(0.0),
        }
    }

    /// Would this estimate breach a cap for an LLM-backed agent?
    pub fn check_llm(&self, estimate: CostEstimate) -> Result<(), BudgetError> {
        if estimate.tokens as i64 > self.tokens_remaining {
            return Err(BudgetError::PerPrExceeded {
                estimated: estimate.usd,
                remaining: self.usd_pr_remaining,
            });
        }
        if estimate.usd > self.usd_pr_remaining {
            return Err(BudgetError::PerPrExceeded {
                estimated: estimate.usd,
                remaining: self.usd_pr_remaining,
            });
        }
        if estimate.usd > self.usd_month_remaining {
            return Err(BudgetError::MonthlyExceeded {
                estimated: estimate.usd,
                remaining: self.usd_month_remaining,
            });
        }
        Ok(())
    }

    /// Deduct a consumed estimate after an LLM agent ran.
    pub fn charge(&mut self, estimate: CostEstimate) {
        self.tokens_remaining -= estimate.tokens as i64;
        self.usd_pr_remaining = (self.usd_pr_remaining - estimate.usd).max(0.0);
        self.usd_month_remaining = (self.usd_month_remaining - estimate.usd).max(0.0);
    }
}

/// Estimate one LLM call over the bounded diff (≈4 chars/token plus a flat
/// output allowance).
pub fn estimate_for_diff(diff_chars: u64, provider: Option<&ResolvedProvider>) -> CostEstimate {
    let tokens = estimate_tokens(diff_chars) + OUTPUT_TOKEN_ALLOWANCE;
    let usd = provider
        .map(|p| {
            estimate_cost_usd(
                p.kind,
                &p.model,
                estimate_tokens(diff_chars),
                OUTPUT_TOKEN_ALLOWANCE,
            )
        })
        .unwrap_or(0.0);
    CostEstimate { tokens, usd }
}

/// Current accounting month, e.g. "2026-08".
pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Read this month's spend from the ledger. Absent or unreadable → 0.
pub async fn load_monthly_spent(path: &Path, month: &str) -> f64 {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, f64>>(&bytes) {
            Ok(ledger) => ledger.get(month).copied().unwrap_or(0.0),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "budget: unreadable ledger, assuming zero spend");
                0.0
            }
        },
        Err(_) => 0.0,
    }
}

/// Persist this month's total spend. Other months are preserved.
pub async fn store_monthly_spent(path: &Path, month: &str, spent_usd: f64) {
    let mut ledger: BTreeMap<String, f64> = match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    };
    ledger.insert(month.to_string(), spent_usd);
    let json = match serde_json::to_vec_pretty(&ledger) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "budget: failed to serialize ledger");
            return;
        }
    };
    if let Some(dir) = path.parent() {
        let _ = tokio::fs::create_dir_all(dir).await;
    }
    if let Err(e) = tokio::fs::write(path, json).await {
        warn!(path = %path.display(), error = %e, "budget: failed to write ledger");
    } else {
        debug!(path = %path.display(), month, spent_usd, "budget: ledger updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_providers::{ProviderCredentials, ProviderKind};

    fn provider(kind: ProviderKind, model: &str) -> ResolvedProvider {
        ResolvedProvider {
            kind,
            model: model.to_string(),
            credentials: ProviderCredentials {
                api_key: Some("k".into()),
                endpoint: None,
                deployment: None,
            },
        }
    }

    #[test]
    fn estimate_scales_with_diff_size() {
        let p = provider(ProviderKind::Anthropic, "claude-sonnet-4-5");
        let small = estimate_for_diff(400, Some(&p));
        let large = estimate_for_diff(400_000, Some(&p));
        assert!(large.tokens > small.tokens);
        assert!(large.usd > small.usd);
    }

    #[test]
    fn cap_breach_skips_llm_agent() {
        let limits = Limits {
            max_usd_per_pr: 0.0001,
            ..Default::default()
        };
        let mut budget = BudgetState::new(&limits, 0.0);
        let p = provider(ProviderKind::Anthropic, "claude-sonnet-4-5");
        let estimate = estimate_for_diff(4_000_000, Some(&p));
        assert!(matches!(
            budget.check_llm(estimate),
            Err(BudgetError::PerPrExceeded { .. })
        ));
        // Local providers are free and pass the USD caps.
        let free = estimate_for_diff(4_000, None);
        assert!(budget.check_llm(free).is_ok());
        budget.charge(free);
        assert!(budget.tokens_remaining < Limits::default().max_tokens_per_pr as i64);
    }

    #[test]
    fn monthly_cap_is_separate_from_pr_cap() {
        let limits = Limits {
            max_usd_per_pr: 100.0,
            monthly_budget_usd: 10.0,
            max_tokens_per_pr: 1_000_000_000,
            ..Default::default()
        };
        let budget = BudgetState::new(&limits, 9.999_999);
        let p = provider(ProviderKind::OpenAi, "gpt-4o");
        let estimate = estimate_for_diff(40_000_000, Some(&p));
        assert!(matches!(
            budget.check_llm(estimate),
            Err(BudgetError::MonthlyExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn ledger_round_trips_and_tolerates_absence() {
        let dir = std::env::temp_dir().join("pr-ai-review-budget-test");
        let path = dir.join("ledger.json");
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(load_monthly_spent(&path, "2026-08").await, 0.0);
        store_monthly_spent(&path, "2026-08", 1.25).await;
        store_monthly_spent(&path, "2026-09", 0.5).await;
        assert_eq!(load_monthly_spent(&path, "2026-08").await, 1.25);
        assert_eq!(load_monthly_spent(&path, "2026-09").await, 0.5);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
