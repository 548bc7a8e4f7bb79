//! Preflight: provider/credential/model validation and trust decisions.
//!
//! Runs before any agent. Legacy environment variables and config problems
//! are always fatal. A provider resolution failure is fatal only when a
//! *required* pass contains an LLM-backed agent; otherwise those agents are
//! skipped at runtime with a recorded reason.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::agents::builtin_agent;
use crate::config::ReviewConfig;
use crate::errors::{ConfigError, PrResult, TrustError};
use crate::forge::{ForgeKind, PrMeta};
use llm_providers::{ResolveError, ResolvedProvider, resolve_provider};

/// ADO environment names used for fork detection.
const ADO_SOURCE_REPO_URI: &str = "SYSTEM_PULLREQUEST_SOURCEREPOSITORYURI";
const ADO_BUILD_REPO_URI: &str = "BUILD_REPOSITORY_URI";

/// What the run is allowed to do.
#[derive(Debug, Clone)]
pub enum TrustDecision {
    /// Full review: agents run, comments are posted.
    RunFull,
    /// Push mode: no PR in context, produce a check only.
    CheckOnly { reason: String },
    /// Do not run agents at all (fork or draft).
    Skip { error: TrustError },
}

/// Preflight output: resolved provider (when needed and available) plus the
/// trust decision.
#[derive(Debug)]
pub struct Preflight {
    pub provider: Option<ResolvedProvider>,
    pub trust: TrustDecision,
    /// Recorded when LLM agents will be skipped for lack of a provider.
    pub provider_skip_reason: Option<String>,
}

/// Run all preflight checks.
pub fn run_preflight(
    config: &ReviewConfig,
    env: &BTreeMap<String, String>,
    forge_kind: ForgeKind,
    pr_meta: Option<&PrMeta>,
) -> PrResult<Preflight> {
    config.validate()?;

    // Unknown agents in a required pass cannot be skipped away.
    for pass in config.passes.iter().filter(|p| p.enabled) {
        for agent in &pass.agents {
            if builtin_agent(agent).is_none() {
                if pass.required {
                    return Err(ConfigError::UnknownAgentInRequiredPass {
                        pass: pass.name.clone(),
                        agent: agent.clone(),
                    }
                    .into());
                }
                warn!(pass = %pass.name, agent = %agent, "preflight: unknown agent will be skipped");
            }
        }
    }

    let needs_llm_in_required = config.passes.iter().any(|p| {
        p.enabled
            && p.required
            && p.agents
                .iter()
                .any(|a| builtin_agent(a).map(|s| s.is_llm()).unwrap_or(false))
    });
    let needs_llm_anywhere = config.passes.iter().any(|p| {
        p.enabled
            && p.agents
                .iter()
                .any(|a| builtin_agent(a).map(|s| s.is_llm()).unwrap_or(false))
    });

    let (provider, provider_skip_reason) = if needs_llm_anywhere {
        match resolve_provider(env, config.provider, config.model.as_deref()) {
            Ok(resolved) => {
                info!(
                    provider = resolved.kind.as_str(),
                    model = %resolved.model,
                    "preflight: provider resolved"
                );
                (Some(resolved), None)
            }
            // Legacy variables are a hard configuration error regardless of
            // which pass wanted the LLM.
            Err(e @ ResolveError::LegacyEnvVar { .. }) => {
                return Err(ConfigError::Provider(e).into());
            }
            Err(e) if needs_llm_in_required => {
                return Err(ConfigError::Provider(e).into());
            }
            Err(e) => {
                warn!(error = %e, "preflight: no usable provider; LLM agents will be skipped");
                (None, Some(e.to_string()))
            }
        }
    } else {
        (None, None)
    };

    let trust = resolve_trust(config, env, forge_kind, pr_meta);
    Ok(Preflight {
        provider,
        trust,
        provider_skip_reason,
    })
}

/// Fork/draft/push-mode decision.
pub fn resolve_trust(
    config: &ReviewConfig,
    env: &BTreeMap<String, String>,
    forge_kind: ForgeKind,
    pr_meta: Option<&PrMeta>,
) -> TrustDecision {
    let Some(meta) = pr_meta else {
        return TrustDecision::CheckOnly {
            reason: "no pull request in context (push mode)".into(),
        };
    };

    if config.trusted_only {
        if let Some(error) = detect_fork(env, forge_kind, meta) {
            return TrustDecision::Skip { error };
        }
    }

    if meta.draft {
        return TrustDecision::Skip {
            error: TrustError::DraftSkipped,
        };
    }

    TrustDecision::RunFull
}

/// Forge-specific fork detection.
///
/// GitHub compares head/base repository names from PR metadata; ADO compares
/// the pipeline's source-repository URI against the build repository URI
/// (the former is only set for forks and must be non-empty to count).
fn detect_fork(
    env: &BTreeMap<String, String>,
    forge_kind: ForgeKind,
    meta: &PrMeta,
) -> Option<TrustError> {
    match forge_kind {
        ForgeKind::GitHub => match (&meta.source_repo, &meta.target_repo) {
            (Some(source), Some(target)) if source != target => Some(TrustError::ForkBlocked {
                source_repo: source.clone(),
                target: target.clone(),
            }),
            _ => None,
        },
        ForgeKind::Ado => {
            let source = env.get(ADO_SOURCE_REPO_URI).map(String::as_str).unwrap_or("");
            let target = env.get(ADO_BUILD_REPO_URI).map(String::as_str).unwrap_or("");
            if !source.is_empty() && source != target {
                Some(TrustError::ForkBlocked {
                    source_repo: source.to_string(),
                    target: target.to_string(),
                })
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    fn config(yaml: &str) -> ReviewConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pr(source: &str, target: &str, draft: bool) -> PrMeta {
        PrMeta {
            title: "t".into(),
            draft,
            source_repo: Some(source.into()),
            target_repo: Some(target.into()),
            head_sha: None,
        }
    }

    #[test]
    fn static_only_config_needs_no_provider() {
        let cfg = config("passes: [{name: static, agents: [semgrep]}]");
        let pf = run_preflight(&cfg, &env(&[]), ForgeKind::GitHub, Some(&pr("o/r", "o/r", false)))
            .unwrap();
        assert!(pf.provider.is_none());
        assert!(pf.provider_skip_reason.is_none());
        assert!(matches!(pf.trust, TrustDecision::RunFull));
    }

    #[test]
    fn missing_provider_is_fatal_only_for_required_llm_pass() {
        let optional = config("passes: [{name: ai, agents: [local_llm]}]");
        let pf = run_preflight(
            &optional,
            &env(&[]),
            ForgeKind::GitHub,
            Some(&pr("o/r", "o/r", false)),
        )
        .unwrap();
        assert!(pf.provider.is_none());
        assert!(pf.provider_skip_reason.is_some());

        let required = config("passes: [{name: ai, agents: [local_llm], required: true}]");
        let err = run_preflight(
            &required,
            &env(&[]),
            ForgeKind::GitHub,
            Some(&pr("o/r", "o/r", false)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn legacy_env_is_fatal_even_for_optional_llm_pass() {
        let cfg = config("passes: [{name: ai, agents: [local_llm]}]");
        let err = run_preflight(
            &cfg,
            &env(&[("OPENCODE_MODEL", "x"), ("OPENAI_API_KEY", "k")]),
            ForgeKind::GitHub,
            Some(&pr("o/r", "o/r", false)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("OPENCODE_MODEL"));
    }

    #[test]
    fn unknown_agent_in_required_pass_is_fatal() {
        let cfg = config("passes: [{name: p, agents: [nonexistent], required: true}]");
        let err = run_preflight(&cfg, &env(&[]), ForgeKind::GitHub, None).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UnknownAgentInRequiredPass { .. })));
    }

    #[test]
    fn github_fork_is_blocked_when_trusted_only() {
        let cfg = config("passes: [{name: p, agents: [semgrep]}]");
        let decision = resolve_trust(
            &cfg,
            &env(&[]),
            ForgeKind::GitHub,
            Some(&pr("fork/r", "upstream/r", false)),
        );
        assert!(matches!(
            decision,
            TrustDecision::Skip {
                error: TrustError::ForkBlocked { .. }
            }
        ));

        let open = config("trusted_only: false\npasses: [{name: p, agents: [semgrep]}]");
        let decision = resolve_trust(
            &open,
            &env(&[]),
            ForgeKind::GitHub,
            Some(&pr("fork/r", "upstream/r", false)),
        );
        assert!(matches!(decision, TrustDecision::RunFull));
    }

    #[test]
    fn ado_fork_detection_is_env_based() {
        let cfg = config("passes: [{name: p, agents: [semgrep]}]");
        let forked = env(&[
            ("SYSTEM_PULLREQUEST_SOURCEREPOSITORYURI", "https://dev.azure.com/other/repo"),
            ("BUILD_REPOSITORY_URI", "https://dev.azure.com/org/repo"),
        ]);
        let meta = PrMeta::default();
        assert!(matches!(
            resolve_trust(&cfg, &forked, ForgeKind::Ado, Some(&meta)),
            TrustDecision::Skip { .. }
        ));

        // Empty source URI means same-repo PR.
        let same = env(&[("BUILD_REPOSITORY_URI", "https://dev.azure.com/org/repo")]);
        assert!(matches!(
            resolve_trust(&cfg, &same, ForgeKind::Ado, Some(&meta)),
            TrustDecision::RunFull
        ));
    }

    #[test]
    fn draft_prs_are_skipped_and_push_mode_is_check_only() {
        let cfg = config("passes: [{name: p, agents: [semgrep]}]");
        assert!(matches!(
            resolve_trust(&cfg, &env(&[]), ForgeKind::GitHub, Some(&pr("o/r", "o/r", true))),
            TrustDecision::Skip {
                error: TrustError::DraftSkipped
            }
        ));
        assert!(matches!(
            resolve_trust(&cfg, &env(&[]), ForgeKind::GitHub, None),
            TrustDecision::CheckOnly { .. }
        ));
    }
}
