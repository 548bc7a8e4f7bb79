//! Validated configuration record (schema version 1).
//!
//! A collaborator loads and deserializes the YAML; the pipeline only ever
//! sees this already-validated record. Unknown fields are rejected so typos
//! fail loudly instead of silently disabling features.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ConfigError;
use crate::findings::Severity;
use llm_providers::ProviderKind;

/// Top-level review configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewConfig {
    /// Block fork PRs unless explicitly disabled.
    #[serde(default = "default_true")]
    pub trusted_only: bool,

    /// Explicit provider choice; absent means auto-select by key priority.
    #[serde(default)]
    pub provider: Option<ProviderKind>,

    /// Config-level model override (takes precedence over `MODEL`).
    #[serde(default)]
    pub model: Option<String>,

    /// Ordered passes of ordered agents.
    pub passes: Vec<PassConfig>,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub reporting: Reporting,

    #[serde(default)]
    pub gating: Gating,

    #[serde(default)]
    pub path_filters: Option<PathFilters>,
}

impl ReviewConfig {
    /// Stable hash over the whole config, used in agent cache keys.
    pub fn config_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passes.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "passes",
                reason: "at least one pass is required".into(),
            });
        }
        for pass in &self.passes {
            if pass.agents.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "passes.agents",
                    reason: format!("pass '{}' lists no agents", pass.name),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.gating.drift_warn_ratio)
            || !(0.0..=1.0).contains(&self.gating.drift_fail_ratio)
        {
            return Err(ConfigError::InvalidValue {
                field: "gating.drift_warn_ratio",
                reason: "drift ratios must lie in 0.0..=1.0".into(),
            });
        }
        Ok(())
    }
}

/// One ordered group of agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassConfig {
    pub name: String,
    pub agents: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
}

/// Resource caps owned by the orchestrator's budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    pub max_files: u32,
    pub max_diff_lines: u32,
    pub max_tokens_per_pr: u64,
    pub max_usd_per_pr: f64,
    pub monthly_budget_usd: f64,
    /// Month → spent-USD ledger file; absent means no monthly accounting.
    pub ledger_path: Option<std::path::PathBuf>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_files: 200,
            max_diff_lines: 4_000,
            max_tokens_per_pr: 200_000,
            max_usd_per_pr: 1.50,
            monthly_budget_usd: 50.0,
            ledger_path: None,
        }
    }
}

/// Per-forge reporting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reporting {
    #[serde(default)]
    pub github: Option<GithubReporting>,
    #[serde(default)]
    pub ado: Option<AdoReporting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GithubReporting {
    pub mode: GithubMode,
    pub max_inline_comments: u32,
    pub summary: bool,
}

impl Default for GithubReporting {
    fn default() -> Self {
        Self {
            mode: GithubMode::ChecksAndComments,
            max_inline_comments: 10,
            summary: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GithubMode {
    ChecksOnly,
    CommentsOnly,
    ChecksAndComments,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdoReporting {
    pub mode: AdoMode,
    pub max_inline_comments: u32,
    pub summary: bool,
    pub thread_status: AdoThreadStatus,
}

impl Default for AdoReporting {
    fn default() -> Self {
        Self {
            mode: AdoMode::ThreadsAndStatus,
            max_inline_comments: 10,
            summary: true,
            thread_status: AdoThreadStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoMode {
    StatusOnly,
    ThreadsOnly,
    ThreadsAndStatus,
}

/// Azure DevOps thread status codes on the wire: Active=1, Pending=6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoThreadStatus {
    Active,
    Pending,
}

impl AdoThreadStatus {
    pub fn wire_code(&self) -> u8 {
        match self {
            AdoThreadStatus::Active => 1,
            AdoThreadStatus::Pending => 6,
        }
    }
}

/// Gating policy: which severities fail the check, and the line-drift knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Gating {
    pub enabled: bool,
    pub fail_on_severity: Severity,
    /// Above this downgraded/total ratio the summary carries a drift section.
    pub drift_warn_ratio: f64,
    /// Above this ratio the run may be failed, if `fail_on_drift` is set.
    pub drift_fail_ratio: f64,
    pub fail_on_drift: bool,
}

impl Default for Gating {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_on_severity: Severity::Error,
            drift_warn_ratio: 0.10,
            drift_fail_ratio: 0.25,
            fail_on_drift: false,
        }
    }
}

/// Include/exclude globs applied to changed files before agents run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathFilters {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_round_trip() {
        let yaml = r#"
passes:
  - name: static
    agents: [semgrep]
  - name: semantic
    agents: [local_llm]
    required: true
"#;
        let cfg: ReviewConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.trusted_only);
        assert_eq!(cfg.passes.len(), 2);
        assert!(cfg.passes[1].required);
        assert!(cfg.passes[0].enabled);
        assert_eq!(cfg.limits.max_files, 200);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_field_is_rejected() {
        let yaml = "passes: [{name: p, agents: [semgrep]}]\nsurprise: 1\n";
        assert!(serde_yaml::from_str::<ReviewConfig>(yaml).is_err());
    }

    #[test]
    fn empty_pass_fails_validation() {
        let yaml = "passes: [{name: empty, agents: []}]";
        let cfg: ReviewConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_hash_is_stable_and_input_sensitive() {
        let a: ReviewConfig =
            serde_yaml::from_str("passes: [{name: p, agents: [semgrep]}]").unwrap();
        let b: ReviewConfig =
            serde_yaml::from_str("passes: [{name: p, agents: [semgrep]}]").unwrap();
        let c: ReviewConfig =
            serde_yaml::from_str("passes: [{name: q, agents: [semgrep]}]").unwrap();
        assert_eq!(a.config_hash(), b.config_hash());
        assert_ne!(a.config_hash(), c.config_hash());
    }
}
