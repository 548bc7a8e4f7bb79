//! Allowlist-based environment construction for agent subprocesses.
//!
//! Invariant: forge tokens never enter an agent environment. The builder
//! starts from an allowlist instead of filtering a denylist, and strips the
//! token names afterwards anyway in case an allowlist entry ever aliases one.

use std::collections::BTreeMap;

use crate::agents::AgentSpec;

/// Tokens that must never reach an agent, current or legacy names.
pub const FORGE_TOKEN_VARS: &[&str] = &[
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SYSTEM_ACCESSTOKEN",
    "AZURE_DEVOPS_PAT",
    "AZURE_DEVOPS_EXT_PAT",
];

/// Benign process basics every agent may see.
const BASE_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "TERM", "CI"];

/// LLM secrets, passed only to agents that declare they need them.
pub const LLM_ENV_VARS: &[&str] = &[
    llm_providers::provider::ANTHROPIC_API_KEY,
    llm_providers::provider::OPENAI_API_KEY,
    llm_providers::provider::AZURE_OPENAI_API_KEY,
    llm_providers::provider::AZURE_OPENAI_ENDPOINT,
    llm_providers::provider::AZURE_OPENAI_DEPLOYMENT,
    llm_providers::provider::OLLAMA_BASE_URL,
    llm_providers::provider::MODEL,
];

/// Build the scoped environment for one agent invocation.
pub fn build_agent_env(
    snapshot: &BTreeMap<String, String>,
    spec: &AgentSpec,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    let mut copy = |name: &str| {
        if let Some(value) = snapshot.get(name) {
            env.insert(name.to_string(), value.clone());
        }
    };

    for name in BASE_ALLOWLIST {
        copy(name);
    }
    for name in spec.extra_env {
        copy(name);
    }
    if spec.needs_llm_credentials {
        for name in LLM_ENV_VARS {
            copy(name);
        }
    }

    for token in FORGE_TOKEN_VARS {
        env.remove(*token);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::builtin_agent;

    fn snapshot() -> BTreeMap<String, String> {
        [
            ("PATH", "/usr/bin"),
            ("HOME", "/home/ci"),
            ("GITHUB_TOKEN", "ghp_secret"),
            ("GH_TOKEN", "ghp_secret2"),
            ("SYSTEM_ACCESSTOKEN", "ado_secret"),
            ("AZURE_DEVOPS_PAT", "ado_pat"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-oai"),
            ("MODEL", "claude-sonnet-4-5"),
            ("RANDOM_VAR", "nope"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn forge_tokens_never_reach_any_agent() {
        for id in ["semgrep", "opencode", "pr_agent", "ai_semantic_review", "local_llm"] {
            let spec = builtin_agent(id).unwrap();
            let env = build_agent_env(&snapshot(), spec);
            for token in FORGE_TOKEN_VARS {
                assert!(!env.contains_key(*token), "{id} leaked {token}");
            }
        }
    }

    #[test]
    fn llm_secrets_only_for_declaring_agents() {
        let semgrep = build_agent_env(&snapshot(), builtin_agent("semgrep").unwrap());
        assert!(!semgrep.contains_key("ANTHROPIC_API_KEY"));
        assert!(!semgrep.contains_key("OPENAI_API_KEY"));

        let opencode = build_agent_env(&snapshot(), builtin_agent("opencode").unwrap());
        assert_eq!(opencode.get("ANTHROPIC_API_KEY").unwrap(), "sk-ant");
        assert_eq!(opencode.get("MODEL").unwrap(), "claude-sonnet-4-5");
    }

    #[test]
    fn unlisted_vars_are_not_copied() {
        let env = build_agent_env(&snapshot(), builtin_agent("semgrep").unwrap());
        assert!(!env.contains_key("RANDOM_VAR"));
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin");
    }
}
