//! Provider resolution and preflight validation.
//!
//! Resolution runs over an environment *snapshot* (`BTreeMap<String, String>`)
//! rather than the ambient process environment, so preflight is deterministic
//! and testable.
//!
//! Rules:
//! - Legacy variable names are rejected outright with the canonical
//!   replacement named in the error.
//! - An explicit provider choice wins, provided its credentials are present.
//! - Without an explicit choice, priority is Anthropic > Azure OpenAI (all
//!   three variables present) > OpenAI > Ollama.
//! - A configured `MODEL` must belong to the resolved provider's family;
//!   when several key sets are present and the model points at a *different*
//!   present provider, that is a multi-key ambiguity the operator has to
//!   break by removing a key or setting `provider` in config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical environment variable names consumed by resolution.
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const AZURE_OPENAI_API_KEY: &str = "AZURE_OPENAI_API_KEY";
pub const AZURE_OPENAI_ENDPOINT: &str = "AZURE_OPENAI_ENDPOINT";
pub const AZURE_OPENAI_DEPLOYMENT: &str = "AZURE_OPENAI_DEPLOYMENT";
pub const OLLAMA_BASE_URL: &str = "OLLAMA_BASE_URL";
pub const MODEL: &str = "MODEL";

/// Legacy variable names and their canonical replacements. Presence of any
/// of these fails preflight with a migration message.
pub const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("OPENAI_MODEL", MODEL),
    ("OPENCODE_MODEL", MODEL),
    ("PR_AGENT_API_KEY", OPENAI_API_KEY),
    ("AI_SEMANTIC_REVIEW_API_KEY", ANTHROPIC_API_KEY),
];

/// Default model applied when a single-key setup auto-selects a provider.
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5-coder:7b-instruct";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    AzureOpenAi,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::AzureOpenAi => "azure_openai",
            ProviderKind::Ollama => "ollama",
        }
    }
}

/// Credentials and endpoints carried by a resolved provider.
///
/// Only the reporter/orchestrator side ever sees this; agent environments
/// receive individual variables through the allowlist builder instead.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    /// Azure resource endpoint or Ollama base URL.
    pub endpoint: Option<String>,
    /// Azure deployment name (the `MODEL` for Azure setups).
    pub deployment: Option<String>,
}

/// Outcome of provider resolution: the backend, the effective model, and the
/// credentials needed to call it.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub kind: ProviderKind,
    pub model: String,
    pub credentials: ProviderCredentials,
}

/// Resolution failures. These surface as configuration errors in preflight.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("legacy environment variable {name} is no longer supported; set {replacement} instead")]
    LegacyEnvVar {
        name: &'static str,
        replacement: &'static str,
    },

    #[error(
        "multi-key ambiguity: credentials for {present:?} are all set and MODEL '{model}' does not match the \
         auto-selected provider {selected:?}; remove one key or set `provider` in the config"
    )]
    AmbiguousCredentials {
        present: Vec<&'static str>,
        selected: ProviderKind,
        model: String,
    },

    #[error("no LLM credentials found; set one of {ANTHROPIC_API_KEY}, {OPENAI_API_KEY}, the Azure OpenAI triple, or {OLLAMA_BASE_URL}")]
    MissingCredentials,

    #[error("provider {provider:?} selected but {missing} is not set")]
    MissingProviderKey {
        provider: ProviderKind,
        missing: &'static str,
    },

    #[error(
        "Azure OpenAI requires {AZURE_OPENAI_API_KEY}, {AZURE_OPENAI_ENDPOINT} and {AZURE_OPENAI_DEPLOYMENT} to all be set"
    )]
    IncompleteAzureBundle,

    #[error("Azure OpenAI requires an explicit deployment name in MODEL")]
    MissingAzureModel,

    #[error("model '{model}' does not match provider {provider:?} ({hint})")]
    ModelProviderMismatch {
        model: String,
        provider: ProviderKind,
        hint: &'static str,
    },
}

/// Which provider family a model name belongs to, judged by its prefix.
fn model_family(model: &str) -> Option<ProviderKind> {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        Some(ProviderKind::Anthropic)
    } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4")
    {
        Some(ProviderKind::OpenAi)
    } else {
        None
    }
}

fn non_empty<'a>(env: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Resolve the active provider from an env snapshot.
///
/// `explicit` is the config-level `provider` choice; `model_override` is a
/// config-level model that takes precedence over the `MODEL` variable.
pub fn resolve_provider(
    env: &BTreeMap<String, String>,
    explicit: Option<ProviderKind>,
    model_override: Option<&str>,
) -> Result<ResolvedProvider, ResolveError> {
    for (legacy, replacement) in LEGACY_ENV_VARS {
        if non_empty(env, legacy).is_some() {
            return Err(ResolveError::LegacyEnvVar {
                name: legacy,
                replacement,
            });
        }
    }

    let anthropic_key = non_empty(env, ANTHROPIC_API_KEY);
    let openai_key = non_empty(env, OPENAI_API_KEY);
    let azure_key = non_empty(env, AZURE_OPENAI_API_KEY);
    let azure_endpoint = non_empty(env, AZURE_OPENAI_ENDPOINT);
    let azure_deployment = non_empty(env, AZURE_OPENAI_DEPLOYMENT);
    let azure_complete = azure_key.is_some() && azure_endpoint.is_some() && azure_deployment.is_some();
    let ollama_url = non_empty(env, OLLAMA_BASE_URL);

    let model = model_override
        .map(str::to_string)
        .or_else(|| non_empty(env, MODEL).map(str::to_string));

    if let Some(kind) = explicit {
        return finish(
            kind,
            model,
            anthropic_key,
            openai_key,
            azure_key,
            azure_endpoint,
            azure_deployment,
            azure_complete,
            ollama_url,
        );
    }

    // Auto-selection by priority over present key sets.
    let mut present: Vec<&'static str> = Vec::new();
    if anthropic_key.is_some() {
        present.push(ANTHROPIC_API_KEY);
    }
    if azure_complete {
        present.push(AZURE_OPENAI_API_KEY);
    }
    if openai_key.is_some() {
        present.push(OPENAI_API_KEY);
    }

    let selected = if anthropic_key.is_some() {
        ProviderKind::Anthropic
    } else if azure_complete {
        ProviderKind::AzureOpenAi
    } else if openai_key.is_some() {
        ProviderKind::OpenAi
    } else if ollama_url.is_some() {
        ProviderKind::Ollama
    } else {
        return Err(ResolveError::MissingCredentials);
    };

    // With several key sets present, a model from a *different* present
    // family is ambiguous: the operator has to break the tie explicitly.
    if present.len() > 1 {
        if let Some(m) = &model {
            if let Some(family) = model_family(m) {
                let selected_family = match selected {
                    ProviderKind::AzureOpenAi => ProviderKind::OpenAi,
                    other => other,
                };
                if family != selected_family {
                    return Err(ResolveError::AmbiguousCredentials {
                        present,
                        selected,
                        model: m.clone(),
                    });
                }
            }
        }
    }

    finish(
        selected,
        model,
        anthropic_key,
        openai_key,
        azure_key,
        azure_endpoint,
        azure_deployment,
        azure_complete,
        ollama_url,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish(
    kind: ProviderKind,
    model: Option<String>,
    anthropic_key: Option<&str>,
    openai_key: Option<&str>,
    azure_key: Option<&str>,
    azure_endpoint: Option<&str>,
    azure_deployment: Option<&str>,
    azure_complete: bool,
    ollama_url: Option<&str>,
) -> Result<ResolvedProvider, ResolveError> {
    match kind {
        ProviderKind::Anthropic => {
            let key = anthropic_key.ok_or(ResolveError::MissingProviderKey {
                provider: kind,
                missing: ANTHROPIC_API_KEY,
            })?;
            let model = model.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string());
            check_family(&model, kind)?;
            Ok(ResolvedProvider {
                kind,
                model,
                credentials: ProviderCredentials {
                    api_key: Some(key.to_string()),
                    endpoint: None,
                    deployment: None,
                },
            })
        }
        ProviderKind::OpenAi => {
            let key = openai_key.ok_or(ResolveError::MissingProviderKey {
                provider: kind,
                missing: OPENAI_API_KEY,
            })?;
            let model = model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            check_family(&model, kind)?;
            Ok(ResolvedProvider {
                kind,
                model,
                credentials: ProviderCredentials {
                    api_key: Some(key.to_string()),
                    endpoint: None,
                    deployment: None,
                },
            })
        }
        ProviderKind::AzureOpenAi => {
            if !azure_complete {
                return Err(ResolveError::IncompleteAzureBundle);
            }
            // Azure models are deployment names; an explicit MODEL is required.
            let model = model.ok_or(ResolveError::MissingAzureModel)?;
            Ok(ResolvedProvider {
                kind,
                model,
                credentials: ProviderCredentials {
                    api_key: azure_key.map(str::to_string),
                    endpoint: azure_endpoint.map(str::to_string),
                    deployment: azure_deployment.map(str::to_string),
                },
            })
        }
        ProviderKind::Ollama => {
            let url = ollama_url.unwrap_or("http://127.0.0.1:11434");
            let model = model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());
            Ok(ResolvedProvider {
                kind,
                model,
                credentials: ProviderCredentials {
                    api_key: None,
                    endpoint: Some(url.to_string()),
                    deployment: None,
                },
            })
        }
    }
}

/// Claude models need Anthropic credentials; GPT-family models need
/// OpenAI or Azure. Models outside both families pass through (Ollama tags,
/// fine-tunes) — the provider will reject unknown names at call time.
fn check_family(model: &str, provider: ProviderKind) -> Result<(), ResolveError> {
    match (model_family(model), provider) {
        (Some(ProviderKind::Anthropic), ProviderKind::Anthropic) => Ok(()),
        (Some(ProviderKind::OpenAi), ProviderKind::OpenAi | ProviderKind::AzureOpenAi) => Ok(()),
        (Some(ProviderKind::Anthropic), p) => Err(ResolveError::ModelProviderMismatch {
            model: model.to_string(),
            provider: p,
            hint: "Claude models require Anthropic credentials",
        }),
        (Some(ProviderKind::OpenAi), p) => Err(ResolveError::ModelProviderMismatch {
            model: model.to_string(),
            provider: p,
            hint: "GPT-family models require OpenAI or Azure OpenAI credentials",
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_key_auto_selects_openai_with_default_model() {
        let e = env(&[(OPENAI_API_KEY, "sk-x")]);
        let r = resolve_provider(&e, None, None).unwrap();
        assert_eq!(r.kind, ProviderKind::OpenAi);
        assert_eq!(r.model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn anthropic_wins_priority_when_model_unset() {
        let e = env(&[(ANTHROPIC_API_KEY, "a"), (OPENAI_API_KEY, "b")]);
        let r = resolve_provider(&e, None, None).unwrap();
        assert_eq!(r.kind, ProviderKind::Anthropic);
        assert_eq!(r.model, DEFAULT_ANTHROPIC_MODEL);
    }

    #[test]
    fn multi_key_with_conflicting_model_is_ambiguous() {
        let e = env(&[
            (ANTHROPIC_API_KEY, "a"),
            (OPENAI_API_KEY, "b"),
            (MODEL, "gpt-4o-mini"),
        ]);
        let err = resolve_provider(&e, None, None).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousCredentials { .. }));
        assert!(err.to_string().contains("multi-key ambiguity"));
    }

    #[test]
    fn explicit_provider_breaks_ambiguity() {
        let e = env(&[
            (ANTHROPIC_API_KEY, "a"),
            (OPENAI_API_KEY, "b"),
            (MODEL, "gpt-4o-mini"),
        ]);
        let r = resolve_provider(&e, Some(ProviderKind::OpenAi), None).unwrap();
        assert_eq!(r.kind, ProviderKind::OpenAi);
        assert_eq!(r.model, "gpt-4o-mini");
    }

    #[test]
    fn legacy_env_var_is_rejected_with_replacement() {
        let e = env(&[(OPENAI_API_KEY, "b"), ("OPENAI_MODEL", "gpt-4o")]);
        let err = resolve_provider(&e, None, None).unwrap_err();
        match err {
            ResolveError::LegacyEnvVar { name, replacement } => {
                assert_eq!(name, "OPENAI_MODEL");
                assert_eq!(replacement, MODEL);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn claude_model_on_openai_is_a_mismatch() {
        let e = env(&[(OPENAI_API_KEY, "b"), (MODEL, "claude-sonnet-4-5")]);
        let err = resolve_provider(&e, None, None).unwrap_err();
        assert!(matches!(err, ResolveError::ModelProviderMismatch { .. }));
    }

    #[test]
    fn azure_requires_all_three_variables() {
        let e = env(&[
            (AZURE_OPENAI_API_KEY, "k"),
            (AZURE_OPENAI_ENDPOINT, "https://r.openai.azure.com"),
        ]);
        let err = resolve_provider(&e, Some(ProviderKind::AzureOpenAi), None).unwrap_err();
        assert!(matches!(err, ResolveError::IncompleteAzureBundle));
    }

    #[test]
    fn azure_requires_explicit_model() {
        let e = env(&[
            (AZURE_OPENAI_API_KEY, "k"),
            (AZURE_OPENAI_ENDPOINT, "https://r.openai.azure.com"),
            (AZURE_OPENAI_DEPLOYMENT, "gpt4o"),
        ]);
        let err = resolve_provider(&e, Some(ProviderKind::AzureOpenAi), None).unwrap_err();
        assert!(matches!(err, ResolveError::MissingAzureModel));
    }

    #[test]
    fn no_credentials_at_all() {
        let err = resolve_provider(&env(&[]), None, None).unwrap_err();
        assert!(matches!(err, ResolveError::MissingCredentials));
    }
}
