//! Agent registry and invocation contract.
//!
//! Analyzer implementations live outside this repository. A subprocess
//! agent is an executable on `PATH` that reads an `AgentInput` JSON document
//! on stdin and writes either an `AgentResult` or a bare findings array to
//! stdout. The `local_llm` agent is the one built-in exception: it calls the
//! resolved provider in-process through `llm-providers`.
//!
//! The registry also records each agent's trust surface: whether it needs
//! LLM credentials (budget + secret scoping) and which extra environment
//! variables it may see.

pub mod local_llm;
pub mod runtime;

use serde::Serialize;

use crate::config::Limits;
use crate::diff::CanonicalDiff;
use crate::findings::{AgentResult, Finding};

/// How an agent executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Deterministic scanner subprocess; ignores LLM budgets.
    Static,
    /// LLM-backed subprocess (CLI wrapper around a provider).
    LlmCommand,
    /// In-process reviewer using the resolved provider.
    BuiltinLlm,
}

/// Registry entry for one agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: &'static str,
    pub kind: AgentKind,
    /// argv for subprocess agents; empty for built-ins. Executed without a
    /// shell.
    pub command: &'static [&'static str],
    pub needs_llm_credentials: bool,
    /// Extra allowlisted environment variables beyond the base set.
    pub extra_env: &'static [&'static str],
}

impl AgentSpec {
    /// LLM-backed agents are subject to USD/token budgets.
    pub fn is_llm(&self) -> bool {
        self.kind != AgentKind::Static
    }
}

const AGENTS: &[AgentSpec] = &[
    AgentSpec {
        id: "semgrep",
        kind: AgentKind::Static,
        command: &["review-agent-semgrep"],
        needs_llm_credentials: false,
        extra_env: &["SEMGREP_RULES"],
    },
    AgentSpec {
        id: "opencode",
        kind: AgentKind::LlmCommand,
        command: &["review-agent-opencode"],
        needs_llm_credentials: true,
        extra_env: &[],
    },
    AgentSpec {
        id: "pr_agent",
        kind: AgentKind::LlmCommand,
        command: &["review-agent-pr-agent"],
        needs_llm_credentials: true,
        extra_env: &[],
    },
    AgentSpec {
        id: "ai_semantic_review",
        kind: AgentKind::LlmCommand,
        command: &["review-agent-semantic"],
        needs_llm_credentials: true,
        extra_env: &[],
    },
    AgentSpec {
        id: "local_llm",
        kind: AgentKind::BuiltinLlm,
        command: &[],
        needs_llm_credentials: true,
        extra_env: &[],
    },
];

/// Look up a built-in agent by config identifier.
pub fn builtin_agent(id: &str) -> Option<&'static AgentSpec> {
    AGENTS.iter().find(|a| a.id == id)
}

/// Context document handed to every agent (stdin for subprocesses, prompt
/// material for the built-in). Paths inside are canonical.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInput {
    pub pr_number: Option<u64>,
    pub head_sha: String,
    pub files: Vec<AgentFileContext>,
    /// Unified diff bounded by the configured limits.
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentFileContext {
    pub path: String,
    pub status: crate::diff::FileStatus,
    pub additions: u32,
    pub deletions: u32,
}

/// Notice appended when the diff was cut at a limit.
const TRUNCATION_NOTICE: &str = "\n[diff truncated at configured limits]\n";

/// Render the bounded unified diff agents receive: at most `max_files`
/// files and `max_diff_lines` total patch lines.
pub fn bounded_diff(diff: &CanonicalDiff, limits: &Limits) -> String {
    let mut out = String::new();
    let mut lines_used: u32 = 0;
    let mut truncated = false;

    for (i, file) in diff.files.iter().enumerate() {
        if i as u32 >= limits.max_files {
            truncated = true;
            break;
        }
        let Some(patch) = &file.patch else { continue };
        out.push_str(&format!("--- {}\n", file.path));
        for line in patch.lines() {
            if lines_used >= limits.max_diff_lines {
                truncated = true;
                break;
            }
            out.push_str(line);
            out.push('\n');
            lines_used += 1;
        }
        if truncated {
            break;
        }
        out.push('\n');
    }
    if truncated {
        out.push_str(TRUNCATION_NOTICE);
    }
    out
}

/// Build the input document for one run.
pub fn build_agent_input(
    diff: &CanonicalDiff,
    limits: &Limits,
    pr_number: Option<u64>,
    head_sha: &str,
) -> AgentInput {
    AgentInput {
        pr_number,
        head_sha: head_sha.to_string(),
        files: diff
            .files
            .iter()
            .map(|f| AgentFileContext {
                path: f.path.clone(),
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect(),
        diff: bounded_diff(diff, limits),
    }
}

/// Decode agent stdout: a tagged `AgentResult` or a bare findings array.
/// The orchestrator stamps `source_agent` on everything regardless of what
/// the agent claimed.
pub fn parse_agent_output(agent_id: &str, stdout: &[u8]) -> Result<AgentResult, String> {
    let text = std::str::from_utf8(stdout).map_err(|e| format!("non-utf8 output: {e}"))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(AgentResult::Success { findings: vec![] });
    }

    let mut result = if let Ok(result) = serde_json::from_str::<AgentResult>(trimmed) {
        result
    } else if let Ok(findings) = serde_json::from_str::<Vec<Finding>>(trimmed) {
        AgentResult::Success { findings }
    } else {
        return Err(format!(
            "output is neither an AgentResult nor a findings array ({} bytes)",
            trimmed.len()
        ));
    };

    match &mut result {
        AgentResult::Success { findings } => stamp_source(agent_id, findings),
        AgentResult::Failure {
            partial_findings, ..
        } => stamp_source(agent_id, partial_findings),
        AgentResult::Skipped { .. } => {}
    }
    Ok(result)
}

fn stamp_source(agent_id: &str, findings: &mut [Finding]) {
    for f in findings {
        f.source_agent = agent_id.to_string();
    }
}
