//! Canonical finding model shared by agents, the pipeline, and the reporter.
//!
//! A `Finding` is one issue about the change under review. Agents produce
//! them; the line resolver normalizes them against the diff; dedup collapses
//! repeats; the reporter posts the survivors. Partial findings are the same
//! shape but come from agents that failed mid-execution — advisory only,
//! never used for gating.

pub mod fingerprint;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Finding severity. Declaration order is the gate ordinal:
/// error < warning < info.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// True when this severity is at or above the gate threshold
    /// (errors gate a `warning` threshold, infos do not).
    pub fn gates(&self, threshold: Severity) -> bool {
        *self <= threshold
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    /// Emoji used as the block header prefix in grouped comment bodies.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Error => "🔴",
            Severity::Warning => "🟡",
            Severity::Info => "🔵",
        }
    }
}

/// One review issue bound to a file and (optionally) a line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// Canonical repo-relative path after normalization: forward slashes,
    /// no leading slash, no `..` or `./` segments.
    pub file: String,
    /// 1-based line on the new side of the diff.
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
    pub source_agent: String,
    /// 32-hex stable identity; derived during normalization when absent.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Same shape as `Finding`; produced by an agent that failed mid-run.
pub type PartialFinding = Finding;

impl Finding {
    /// Schema check applied before dedup. Violations are dropped with a
    /// structured log rather than aborting the run.
    pub fn schema_problem(&self) -> Option<&'static str> {
        if self.source_agent.trim().is_empty() {
            return Some("missing source_agent");
        }
        if self.message.trim().is_empty() {
            return Some("empty message");
        }
        if self.file.trim().is_empty() {
            return Some("empty file");
        }
        if let (Some(line), Some(end)) = (self.line, self.end_line) {
            if end < line {
                return Some("end_line before line");
            }
        }
        if self.end_line.is_some() && self.line.is_none() {
            return Some("end_line without line");
        }
        None
    }
}

/// Outcome of one agent invocation. Serialized into the agent cache, so the
/// tag layout is part of the cache schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResult {
    Success {
        findings: Vec<Finding>,
    },
    Failure {
        error: String,
        #[serde(default)]
        partial_findings: Vec<PartialFinding>,
    },
    Skipped {
        reason: String,
    },
}

/// Drop exact repeats, keeping the first occurrence in input order.
/// Key: fingerprint + file + line (agent-independent, so the same issue
/// reported by two agents collapses).
pub fn deduplicate_findings(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(findings.len());
    for f in findings {
        let key = fingerprint::dedupe_key(&f);
        if seen.insert(key) {
            out.push(f);
        }
    }
    out
}

/// Partial findings keep the source agent in the key: no single failed
/// agent is authoritative, so cross-agent repeats are preserved.
pub fn deduplicate_partial_findings(findings: Vec<PartialFinding>) -> Vec<PartialFinding> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(findings.len());
    for f in findings {
        let key = format!("{}:{}", f.source_agent, fingerprint::dedupe_key(&f));
        if seen.insert(key) {
            out.push(f);
        }
    }
    out
}

/// Final output order: severity (error first), then file, then line with
/// file-level findings (no line) treated as line 0.
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        (a.severity, a.file.as_str(), a.line.unwrap_or(0))
            .cmp(&(b.severity, b.file.as_str(), b.line.unwrap_or(0)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn finding(agent: &str, file: &str, line: Option<u32>, message: &str) -> Finding {
        Finding {
            severity: Severity::Warning,
            file: file.to_string(),
            line,
            end_line: None,
            message: message.to_string(),
            suggestion: None,
            rule_id: None,
            source_agent: agent.to_string(),
            fingerprint: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn severity_order_matches_gate_ordinal() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Info);
        assert!(Severity::Error.gates(Severity::Warning));
        assert!(!Severity::Info.gates(Severity::Warning));
    }

    #[test]
    fn dedup_is_idempotent_and_order_preserving() {
        let xs = vec![
            finding("a", "src/a.rs", Some(3), "dup"),
            finding("b", "src/a.rs", Some(3), "dup"),
            finding("a", "src/b.rs", Some(1), "other"),
        ];
        let once = deduplicate_findings(xs.clone());
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].source_agent, "a");
        assert_eq!(once[1].file, "src/b.rs");
        let twice = deduplicate_findings(once.clone());
        assert_eq!(twice.len(), once.len());
    }

    #[test]
    fn partial_dedup_preserves_cross_agent_repeats() {
        let xs = vec![
            finding("a", "src/a.rs", Some(3), "dup"),
            finding("b", "src/a.rs", Some(3), "dup"),
            finding("b", "src/a.rs", Some(3), "dup"),
        ];
        let out = deduplicate_partial_findings(xs);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn sort_puts_errors_first_then_file_then_line() {
        let mut xs = vec![
            finding("a", "src/b.rs", Some(9), "w"),
            finding("a", "src/a.rs", None, "w"),
            finding("a", "src/a.rs", Some(2), "w"),
        ];
        xs[0].severity = Severity::Info;
        xs[2].severity = Severity::Error;
        sort_findings(&mut xs);
        assert_eq!(xs[0].severity, Severity::Error);
        assert_eq!(xs[1].line, None); // line-less sorts as 0 within severity+file
        assert_eq!(xs[2].severity, Severity::Info);
    }

    #[test]
    fn schema_problems_are_detected() {
        let mut f = finding("", "src/a.rs", Some(1), "m");
        assert_eq!(f.schema_problem(), Some("missing source_agent"));
        f.source_agent = "agent".into();
        f.end_line = Some(0);
        assert_eq!(f.schema_problem(), Some("end_line before line"));
        f.line = None;
        assert_eq!(f.schema_problem(), Some("end_line without line"));
    }
}
