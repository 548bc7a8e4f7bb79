//! Diff-aware line resolution.
//!
//! Agents report lines with varying reliability: static analyzers emit
//! new-file numbers, LLM-backed reviewers sometimes count diff ordinals
//! across the patch body. The resolver maps every reported location onto a
//! line the forge will actually accept an inline comment on, or downgrades
//! the finding to file level when no such line exists.
//!
//! Built once per run from the canonical diff; all lookups are in-memory.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::diff::parser::{LineMapping, line_mapping, ordinal_line_map};
use crate::diff::{CanonicalDiff, FileStatus};
use crate::findings::fingerprint::effective_fingerprint;
use crate::findings::Finding;

/// Agents of this class may report diff-ordinal positions instead of
/// new-file lines; the resolver translates for them.
pub const LLM_AGENT_CLASS: &[&str] = &["opencode", "pr_agent", "ai_semantic_review", "local_llm"];

pub fn is_llm_agent(source_agent: &str) -> bool {
    LLM_AGENT_CLASS.contains(&source_agent)
}

/// Why a reported line could not be used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    FileNotInDiff,
    FileDeleted,
    LineNotInDiff,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::FileNotInDiff => "file_not_in_diff",
            InvalidReason::FileDeleted => "file_deleted",
            InvalidReason::LineNotInDiff => "line_not_in_diff",
        }
    }
}

/// Result of validating one (file, line) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCheck {
    pub valid: bool,
    /// True when the line is a `+` line (set only for valid results).
    pub is_addition: bool,
    pub nearest_valid_line: Option<u32>,
    pub reason: Option<InvalidReason>,
}

/// Validation options, decided per caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOpts<'a> {
    /// Restrict the valid set to `+` lines only.
    pub additions_only: bool,
    /// Compute the nearest valid line on miss.
    pub suggest_nearest: bool,
    /// Reporting agent; LLM-class agents get diff-ordinal translation.
    pub source_agent: Option<&'a str>,
}

/// Per-run resolver over canonical diff files.
pub struct LineResolver {
    mappings: BTreeMap<String, LineMapping>,
    ordinals: BTreeMap<String, Vec<Option<u32>>>,
    deleted: std::collections::BTreeSet<String>,
}

impl LineResolver {
    /// Build mappings for every file that carries a patch. Deleted files are
    /// tracked separately so callers can distinguish "deleted" from "not in
    /// this diff".
    pub fn from_diff(diff: &CanonicalDiff) -> Self {
        let mut mappings = BTreeMap::new();
        let mut ordinals = BTreeMap::new();
        for file in &diff.files {
            if file.status == FileStatus::Deleted {
                continue;
            }
            if let Some(patch) = &file.patch {
                mappings.insert(file.path.clone(), line_mapping(patch));
                ordinals.insert(file.path.clone(), ordinal_line_map(patch));
            }
        }
        Self {
            mappings,
            ordinals,
            deleted: diff.deleted_files.clone(),
        }
    }

    /// Validate a reported line against the commentable set for `file`.
    pub fn validate_line(&self, file: &str, line: u32, opts: ValidateOpts<'_>) -> LineCheck {
        if self.deleted.contains(file) {
            return invalid(InvalidReason::FileDeleted);
        }
        let Some(mapping) = self.mappings.get(file) else {
            return invalid(InvalidReason::FileNotInDiff);
        };

        let valid_set = if opts.additions_only {
            &mapping.added
        } else {
            &mapping.all
        };

        if valid_set.contains(&line) {
            return LineCheck {
                valid: true,
                is_addition: mapping.added.contains(&line),
                nearest_valid_line: None,
                reason: None,
            };
        }

        // LLM agents may have counted patch-body ordinals.
        if opts.source_agent.map(is_llm_agent).unwrap_or(false) {
            if let Some(translated) = self.translate_ordinal(file, line) {
                if valid_set.contains(&translated) {
                    debug!(
                        file,
                        ordinal = line,
                        new_line = translated,
                        "resolver: translated diff ordinal"
                    );
                    return LineCheck {
                        valid: true,
                        is_addition: mapping.added.contains(&translated),
                        nearest_valid_line: Some(translated),
                        reason: None,
                    };
                }
            }
        }

        let nearest = if opts.suggest_nearest {
            nearest_line(valid_set, line)
        } else {
            None
        };
        LineCheck {
            valid: false,
            is_addition: false,
            nearest_valid_line: nearest,
            reason: Some(InvalidReason::LineNotInDiff),
        }
    }

    /// Translate a 1-based diff ordinal into a new-file line, if in range.
    fn translate_ordinal(&self, file: &str, ordinal: u32) -> Option<u32> {
        let map = self.ordinals.get(file)?;
        if ordinal == 0 {
            return None;
        }
        map.get(ordinal as usize - 1).copied().flatten()
    }
}

fn invalid(reason: InvalidReason) -> LineCheck {
    LineCheck {
        valid: false,
        is_addition: false,
        nearest_valid_line: None,
        reason: Some(reason),
    }
}

/// Nearest member of `set` by absolute distance; lower line wins ties.
fn nearest_line(set: &std::collections::BTreeSet<u32>, line: u32) -> Option<u32> {
    let below = set.range(..=line).next_back().copied();
    let above = set.range(line..).next().copied();
    match (below, above) {
        (Some(b), Some(a)) => {
            if line - b <= a - line {
                Some(b)
            } else {
                Some(a)
            }
        }
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// How one finding fared during normalization.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidDetail {
    pub file: String,
    pub original_line: u32,
    pub reason: InvalidReason,
    pub nearest: Option<u32>,
    pub source_agent: String,
}

/// Normalization counters surfaced in the summary and the drift signal.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NormalizeStats {
    pub total: usize,
    pub valid: usize,
    pub normalized: usize,
    pub downgraded: usize,
    pub dropped: usize,
    pub deleted_files: usize,
}

impl NormalizeStats {
    /// Share of findings that lost their inline anchor.
    pub fn drift_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.downgraded as f64 / self.total as f64
        }
    }
}

/// Output of `normalize_findings_for_diff`.
#[derive(Debug, Default)]
pub struct NormalizedFindings {
    pub findings: Vec<Finding>,
    pub stats: NormalizeStats,
    pub invalid_details: Vec<InvalidDetail>,
}

/// Options for the normalization pass.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOpts {
    /// Replace a missed line with the nearest valid one instead of
    /// downgrading to file level.
    pub auto_fix_lines: bool,
    pub additions_only: bool,
}

impl Default for NormalizeOpts {
    fn default() -> Self {
        Self {
            auto_fix_lines: true,
            additions_only: false,
        }
    }
}

/// Canonicalize paths, fill fingerprints, and anchor every finding to a
/// commentable line (or downgrade it to file level).
///
/// Schema-invalid findings are dropped with a structured log; everything
/// else survives in some form.
pub fn normalize_findings_for_diff(
    findings: Vec<Finding>,
    diff: &CanonicalDiff,
    resolver: &LineResolver,
    opts: NormalizeOpts,
) -> NormalizedFindings {
    let mut out = NormalizedFindings::default();

    for mut f in findings {
        out.stats.total += 1;

        if let Some(problem) = f.schema_problem() {
            out.stats.dropped += 1;
            warn!(
                target: "finding_validation",
                "{}",
                serde_json::json!({
                    "event": "finding_dropped",
                    "source_agent": f.source_agent,
                    "file": f.file,
                    "reason": problem,
                })
            );
            continue;
        }

        // Canonical path, then rename tracking to the new-side path.
        f.file = match crate::diff::canonicalize_path(&f.file) {
            Ok(p) => diff.resolve_alias(&p).to_string(),
            Err(_) => {
                out.stats.dropped += 1;
                warn!(
                    target: "finding_validation",
                    "{}",
                    serde_json::json!({
                        "event": "finding_dropped",
                        "source_agent": f.source_agent,
                        "file": f.file,
                        "reason": "invalid_path",
                    })
                );
                continue;
            }
        };
        f.fingerprint = Some(effective_fingerprint(&f));

        if diff.deleted_files.contains(&f.file) {
            f.line = None;
            f.end_line = None;
            out.stats.downgraded += 1;
            out.stats.deleted_files += 1;
            out.findings.push(f);
            continue;
        }

        let Some(line) = f.line else {
            // File-level finding: nothing to anchor.
            out.stats.valid += 1;
            out.findings.push(f);
            continue;
        };

        let check = resolver.validate_line(
            &f.file,
            line,
            ValidateOpts {
                additions_only: opts.additions_only,
                suggest_nearest: opts.auto_fix_lines,
                source_agent: Some(&f.source_agent),
            },
        );

        if check.valid {
            // Ordinal translation reports through nearest_valid_line.
            if let Some(translated) = check.nearest_valid_line {
                if translated != line {
                    f.line = Some(translated);
                    f.end_line = None;
                    out.stats.normalized += 1;
                    out.findings.push(f);
                    continue;
                }
            }
            out.stats.valid += 1;
            out.findings.push(f);
            continue;
        }

        out.invalid_details.push(InvalidDetail {
            file: f.file.clone(),
            original_line: line,
            reason: check.reason.unwrap_or(InvalidReason::LineNotInDiff),
            nearest: check.nearest_valid_line,
            source_agent: f.source_agent.clone(),
        });

        match (opts.auto_fix_lines, check.nearest_valid_line) {
            (true, Some(nearest)) => {
                f.line = Some(nearest);
                f.end_line = f.end_line.filter(|e| *e >= nearest);
                out.stats.normalized += 1;
            }
            _ => {
                f.line = None;
                f.end_line = None;
                out.stats.downgraded += 1;
            }
        }
        out.findings.push(f);
    }

    out
}
