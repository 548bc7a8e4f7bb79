//! Markdown rendering for the summary comment/thread and grouped inline
//! bodies.
//!
//! The first line of the summary is the bot's signature header; it is how
//! the reporter finds its own comment on later runs, so it must stay
//! byte-stable. Inline bodies are built block-per-finding with the emoji +
//! `**Line N**` prefix the resolution engine keys on, and every block ends
//! with its fingerprint marker.

use crate::findings::fingerprint::build_marker;
use crate::findings::{Finding, PartialFinding, Severity};
use crate::orchestrator::{AgentState, AgentStatus};
use crate::resolve::{InvalidDetail, NormalizeStats};

/// Distinctive first line of the bot-owned summary.
pub const SUMMARY_HEADER: &str = "## 🤖 AI Code Review";

/// Hard cap applied to summary bodies (GitHub check output limit is 64 KiB).
pub const SUMMARY_MAX_CHARS: usize = 60_000;

/// How many invalid-line samples the drift section shows.
const DRIFT_SAMPLE_LIMIT: usize = 5;

/// Everything the summary needs, already normalized and sorted.
pub struct SummaryInput<'a> {
    pub findings: &'a [Finding],
    pub partial_findings: &'a [PartialFinding],
    pub stats: &'a NormalizeStats,
    pub invalid_details: &'a [InvalidDetail],
    pub statuses: &'a [AgentStatus],
    pub drift_warn_ratio: f64,
    pub cancelled: bool,
}

/// Render one finding block for an inline comment body.
pub fn render_finding_block(finding: &Finding) -> String {
    let line = finding.line.unwrap_or(0);
    let mut block = format!(
        "{} **Line {}** ({}): {}\n",
        finding.severity.emoji(),
        line,
        finding.severity.as_str(),
        finding.message.trim(),
    );
    if let Some(suggestion) = &finding.suggestion {
        block.push_str(&format!("\n💡 **Suggestion**: {}\n", suggestion.trim()));
    }
    block.push_str(&build_marker(finding));
    block.push('\n');
    block
}

/// Body of one grouped inline comment: blocks separated by a blank line.
pub fn render_group_body(findings: &[&Finding]) -> String {
    findings
        .iter()
        .map(|f| render_finding_block(f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the full summary markdown, ending with one marker per finding so
/// change detection can diff marker sets.
pub fn render_summary(input: &SummaryInput<'_>) -> String {
    let mut md = String::new();
    md.push_str(SUMMARY_HEADER);
    md.push_str("\n\n");

    if input.cancelled {
        md.push_str("> ⚠️ The run was cancelled; results below are partial.\n\n");
    }

    let count = |sev: Severity| {
        input
            .findings
            .iter()
            .filter(|f| f.severity == sev)
            .count()
    };
    let (errors, warnings, infos) = (
        count(Severity::Error),
        count(Severity::Warning),
        count(Severity::Info),
    );

    if input.findings.is_empty() {
        md.push_str("No findings on this change. ✅\n");
    } else {
        md.push_str("| Severity | Count |\n|---|---|\n");
        md.push_str(&format!("| 🔴 error | {errors} |\n"));
        md.push_str(&format!("| 🟡 warning | {warnings} |\n"));
        md.push_str(&format!("| 🔵 info | {infos} |\n\n"));

        md.push_str("### Findings\n\n");
        let mut current_file: Option<&str> = None;
        for f in input.findings {
            if current_file != Some(f.file.as_str()) {
                md.push_str(&format!("\n#### `{}`\n\n", f.file));
                current_file = Some(f.file.as_str());
            }
            let location = match f.line {
                Some(line) => format!("**Line {line}**"),
                None => "**File**".to_string(),
            };
            md.push_str(&format!(
                "- {} {} ({}): {} _[{}]_\n",
                f.severity.emoji(),
                location,
                f.severity.as_str(),
                f.message.trim(),
                f.source_agent,
            ));
        }
        md.push('\n');
    }

    if !input.partial_findings.is_empty() {
        md.push_str("### ⚠️ Partial results (advisory)\n\n");
        md.push_str(
            "These came from agents that failed mid-run. They never affect gating.\n\n",
        );
        for f in input.partial_findings {
            let location = match f.line {
                Some(line) => format!("line {line}"),
                None => "file".to_string(),
            };
            md.push_str(&format!(
                "- {} `{}` ({location}): {} _[{}]_\n",
                f.severity.emoji(),
                f.file,
                f.message.trim(),
                f.source_agent,
            ));
        }
        md.push('\n');
    }

    if input.stats.drift_ratio() >= input.drift_warn_ratio && input.stats.total > 0 {
        md.push_str("### 📉 Line drift\n\n");
        md.push_str(&format!(
            "{} of {} findings could not be anchored to a diff line and were downgraded \
             (drift ratio {:.0}%).\n\n",
            input.stats.downgraded,
            input.stats.total,
            input.stats.drift_ratio() * 100.0,
        ));
        for d in input.invalid_details.iter().take(DRIFT_SAMPLE_LIMIT) {
            md.push_str(&format!(
                "- `{}:{}` — {} (nearest: {}) _[{}]_\n",
                d.file,
                d.original_line,
                d.reason.as_str(),
                d.nearest
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "none".into()),
                d.source_agent,
            ));
        }
        if input.invalid_details.len() > DRIFT_SAMPLE_LIMIT {
            md.push_str(&format!(
                "- … and {} more\n",
                input.invalid_details.len() - DRIFT_SAMPLE_LIMIT
            ));
        }
        md.push('\n');
    }

    if !input.statuses.is_empty() {
        md.push_str("### Agents\n\n");
        md.push_str("| Agent | Pass | Status | Detail | Findings |\n|---|---|---|---|---|\n");
        for s in input.statuses {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                s.agent,
                s.pass,
                status_icon(s.state),
                s.detail.as_deref().unwrap_or("—"),
                s.findings,
            ));
        }
        md.push('\n');
    }

    for f in input.findings {
        md.push_str(&build_marker(f));
        md.push('\n');
    }

    truncate_summary(md)
}

fn status_icon(state: AgentState) -> &'static str {
    match state {
        AgentState::Success => "✅ success",
        AgentState::Failure => "❌ failed",
        AgentState::Skipped => "⏭️ skipped",
        AgentState::Cached => "♻️ cached",
    }
}

/// Keep the body under the provider cap, cutting on a line boundary.
fn truncate_summary(md: String) -> String {
    if md.chars().count() <= SUMMARY_MAX_CHARS {
        return md;
    }
    let mut out: String = md.chars().take(SUMMARY_MAX_CHARS).collect();
    if let Some(pos) = out.rfind('\n') {
        out.truncate(pos);
    }
    out.push_str("\n\n_… truncated_\n");
    out
}
