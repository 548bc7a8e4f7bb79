//! Provider-neutral reporter: lifecycle, gating, inline planning, posting.
//!
//! Called once per run:
//! 1. `start` creates the in-progress status (non-fatal on failure);
//! 2. `publish` normalizes/dedups/sorts findings, renders the summary,
//!    posts mode-gated outputs, resolves stale comments, and completes the
//!    check with the gated conclusion.
//!
//! Planning stages (`plan_inline_comments`, gating, grouping) are pure so
//! the interesting behavior is testable without a forge.

pub mod summary;

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{AdoMode, GithubMode, ReviewConfig};
use crate::dedup::{ProximityMap, identify_stale_comments, is_duplicate_by_proximity};
use crate::diff::{DiffFile, canonicalize_files};
use crate::errors::PrResult;
use crate::findings::fingerprint::{
    ParsedDedupeKey, dedupe_key, effective_fingerprint, extract_markers, parse_dedupe_key,
};
use crate::findings::{
    Finding, PartialFinding, deduplicate_findings, deduplicate_partial_findings, sort_findings,
};
use crate::forge::{
    Annotation, CheckConclusion, CheckHandle, ExistingComment, ForgeClient, ForgeContext,
    ForgeKind, InlineComment,
};
use crate::orchestrator::AgentStatus;
use crate::resolution::plan_resolutions;
use crate::resolve::{LineResolver, NormalizeOpts, NormalizeStats, normalize_findings_for_diff};

/// Minimum pause between inline comment posts.
pub const INLINE_COMMENT_DELAY_MS: u64 = 100;

/// Findings this close together (same file) share one grouped comment.
pub const GROUP_ADJACENCY_GAP: u32 = 3;

/// Check title while agents run.
const IN_PROGRESS_TITLE: &str = "AI Review in progress";

/// Everything `publish` needs from the orchestrator.
pub struct PublishInput {
    pub findings: Vec<Finding>,
    pub partial_findings: Vec<PartialFinding>,
    pub diff_files: Vec<DiffFile>,
    pub statuses: Vec<AgentStatus>,
    pub cancelled: bool,
}

/// What `publish` did, for the caller's exit decision and logs.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub conclusion: Option<CheckConclusion>,
    pub findings_total: usize,
    pub posted_inline: usize,
    pub skipped_duplicates: usize,
    pub resolved_comments: usize,
    pub struck_comments: usize,
    pub stats: NormalizeStats,
}

/// Reporter over one forge client.
pub struct Reporter {
    client: ForgeClient,
    kind: ForgeKind,
    has_pr: bool,
    config: ReviewConfig,
    dry_run: bool,
}

/// Which outputs the reporting mode enables.
#[derive(Debug, Clone, Copy)]
struct ModeGates {
    check: bool,
    comments: bool,
    max_inline: u32,
    summary: bool,
}

impl Reporter {
    pub fn new(ctx: &ForgeContext, config: ReviewConfig, dry_run: bool) -> PrResult<Self> {
        let mut client = ForgeClient::from_context(ctx)?;
        if let ForgeClient::Ado(ado) = &mut client {
            if let Some(reporting) = &config.reporting.ado {
                ado.thread_status = reporting.thread_status.wire_code();
            }
        }
        Ok(Self {
            client,
            kind: ctx.kind(),
            has_pr: ctx.pr_number().is_some(),
            config,
            dry_run,
        })
    }

    fn gates(&self) -> ModeGates {
        match self.kind {
            ForgeKind::GitHub => {
                let r = self.config.reporting.github.clone().unwrap_or_default();
                ModeGates {
                    check: r.mode != GithubMode::CommentsOnly,
                    comments: r.mode != GithubMode::ChecksOnly,
                    max_inline: r.max_inline_comments,
                    summary: r.summary,
                }
            }
            ForgeKind::Ado => {
                let r = self.config.reporting.ado.clone().unwrap_or_default();
                ModeGates {
                    check: r.mode != AdoMode::ThreadsOnly,
                    comments: r.mode != AdoMode::StatusOnly,
                    max_inline: r.max_inline_comments,
                    summary: r.summary,
                }
            }
        }
    }

    /// Create the in-progress status. Failures degrade to a
    /// create-on-complete path inside `publish`.
    pub async fn start(&self) -> Option<CheckHandle> {
        if !self.gates().check {
            return None;
        }
        if self.dry_run {
            info!("reporter: dry-run, skipping check creation");
            return None;
        }
        match self.client.start_check(IN_PROGRESS_TITLE).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "reporter: failed to create in-progress status, will create on complete");
                None
            }
        }
    }

    /// The heavy operation: normalize → dedup → sort → render → post →
    /// resolve stale → complete the check.
    pub async fn publish(
        &self,
        handle: Option<CheckHandle>,
        input: PublishInput,
    ) -> PrResult<PublishOutcome> {
        let gates = self.gates();
        let mut outcome = PublishOutcome::default();

        // Single canonicalization entrypoint for everything downstream.
        let diff = canonicalize_files(input.diff_files)?;
        let resolver = LineResolver::from_diff(&diff);

        let normalized =
            normalize_findings_for_diff(input.findings, &diff, &resolver, NormalizeOpts::default());
        outcome.stats = normalized.stats;

        let mut findings = deduplicate_findings(normalized.findings);
        sort_findings(&mut findings);
        outcome.findings_total = findings.len();

        let partial = normalize_findings_for_diff(
            input.partial_findings,
            &diff,
            &resolver,
            NormalizeOpts::default(),
        );
        let mut partial_findings = deduplicate_partial_findings(partial.findings);
        sort_findings(&mut partial_findings);

        let conclusion = conclusion_for(
            &findings,
            &self.config.gating,
            normalized.stats.drift_ratio(),
            input.cancelled,
        );
        outcome.conclusion = Some(conclusion);

        let summary_md = summary::render_summary(&summary::SummaryInput {
            findings: &findings,
            partial_findings: &partial_findings,
            stats: &normalized.stats,
            invalid_details: &normalized.invalid_details,
            statuses: &input.statuses,
            drift_warn_ratio: self.config.gating.drift_warn_ratio,
            cancelled: input.cancelled,
        });

        if gates.comments && self.has_pr {
            let existing = self.load_existing_comments().await;
            self.post_inline_comments(&findings, &existing, gates.max_inline, &mut outcome)
                .await;
            self.resolve_stale(&findings, &existing, &mut outcome).await;
            if gates.summary {
                self.upsert_summary(&summary_md).await;
            }
        }

        if gates.check {
            let title = check_title(conclusion, &findings, input.cancelled);
            let annotations = build_annotations(&findings);
            if self.dry_run {
                info!(title = %title, "reporter: dry-run, skipping check completion");
            } else if let Err(e) = self
                .client
                .complete_check(handle.as_ref(), conclusion, &title, &summary_md, &annotations)
                .await
            {
                // Surfaced as fatal: the status is the one output every run
                // must produce.
                return Err(e.into());
            }
        }

        info!(
            findings = outcome.findings_total,
            posted = outcome.posted_inline,
            skipped = outcome.skipped_duplicates,
            resolved = outcome.resolved_comments,
            "reporter: publish done"
        );
        Ok(outcome)
    }

    /// Complete the check with a bare title/summary and no annotations.
    /// Used for skip paths (fork, draft) and fatal errors so the status is
    /// always set.
    pub async fn complete_simple(
        &self,
        handle: Option<CheckHandle>,
        conclusion: CheckConclusion,
        title: &str,
        summary: &str,
    ) -> PrResult<()> {
        if !self.gates().check {
            return Ok(());
        }
        if self.dry_run {
            info!(title, "reporter: dry-run, skipping check completion");
            return Ok(());
        }
        self.client
            .complete_check(handle.as_ref(), conclusion, title, summary, &[])
            .await
            .map_err(Into::into)
    }

    /// Fetch PR metadata through the reporter's client.
    pub async fn fetch_pr_meta(&self) -> PrResult<crate::forge::PrMeta> {
        self.client.fetch_pr_meta().await.map_err(Into::into)
    }

    async fn load_existing_comments(&self) -> Vec<ExistingComment> {
        match self.client.list_inline_comments().await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "reporter: failed to list existing comments; duplicates may be posted");
                Vec::new()
            }
        }
    }

    async fn post_inline_comments(
        &self,
        findings: &[Finding],
        existing: &[ExistingComment],
        max_inline: u32,
        outcome: &mut PublishOutcome,
    ) {
        let existing_keys: HashSet<String> = existing
            .iter()
            .flat_map(|c| c.markers.iter().cloned())
            .collect();
        let parsed: Vec<ParsedDedupeKey> = existing_keys
            .iter()
            .filter_map(|k| parse_dedupe_key(k))
            .collect();
        let proximity = ProximityMap::from_keys(parsed.iter());

        let plan = plan_inline_comments(findings, &existing_keys, &proximity, max_inline);
        outcome.skipped_duplicates = plan.skipped_duplicates;

        for post in &plan.posts {
            if self.dry_run {
                info!(
                    file = %post.comment.file,
                    line = post.comment.line,
                    "reporter: dry-run, would post inline comment"
                );
            } else if let Err(e) = self.client.post_inline(&post.comment).await {
                // Individual post failures never abort the run.
                warn!(
                    file = %post.comment.file,
                    line = post.comment.line,
                    error = %e,
                    "reporter: inline post failed"
                );
                continue;
            }
            outcome.posted_inline += 1;
            tokio::time::sleep(Duration::from_millis(INLINE_COMMENT_DELAY_MS)).await;
        }
    }

    async fn resolve_stale(
        &self,
        findings: &[Finding],
        existing: &[ExistingComment],
        outcome: &mut PublishOutcome,
    ) {
        let parsed: Vec<ParsedDedupeKey> = existing
            .iter()
            .flat_map(|c| c.markers.iter())
            .filter_map(|k| parse_dedupe_key(k))
            .collect();
        let stale = identify_stale_comments(&parsed, findings);
        if stale.is_empty() {
            return;
        }
        let actions = plan_resolutions(existing, &stale, self.kind.as_str());
        for action in &actions {
            let resolved = matches!(action, crate::resolution::ResolutionAction::Resolve { .. });
            if self.dry_run {
                info!(
                    comment_id = action.comment_id(),
                    resolved, "reporter: dry-run, would update comment"
                );
            } else if let Err(e) = self
                .client
                .update_comment(action.comment_id(), action.new_body())
                .await
            {
                warn!(
                    comment_id = action.comment_id(),
                    error = %e,
                    "reporter: comment resolution update failed"
                );
                continue;
            }
            if resolved {
                outcome.resolved_comments += 1;
            } else {
                outcome.struck_comments += 1;
            }
        }
    }

    /// Update the bot summary in place, or create it. Updates are skipped
    /// when the marker set is unchanged.
    async fn upsert_summary(&self, body: &str) {
        let found = match self.client.find_summary_comment(summary::SUMMARY_HEADER).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "reporter: summary lookup failed; creating fresh");
                None
            }
        };
        match found {
            Some(existing) => {
                let old: HashSet<String> = extract_markers(&existing.body).into_iter().collect();
                let new: HashSet<String> = extract_markers(body).into_iter().collect();
                if old == new {
                    debug!("reporter: summary unchanged (same marker set), skipping update");
                    return;
                }
                if self.dry_run {
                    info!("reporter: dry-run, would update summary comment");
                    return;
                }
                if let Err(e) = self.client.update_comment(&existing.id, body).await {
                    warn!(error = %e, "reporter: summary update failed");
                }
            }
            None => {
                if self.dry_run {
                    info!("reporter: dry-run, would create summary comment");
                    return;
                }
                if let Err(e) = self.client.create_summary_comment(body).await {
                    warn!(error = %e, "reporter: summary create failed");
                }
            }
        }
    }
}

/// Gated conclusion. Partial findings never participate.
pub fn conclusion_for(
    findings: &[Finding],
    gating: &crate::config::Gating,
    drift_ratio: f64,
    cancelled: bool,
) -> CheckConclusion {
    if cancelled {
        return CheckConclusion::Failure;
    }
    if gating.enabled {
        if findings
            .iter()
            .any(|f| f.severity.gates(gating.fail_on_severity))
        {
            return CheckConclusion::Failure;
        }
        if gating.fail_on_drift && drift_ratio >= gating.drift_fail_ratio {
            return CheckConclusion::Failure;
        }
        return CheckConclusion::Success;
    }
    if findings.is_empty() {
        CheckConclusion::Success
    } else {
        CheckConclusion::Neutral
    }
}

fn check_title(conclusion: CheckConclusion, findings: &[Finding], cancelled: bool) -> String {
    if cancelled {
        return "AI Review cancelled".to_string();
    }
    match conclusion {
        CheckConclusion::Success if findings.is_empty() => "AI Review: no findings".to_string(),
        _ => format!("AI Review: {} finding(s)", findings.len()),
    }
}

fn build_annotations(findings: &[Finding]) -> Vec<Annotation> {
    findings
        .iter()
        .filter_map(|f| {
            let line = f.line?;
            Some(Annotation {
                path: f.file.clone(),
                start_line: line,
                end_line: f.end_line.unwrap_or(line),
                annotation_level: match f.severity {
                    crate::findings::Severity::Error => "failure",
                    crate::findings::Severity::Warning => "warning",
                    crate::findings::Severity::Info => "notice",
                },
                message: f.message.clone(),
            })
        })
        .collect()
}

/// One planned inline post plus the keys it will own once posted.
#[derive(Debug, Clone)]
pub struct PlannedPost {
    pub comment: InlineComment,
    pub keys: Vec<String>,
}

/// Result of pure inline planning.
#[derive(Debug, Clone, Default)]
pub struct InlinePlan {
    pub posts: Vec<PlannedPost>,
    pub skipped_duplicates: usize,
}

/// Group adjacent findings and decide what actually gets posted.
///
/// Iterates findings in their final (severity-first) order, pulls same-file
/// neighbors within the adjacency gap into a grouped comment, drops members
/// already represented by an existing comment (exact key or proximity), and
/// stops at `max_inline` comments. Both tracking structures are advanced as
/// posts are planned so later groups see earlier ones.
pub fn plan_inline_comments(
    findings: &[Finding],
    existing_keys: &HashSet<String>,
    proximity: &ProximityMap,
    max_inline: u32,
) -> InlinePlan {
    let mut plan = InlinePlan::default();
    let mut keys = existing_keys.clone();
    let mut proximity = proximity.clone();
    let mut consumed = vec![false; findings.len()];

    for i in 0..findings.len() {
        if consumed[i] || findings[i].line.is_none() {
            continue;
        }
        if plan.posts.len() as u32 >= max_inline {
            break;
        }

        // Collect the group: same file, within the gap of any member line.
        let mut member_idx = vec![i];
        let mut lines = vec![findings[i].line.unwrap_or(0)];
        consumed[i] = true;
        for j in (i + 1)..findings.len() {
            if consumed[j] || findings[j].file != findings[i].file {
                continue;
            }
            let Some(line) = findings[j].line else { continue };
            if lines.iter().any(|l| l.abs_diff(line) <= GROUP_ADJACENCY_GAP) {
                member_idx.push(j);
                lines.push(line);
                consumed[j] = true;
            }
        }
        member_idx.sort_by_key(|&idx| findings[idx].line.unwrap_or(0));

        // Drop members an existing comment already covers.
        let mut members: Vec<&Finding> = Vec::new();
        for &idx in &member_idx {
            let f = &findings[idx];
            if is_duplicate_by_proximity(f, &keys, &proximity) {
                plan.skipped_duplicates += 1;
            } else {
                members.push(f);
            }
        }
        if members.is_empty() {
            continue;
        }

        let first_line = members[0].line.unwrap_or(0);
        let last_line = members.last().and_then(|f| f.line).unwrap_or(first_line);
        let body = summary::render_group_body(&members);
        let group_keys: Vec<String> = members.iter().map(|f| dedupe_key(f)).collect();

        for f in &members {
            let fp = effective_fingerprint(f);
            proximity.record(&fp, &f.file, f.line.unwrap_or(0));
        }
        for key in &group_keys {
            keys.insert(key.clone());
        }

        plan.posts.push(PlannedPost {
            comment: InlineComment {
                file: members[0].file.clone(),
                line: first_line,
                end_line: if last_line > first_line {
                    Some(last_line)
                } else {
                    None
                },
                body,
            },
            keys: group_keys,
        });
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Gating;
    use crate::findings::Severity;
    use std::collections::BTreeMap;

    fn finding(file: &str, line: Option<u32>, sev: Severity, rule: &str) -> Finding {
        Finding {
            severity: sev,
            file: file.into(),
            line,
            end_line: None,
            message: format!("issue {rule}"),
            suggestion: None,
            rule_id: Some(rule.into()),
            source_agent: "semgrep".into(),
            fingerprint: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn gating_fails_on_threshold_and_above() {
        let gating = Gating::default(); // fail_on_severity = error
        let errors = vec![finding("a.rs", Some(1), Severity::Error, "R1")];
        let warnings = vec![finding("a.rs", Some(1), Severity::Warning, "R1")];
        assert_eq!(
            conclusion_for(&errors, &gating, 0.0, false),
            CheckConclusion::Failure
        );
        assert_eq!(
            conclusion_for(&warnings, &gating, 0.0, false),
            CheckConclusion::Success
        );
        assert_eq!(
            conclusion_for(&[], &gating, 0.0, false),
            CheckConclusion::Success
        );
    }

    #[test]
    fn cancelled_runs_always_fail() {
        let gating = Gating {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(
            conclusion_for(&[], &gating, 0.0, true),
            CheckConclusion::Failure
        );
    }

    #[test]
    fn drift_gate_is_opt_in() {
        let mut gating = Gating::default();
        assert_eq!(
            conclusion_for(&[], &gating, 0.9, false),
            CheckConclusion::Success
        );
        gating.fail_on_drift = true;
        assert_eq!(
            conclusion_for(&[], &gating, 0.30, false),
            CheckConclusion::Failure
        );
        assert_eq!(
            conclusion_for(&[], &gating, 0.20, false),
            CheckConclusion::Success
        );
    }

    #[test]
    fn adjacent_findings_share_one_grouped_comment() {
        let findings = vec![
            finding("src/a.rs", Some(10), Severity::Error, "R1"),
            finding("src/a.rs", Some(12), Severity::Warning, "R2"),
            finding("src/a.rs", Some(30), Severity::Warning, "R3"),
            finding("src/b.rs", Some(11), Severity::Warning, "R4"),
        ];
        let plan =
            plan_inline_comments(&findings, &HashSet::new(), &ProximityMap::default(), 10);
        assert_eq!(plan.posts.len(), 3);
        let grouped = &plan.posts[0];
        assert_eq!(grouped.comment.line, 10);
        assert_eq!(grouped.comment.end_line, Some(12));
        assert_eq!(grouped.keys.len(), 2);
        assert_eq!(
            crate::findings::fingerprint::extract_markers(&grouped.comment.body).len(),
            2
        );
    }

    #[test]
    fn cap_limits_planned_posts() {
        let findings: Vec<Finding> = (0..8)
            .map(|i| finding("src/a.rs", Some(i * 100 + 1), Severity::Warning, &format!("R{i}")))
            .collect();
        let plan =
            plan_inline_comments(&findings, &HashSet::new(), &ProximityMap::default(), 3);
        assert_eq!(plan.posts.len(), 3);
    }

    #[test]
    fn duplicates_by_proximity_are_skipped() {
        let old = finding("src/a.rs", Some(11), Severity::Warning, "R1");
        let old_key = dedupe_key(&old);
        let parsed = parse_dedupe_key(&old_key).unwrap();
        let proximity = ProximityMap::from_keys([&parsed]);
        let keys: HashSet<String> = [old_key].into();

        // Same issue drifted three lines down.
        let moved = finding("src/a.rs", Some(14), Severity::Warning, "R1");
        let plan = plan_inline_comments(&[moved], &keys, &proximity, 10);
        assert!(plan.posts.is_empty());
        assert_eq!(plan.skipped_duplicates, 1);
    }

    #[test]
    fn later_groups_see_earlier_planned_posts() {
        // Identical issue twice in one run, far apart in sort order but
        // within proximity: second must be treated as duplicate.
        let a = finding("src/a.rs", Some(10), Severity::Warning, "R1");
        let mut b = finding("src/a.rs", Some(15), Severity::Warning, "R1");
        b.message = a.message.clone();
        // Different file groups (gap > 3): forced into separate groups.
        let findings = vec![a, finding("src/z.rs", Some(1), Severity::Warning, "R9"), b];
        let plan =
            plan_inline_comments(&findings, &HashSet::new(), &ProximityMap::default(), 10);
        let posted_files: Vec<&str> = plan
            .posts
            .iter()
            .map(|p| p.comment.file.as_str())
            .collect();
        assert_eq!(plan.skipped_duplicates, 1);
        assert_eq!(posted_files, vec!["src/a.rs", "src/z.rs"]);
    }

    #[test]
    fn file_level_findings_are_not_posted_inline() {
        let findings = vec![finding("src/a.rs", None, Severity::Error, "R1")];
        let plan =
            plan_inline_comments(&findings, &HashSet::new(), &ProximityMap::default(), 10);
        assert!(plan.posts.is_empty());
        assert_eq!(plan.skipped_duplicates, 0);
    }

    #[test]
    fn annotations_skip_file_level_and_map_levels() {
        let findings = vec![
            finding("src/a.rs", Some(3), Severity::Error, "R1"),
            finding("src/a.rs", None, Severity::Warning, "R2"),
        ];
        let anns = build_annotations(&findings);
        assert_eq!(anns.len(), 1);
        assert_eq!(anns[0].annotation_level, "failure");
        assert_eq!(anns[0].start_line, 3);
    }
}
