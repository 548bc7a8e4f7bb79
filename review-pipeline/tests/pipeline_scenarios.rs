//! End-to-end fixtures for the finding pipeline: posting, re-run proximity,
//! grouped resolution, preflight, and failure semantics — all against the
//! pure planning stages, no forge.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use review_pipeline::config::Gating;
use review_pipeline::dedup::{ProximityMap, identify_stale_comments};
use review_pipeline::diff::{DiffFile, FileStatus, canonicalize_files};
use review_pipeline::findings::fingerprint::{
    build_marker_for_key, dedupe_key, extract_markers, parse_dedupe_key,
};
use review_pipeline::findings::{Finding, Severity};
use review_pipeline::forge::{CheckConclusion, ExistingComment};
use review_pipeline::report::{conclusion_for, plan_inline_comments};
use review_pipeline::resolution::{ResolutionAction, plan_resolutions};
use review_pipeline::resolve::{LineResolver, NormalizeOpts, normalize_findings_for_diff};

fn diff_adding_lines(path: &str, start: u32, count: u32) -> review_pipeline::diff::CanonicalDiff {
    let added: String = (0..count).map(|i| format!("+new line {}\n", start + i)).collect();
    canonicalize_files(vec![DiffFile {
        path: path.into(),
        status: FileStatus::Modified,
        previous_path: None,
        patch: Some(format!("@@ -{start},0 +{start},{count} @@\n{added}")),
        additions: count,
        deletions: 0,
    }])
    .unwrap()
}

fn finding(file: &str, line: Option<u32>, rule: Option<&str>, message: &str) -> Finding {
    Finding {
        severity: Severity::Warning,
        file: file.into(),
        line,
        end_line: None,
        message: message.into(),
        suggestion: None,
        rule_id: rule.map(str::to_string),
        source_agent: "semgrep".into(),
        fingerprint: None,
        metadata: BTreeMap::new(),
    }
}

// Scenario 1: a finding on a freshly added line is posted inline with the
// documented fingerprint.
#[test]
fn fresh_finding_is_posted_with_documented_fingerprint() {
    let diff = diff_adding_lines("src/a.ts", 10, 3);
    let resolver = LineResolver::from_diff(&diff);

    let input = vec![finding(
        "src/a.ts",
        Some(11),
        Some("R1"),
        "Missing null check on `value`",
    )];
    let normalized =
        normalize_findings_for_diff(input, &diff, &resolver, NormalizeOpts::default());
    assert_eq!(normalized.stats.valid, 1);

    let plan = plan_inline_comments(
        &normalized.findings,
        &HashSet::new(),
        &ProximityMap::default(),
        10,
    );
    assert_eq!(plan.posts.len(), 1);
    let post = &plan.posts[0];
    assert_eq!(post.comment.file, "src/a.ts");
    assert_eq!(post.comment.line, 11);
    assert!(post.comment.body.contains("Missing null check on `value`"));

    // The marker's fingerprint is sha256("R1:src/a.ts:missing null check on `value`").
    let mut hasher = Sha256::new();
    hasher.update(b"R1:src/a.ts:missing null check on `value`");
    let expected_fp = format!("{:x}", hasher.finalize())[..32].to_string();

    let markers = extract_markers(&post.comment.body);
    assert_eq!(markers.len(), 1);
    let parsed = parse_dedupe_key(&markers[0]).unwrap();
    assert_eq!(parsed.fingerprint, expected_fp);
    assert_eq!(parsed.file, "src/a.ts");
    assert_eq!(parsed.line, 11);
}

// Scenario 2: on a re-run where code shifted three lines, the prior-run
// comment suppresses a new post.
#[test]
fn rerun_after_shift_posts_nothing_new() {
    // Prior run: comment at line 11.
    let old = finding("src/a.ts", Some(11), Some("R1"), "Missing null check on `value`");
    let old_key = dedupe_key(&old);
    let existing_keys: HashSet<String> = [old_key.clone()].into();
    let parsed = parse_dedupe_key(&old_key).unwrap();
    let proximity = ProximityMap::from_keys([&parsed]);

    // This run: three blank lines were inserted above, issue now at 14.
    let diff = diff_adding_lines("src/a.ts", 10, 8);
    let resolver = LineResolver::from_diff(&diff);
    let normalized = normalize_findings_for_diff(
        vec![finding(
            "src/a.ts",
            Some(14),
            Some("R1"),
            "Missing null check on `value`",
        )],
        &diff,
        &resolver,
        NormalizeOpts::default(),
    );

    let plan = plan_inline_comments(&normalized.findings, &existing_keys, &proximity, 10);
    assert!(plan.posts.is_empty());
    assert_eq!(plan.skipped_duplicates, 1);

    // And the prior comment is not stale either: |14 - 11| <= 20.
    let stale = identify_stale_comments(&[parsed], &normalized.findings);
    assert!(stale.is_empty());
}

fn grouped_comment(keys: &[&str]) -> ExistingComment {
    let mut body = String::new();
    for (i, key) in keys.iter().enumerate() {
        let line = parse_dedupe_key(key).unwrap().line;
        body.push_str(&format!(
            "🟡 **Line {line}** (warning): grouped issue {n}\n\nwhy it matters {n}\n{marker}\n\n",
            n = i + 1,
            marker = build_marker_for_key(key),
        ));
    }
    ExistingComment {
        id: "77".into(),
        body: body.clone(),
        file: Some("src/a.rs".into()),
        line: Some(5),
        markers: extract_markers(&body),
    }
}

// Scenario 3: grouped comment with one active marker is partially struck,
// never fully resolved, active block preserved byte-for-byte.
#[test]
fn grouped_comment_with_active_marker_is_partially_struck() {
    let k1 = "00000000000000000000000000000011:src/a.rs:5";
    let k2 = "00000000000000000000000000000012:src/a.rs:7";
    let k3 = "00000000000000000000000000000013:src/a.rs:9";
    let comment = grouped_comment(&[k1, k2, k3]);

    let stale: HashSet<String> = [k1.to_string(), k3.to_string()].into();
    let actions = plan_resolutions(&[comment.clone()], &stale, "github");
    assert_eq!(actions.len(), 1);
    let ResolutionAction::StrikeStale { new_body, .. } = &actions[0] else {
        panic!("must not fully resolve while K2 is active");
    };

    assert!(!new_body.trim_start().starts_with("~~🟡 **Line 7**"));
    assert!(!new_body.contains("✅ Resolved - This issue appears to have been fixed."));
    for k in [k1, k2, k3] {
        assert!(new_body.contains(&build_marker_for_key(k)), "marker {k} lost");
    }

    // K2's block is byte-for-byte identical to the original rendering.
    let start = comment.body.find("🟡 **Line 7**").unwrap();
    let end = comment.body.find("🟡 **Line 9**").unwrap();
    assert!(new_body.contains(&comment.body[start..end]));

    // K1 and K3 blocks are struck.
    assert!(new_body.contains("~~🟡 **Line 5** (warning): grouped issue 1~~ ✅"));
    assert!(new_body.contains("~~🟡 **Line 9** (warning): grouped issue 3~~ ✅"));
}

// Scenario 4: all markers stale → full resolution, markers re-emitted,
// idempotent on repeat runs.
#[test]
fn fully_stale_grouped_comment_resolves_once() {
    let k1 = "00000000000000000000000000000021:src/a.rs:5";
    let k2 = "00000000000000000000000000000022:src/a.rs:7";
    let comment = grouped_comment(&[k1, k2]);

    let stale: HashSet<String> = [k1.to_string(), k2.to_string()].into();
    let actions = plan_resolutions(&[comment], &stale, "ado");
    assert_eq!(actions.len(), 1);
    let ResolutionAction::Resolve { new_body, .. } = &actions[0] else {
        panic!("expected full resolution");
    };
    assert!(new_body.trim_start().starts_with("~~"));
    assert!(new_body.contains("✅ Resolved - This issue appears to have been fixed."));
    assert!(new_body.contains(&build_marker_for_key(k1)));
    assert!(new_body.contains(&build_marker_for_key(k2)));

    // Second run over the resolved body: nothing further to write.
    let resolved = ExistingComment {
        id: "77".into(),
        body: new_body.clone(),
        file: Some("src/a.rs".into()),
        line: Some(5),
        markers: extract_markers(new_body),
    };
    assert!(plan_resolutions(&[resolved], &stale, "ado").is_empty());
}

// Scenario 5: two provider keys plus a conflicting MODEL and no explicit
// provider is a preflight configuration error.
#[test]
fn multi_key_ambiguity_fails_preflight() {
    use review_pipeline::forge::ForgeKind;
    use review_pipeline::orchestrator::preflight::run_preflight;

    let config: review_pipeline::ReviewConfig =
        serde_yaml::from_str("passes: [{name: ai, agents: [local_llm], required: true}]").unwrap();
    let env: BTreeMap<String, String> = [
        ("ANTHROPIC_API_KEY", "sk-ant-x"),
        ("OPENAI_API_KEY", "sk-oai-x"),
        ("MODEL", "gpt-4o-mini"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let err = run_preflight(&config, &env, ForgeKind::GitHub, None).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("multi-key ambiguity"), "got: {message}");
    assert!(message.contains("provider"));
}

// Scenario 6: a timed-out agent is a local failure; the run's gating is
// unaffected.
#[tokio::test]
async fn agent_timeout_is_local_and_does_not_gate() {
    use review_pipeline::agents::{AgentSpec, runtime::run_command_agent};
    use review_pipeline::findings::AgentResult;

    let spec = AgentSpec {
        id: "opencode",
        kind: review_pipeline::agents::AgentKind::LlmCommand,
        command: &["sleep", "30"],
        needs_llm_credentials: true,
        extra_env: &[],
    };
    let env: BTreeMap<String, String> =
        [("PATH".to_string(), "/usr/bin:/bin".to_string())].into();
    let result = run_command_agent(
        &spec,
        vec![],
        &env,
        Duration::from_millis(100),
        &CancellationToken::new(),
    )
    .await;

    let AgentResult::Failure {
        error,
        partial_findings,
    } = result
    else {
        panic!("expected failure");
    };
    assert_eq!(error, "timeout");
    assert!(partial_findings.is_empty());

    // No complete findings arrived, so gating still passes the run.
    assert_eq!(
        conclusion_for(&[], &Gating::default(), 0.0, false),
        CheckConclusion::Success
    );
}

// Boundary: an empty diff produces no findings and a successful conclusion.
#[test]
fn empty_diff_is_a_clean_success() {
    let diff = canonicalize_files(vec![]).unwrap();
    let resolver = LineResolver::from_diff(&diff);
    let normalized = normalize_findings_for_diff(vec![], &diff, &resolver, NormalizeOpts::default());
    assert!(normalized.findings.is_empty());
    assert_eq!(normalized.stats.total, 0);
    assert_eq!(
        conclusion_for(&normalized.findings, &Gating::default(), 0.0, false),
        CheckConclusion::Success
    );
}

// Invariant sweep: canonical paths and valid lines in everything planned.
#[test]
fn planned_posts_reference_only_valid_lines_and_canonical_paths() {
    let diff = diff_adding_lines("src/deep/mod.rs", 30, 5);
    let resolver = LineResolver::from_diff(&diff);
    let input = vec![
        finding("./src/deep/mod.rs", Some(31), Some("R1"), "one"),
        finding("/src/deep/mod.rs", Some(200), Some("R2"), "two"),
        finding("src\\deep\\mod.rs", None, Some("R3"), "three"),
    ];
    let normalized =
        normalize_findings_for_diff(input, &diff, &resolver, NormalizeOpts::default());
    for f in &normalized.findings {
        assert!(!f.file.starts_with('/'));
        assert!(!f.file.contains('\\'));
        assert!(!f.file.contains("./"));
    }
    let plan = plan_inline_comments(
        &normalized.findings,
        &HashSet::new(),
        &ProximityMap::default(),
        10,
    );
    for post in &plan.posts {
        let check = resolver.validate_line(
            &post.comment.file,
            post.comment.line,
            review_pipeline::resolve::ValidateOpts::default(),
        );
        assert!(check.valid, "planned line must be commentable");
    }
}
