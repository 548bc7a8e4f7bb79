//! File-based agent result cache (JSON on disk).
//!
//! Re-running the pipeline on the same head SHA should not re-spend LLM
//! budget. Key: SHA256 over (pr, head_sha, config hash, agent id, schema
//! version); the schema version changes whenever `AgentResult`'s serialized
//! shape does, so stale layouts simply miss instead of crashing.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::findings::AgentResult;

/// Bump when the serialized `AgentResult` layout changes.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Deterministic cache path for one agent invocation.
fn key_path(
    root: &Path,
    pr_number: u64,
    head_sha: &str,
    config_hash: &str,
    agent_id: &str,
) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{pr_number}:{head_sha}:{config_hash}:{agent_id}:{CACHE_SCHEMA_VERSION}"
    ));
    let digest = format!("{:x}", hasher.finalize());
    root.join(agent_id).join(format!("{}.json", &digest[..16]))
}

/// Load a cached result. Any read or schema failure is a miss.
pub async fn load(
    root: &Path,
    pr_number: u64,
    head_sha: &str,
    config_hash: &str,
    agent_id: &str,
) -> Option<AgentResult> {
    let path = key_path(root, pr_number, head_sha, config_hash, agent_id);
    let bytes = fs::read(&path).await.ok()?;
    match serde_json::from_slice::<AgentResult>(&bytes) {
        Ok(result) => {
            debug!(agent_id, path = %path.display(), "cache: hit");
            Some(result)
        }
        Err(e) => {
            // Legacy or corrupt entry: treat as a miss.
            debug!(agent_id, error = %e, "cache: entry failed schema validation, ignoring");
            None
        }
    }
}

/// Store a successful result. Failures and skips are not cached.
pub async fn store(
    root: &Path,
    pr_number: u64,
    head_sha: &str,
    config_hash: &str,
    agent_id: &str,
    result: &AgentResult,
) {
    if !matches!(result, AgentResult::Success { .. }) {
        return;
    }
    let path = key_path(root, pr_number, head_sha, config_hash, agent_id);
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir).await {
            warn!(error = %e, "cache: failed to create directory");
            return;
        }
    }
    let json = match serde_json::to_vec(result) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "cache: failed to serialize result");
            return;
        }
    };
    if let Err(e) = fs::write(&path, json).await {
        warn!(path = %path.display(), error = %e, "cache: failed to write entry");
    } else {
        debug!(agent_id, path = %path.display(), "cache: stored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{AgentResult, Finding, Severity};
    use std::collections::BTreeMap;

    fn success() -> AgentResult {
        AgentResult::Success {
            findings: vec![Finding {
                severity: Severity::Info,
                file: "src/a.rs".into(),
                line: Some(1),
                end_line: None,
                message: "cached".into(),
                suggestion: None,
                rule_id: None,
                source_agent: "semgrep".into(),
                fingerprint: None,
                metadata: BTreeMap::new(),
            }],
        }
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let root = std::env::temp_dir().join("pr-ai-review-cache-test-a");
        let _ = fs::remove_dir_all(&root).await;
        store(&root, 7, "abc123", "cfg1", "semgrep", &success()).await;
        let hit = load(&root, 7, "abc123", "cfg1", "semgrep").await;
        assert!(matches!(hit, Some(AgentResult::Success { findings }) if findings.len() == 1));
        // Different config hash misses.
        assert!(load(&root, 7, "abc123", "cfg2", "semgrep").await.is_none());
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn corrupt_entries_are_misses() {
        let root = std::env::temp_dir().join("pr-ai-review-cache-test-b");
        let _ = fs::remove_dir_all(&root).await;
        let path = key_path(&root, 7, "abc123", "cfg1", "semgrep");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"{\"status\":\"no_such_variant\"}").await.unwrap();
        assert!(load(&root, 7, "abc123", "cfg1", "semgrep").await.is_none());
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let root = std::env::temp_dir().join("pr-ai-review-cache-test-c");
        let _ = fs::remove_dir_all(&root).await;
        let failure = AgentResult::Failure {
            error: "timeout".into(),
            partial_findings: vec![],
        };
        store(&root, 7, "abc123", "cfg1", "semgrep", &failure).await;
        assert!(load(&root, 7, "abc123", "cfg1", "semgrep").await.is_none());
        let _ = fs::remove_dir_all(&root).await;
    }
}
