//! Changed-file collection from the CI workspace checkout.
//!
//! The review runs inside a CI job with the repository already on disk, so
//! the diff source is `git diff` against the merge base of the target
//! branch. Output parsing is line-oriented over `diff --git` sections; no
//! shell is involved and the argument list is fixed.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::diff::{DiffFile, FileStatus};
use crate::errors::{Error, PrResult};

/// Run `git diff` and parse the result into per-file changes.
///
/// `base` is typically `origin/<target-branch>`; the triple-dot form diffs
/// against the merge base so unrelated target-branch churn is excluded.
pub async fn collect_changed_files(repo_dir: &Path, base: &str, head: &str) -> PrResult<Vec<DiffFile>> {
    let range = format!("{base}...{head}");
    debug!(range = %range, "diff: git diff --find-renames");
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(["diff", "--no-color", "--find-renames", "--unified=3", &range])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Validation(format!("failed to run git diff: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Validation(format!(
            "git diff failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_git_diff(&text))
}

/// Split full `git diff` output into per-file `DiffFile` records.
pub fn parse_git_diff(text: &str) -> Vec<DiffFile> {
    let mut out: Vec<DiffFile> = Vec::new();
    let mut cur: Option<DiffFile> = None;
    let mut patch_buf = String::new();
    let mut in_patch = false;

    let flush = |cur: &mut Option<DiffFile>, patch_buf: &mut String, out: &mut Vec<DiffFile>| {
        if let Some(mut f) = cur.take() {
            if !patch_buf.is_empty() {
                f.patch = Some(std::mem::take(patch_buf));
            }
            out.push(f);
        }
        patch_buf.clear();
    };

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut cur, &mut patch_buf, &mut out);
            in_patch = false;
            let (a_path, b_path) = split_ab_paths(rest);
            cur = Some(DiffFile {
                path: b_path,
                status: FileStatus::Modified,
                previous_path: if a_path.is_empty() { None } else { Some(a_path) },
                patch: None,
                additions: 0,
                deletions: 0,
            });
            continue;
        }

        let Some(f) = cur.as_mut() else { continue };

        if line.starts_with("@@") {
            in_patch = true;
        }
        if in_patch {
            patch_buf.push_str(line);
            patch_buf.push('\n');
            if line.starts_with('+') && !line.starts_with("+++") {
                f.additions += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                f.deletions += 1;
            }
            continue;
        }

        // Extended header lines before the first hunk.
        if line.starts_with("new file mode") {
            f.status = FileStatus::Added;
        } else if line.starts_with("deleted file mode") {
            f.status = FileStatus::Deleted;
            // For deletions the post-image path is the pre-image path.
            if let Some(prev) = &f.previous_path {
                f.path = prev.clone();
            }
        } else if let Some(from) = line.strip_prefix("rename from ") {
            f.status = FileStatus::Renamed;
            f.previous_path = Some(from.to_string());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            f.path = to.to_string();
        } else if let Some(b) = line.strip_prefix("+++ b/") {
            f.path = b.to_string();
        }
    }
    flush(&mut cur, &mut patch_buf, &mut out);

    // A plain modification carries identical a/b paths; drop the noise.
    for f in &mut out {
        if f.status != FileStatus::Renamed {
            f.previous_path = None;
        }
    }
    out
}

/// Split `a/<path> b/<path>` from a `diff --git` line. Quoted paths (spaces,
/// unicode escapes) keep their quotes stripped but are otherwise unprocessed.
fn split_ab_paths(rest: &str) -> (String, String) {
    let unquote = |s: &str| s.trim_matches('"').to_string();
    if let Some(idx) = rest.find(" b/") {
        let a = rest[..idx].trim_start_matches("a/");
        let b = &rest[idx + 3..];
        return (unquote(a), unquote(b));
    }
    // Fallback: whitespace split.
    let mut parts = rest.split_whitespace();
    let a = parts.next().unwrap_or_default().trim_start_matches("a/");
    let b = parts.next().unwrap_or_default().trim_start_matches("b/");
    (unquote(a), unquote(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        "diff --git a/src/lib.rs b/src/lib.rs\n",
        "index 1111111..2222222 100644\n",
        "--- a/src/lib.rs\n",
        "+++ b/src/lib.rs\n",
        "@@ -1,3 +1,4 @@\n",
        " fn main() {\n",
        "+    init();\n",
        " }\n",
        " \n",
        "diff --git a/gone.txt b/gone.txt\n",
        "deleted file mode 100644\n",
        "index 3333333..0000000\n",
        "--- a/gone.txt\n",
        "+++ /dev/null\n",
        "@@ -1 +0,0 @@\n",
        "-bye\n",
        "diff --git a/old.rs b/new.rs\n",
        "similarity index 90%\n",
        "rename from old.rs\n",
        "rename to new.rs\n",
    );

    #[test]
    fn parses_modified_deleted_and_renamed() {
        let files = parse_git_diff(SAMPLE);
        assert_eq!(files.len(), 3);

        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].status, FileStatus::Modified);
        assert_eq!(files[0].additions, 1);
        assert!(files[0].patch.as_deref().unwrap().starts_with("@@ -1,3 +1,4 @@"));

        assert_eq!(files[1].path, "gone.txt");
        assert_eq!(files[1].status, FileStatus::Deleted);
        assert_eq!(files[1].deletions, 1);

        assert_eq!(files[2].path, "new.rs");
        assert_eq!(files[2].status, FileStatus::Renamed);
        assert_eq!(files[2].previous_path.as_deref(), Some("old.rs"));
        assert!(files[2].patch.is_none());
    }

    #[test]
    fn empty_diff_parses_to_no_files() {
        assert!(parse_git_diff("").is_empty());
    }
}
