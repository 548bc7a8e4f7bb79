//! Diff model and path canonicalization.
//!
//! Every downstream consumer (line resolver, dedupe keys, reporter) operates
//! on canonical paths only: forward slashes, no leading slash, no `.` or
//! `..` segments. Mixing raw and canonical paths is a defect class, so the
//! conversion happens exactly once, here, at the boundary.

pub mod git;
pub mod parser;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::{ParseError, PrResult};

/// Change kind for one file in the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One changed file as delivered by the diff source (paths not yet canonical).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub status: FileStatus,
    /// Previous path for renames.
    #[serde(default)]
    pub previous_path: Option<String>,
    /// Raw unified-diff patch. Hunk headers inside remain authoritative;
    /// the patch text is never rewritten.
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

/// Canonical view of the change set used everywhere downstream.
#[derive(Debug, Clone, Default)]
pub struct CanonicalDiff {
    pub files: Vec<DiffFile>,
    /// Deleted paths, kept separately as a second line of defense: findings
    /// on deleted files are always downgraded or dropped.
    pub deleted_files: BTreeSet<String>,
    /// Old canonical path → new canonical path for renames.
    renames: BTreeMap<String, String>,
}

impl CanonicalDiff {
    /// Map a canonical path through rename tracking: a finding referencing
    /// a renamed file's old path resolves to the new path.
    pub fn resolve_alias<'a>(&'a self, path: &'a str) -> &'a str {
        self.renames.get(path).map(String::as_str).unwrap_or(path)
    }

    pub fn file(&self, path: &str) -> Option<&DiffFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Canonicalize one repo-relative path.
///
/// Strips a single leading slash, folds backslashes to forward slashes,
/// removes `.` segments, and rejects `..`. Purely lexical; the filesystem
/// is never consulted.
pub fn canonicalize_path(raw: &str) -> Result<String, ParseError> {
    let slashed = raw.replace('\\', "/");
    let trimmed = slashed.strip_prefix('/').unwrap_or(&slashed);
    let mut segments: Vec<&str> = Vec::new();
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(ParseError::InvalidPath {
                    path: raw.to_string(),
                    reason: "path traversal segment",
                });
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(ParseError::InvalidPath {
            path: raw.to_string(),
            reason: "empty path",
        });
    }
    Ok(segments.join("/"))
}

/// Produce the canonical change-set view.
pub fn canonicalize_files(files: Vec<DiffFile>) -> PrResult<CanonicalDiff> {
    let mut out = CanonicalDiff::default();
    for mut f in files {
        f.path = canonicalize_path(&f.path)?;
        if let Some(prev) = f.previous_path.take() {
            let prev = canonicalize_path(&prev)?;
            if f.status == FileStatus::Renamed && prev != f.path {
                out.renames.insert(prev.clone(), f.path.clone());
            }
            f.previous_path = Some(prev);
        }
        if f.status == FileStatus::Deleted {
            out.deleted_files.insert(f.path.clone());
        }
        out.files.push(f);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_are_normalized() {
        assert_eq!(canonicalize_path("/src/a.rs").unwrap(), "src/a.rs");
        assert_eq!(canonicalize_path("./src/a.rs").unwrap(), "src/a.rs");
        assert_eq!(canonicalize_path("src\\win\\a.rs").unwrap(), "src/win/a.rs");
        assert_eq!(canonicalize_path("src/./a.rs").unwrap(), "src/a.rs");
        assert_eq!(canonicalize_path("src//a.rs").unwrap(), "src/a.rs");
    }

    #[test]
    fn traversal_and_empty_paths_are_rejected() {
        assert!(canonicalize_path("src/../etc/passwd").is_err());
        assert!(canonicalize_path("..").is_err());
        assert!(canonicalize_path("/").is_err());
        assert!(canonicalize_path("").is_err());
    }

    #[test]
    fn deleted_files_are_collected() {
        let diff = canonicalize_files(vec![
            DiffFile {
                path: "/gone.rs".into(),
                status: FileStatus::Deleted,
                previous_path: None,
                patch: None,
                additions: 0,
                deletions: 10,
            },
            DiffFile {
                path: "kept.rs".into(),
                status: FileStatus::Modified,
                previous_path: None,
                patch: None,
                additions: 1,
                deletions: 1,
            },
        ])
        .unwrap();
        assert!(diff.deleted_files.contains("gone.rs"));
        assert!(!diff.deleted_files.contains("kept.rs"));
    }

    #[test]
    fn rename_alias_resolves_old_path_to_new() {
        let diff = canonicalize_files(vec![DiffFile {
            path: "src/new_name.rs".into(),
            status: FileStatus::Renamed,
            previous_path: Some("src/old_name.rs".into()),
            patch: None,
            additions: 0,
            deletions: 0,
        }])
        .unwrap();
        assert_eq!(diff.resolve_alias("src/old_name.rs"), "src/new_name.rs");
        assert_eq!(diff.resolve_alias("src/other.rs"), "src/other.rs");
    }
}
