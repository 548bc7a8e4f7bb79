//! Tolerant unified-diff hunk parser.
//!
//! Features:
//! - Works on hunks-only input; file headers (---/+++) are not required.
//! - `@@ -a,b +c,d @@` headers establish the new-file start line; a missing
//!   `,d` means one line.
//! - Ignores `\ No newline at end of file` marker lines.
//! - Unknown prefixes terminate the current hunk silently; the parser never
//!   fails on malformed input.

use std::collections::BTreeSet;

/// One line inside a hunk, positioned on the new side where applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkLine {
    Added { new_line: u32 },
    Context { new_line: u32 },
    Removed,
}

/// A parsed hunk. Only the new-file coordinates matter downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<HunkLine>,
}

/// Commentable line numbers for one file, built once per run.
#[derive(Debug, Clone, Default)]
pub struct LineMapping {
    /// Added ∪ context: everything present on the new side of the diff.
    pub all: BTreeSet<u32>,
    pub added: BTreeSet<u32>,
    pub context: BTreeSet<u32>,
    pub hunks: Vec<DiffHunk>,
}

/// Parse a unified diff patch into hunks. An empty or header-less patch
/// yields no hunks and contributes no lines.
pub fn parse_patch(patch: &str) -> Vec<DiffHunk> {
    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut cur: Option<DiffHunk> = None;
    let mut new_line = 0u32;

    for line in patch.lines() {
        if line.starts_with("@@") {
            if let Some(h) = cur.take() {
                if !h.lines.is_empty() {
                    hunks.push(h);
                }
            }
            match parse_hunk_header(line) {
                Some((new_start, new_len)) => {
                    new_line = new_start;
                    cur = Some(DiffHunk {
                        new_start,
                        new_lines: new_len,
                        lines: Vec::new(),
                    });
                }
                None => {
                    cur = None;
                }
            }
            continue;
        }

        // "\ No newline at end of file" is not diff content.
        if line.starts_with('\\') {
            continue;
        }

        let Some(hunk) = cur.as_mut() else {
            // Arbitrary non-hunk content between hunks is ignored.
            continue;
        };

        if line.starts_with('+') {
            hunk.lines.push(HunkLine::Added { new_line });
            new_line += 1;
        } else if line.starts_with('-') {
            hunk.lines.push(HunkLine::Removed);
        } else if line.starts_with(' ') || line.is_empty() {
            // Some producers emit bare empty lines for empty context lines.
            hunk.lines.push(HunkLine::Context { new_line });
            new_line += 1;
        } else {
            // Unknown prefix: hunk is over; skip until the next header.
            if let Some(h) = cur.take() {
                if !h.lines.is_empty() {
                    hunks.push(h);
                }
            }
        }
    }

    if let Some(h) = cur.take() {
        if !h.lines.is_empty() {
            hunks.push(h);
        }
    }
    hunks
}

/// Build the per-file commentable line sets from a patch.
pub fn line_mapping(patch: &str) -> LineMapping {
    let hunks = parse_patch(patch);
    let mut mapping = LineMapping::default();
    for hunk in &hunks {
        for line in &hunk.lines {
            match line {
                HunkLine::Added { new_line } => {
                    mapping.added.insert(*new_line);
                    mapping.all.insert(*new_line);
                }
                HunkLine::Context { new_line } => {
                    mapping.context.insert(*new_line);
                    mapping.all.insert(*new_line);
                }
                HunkLine::Removed => {}
            }
        }
    }
    mapping.hunks = hunks;
    mapping
}

/// Map 1-based diff ordinals (position within the patch text, headers
/// included) to new-file lines. LLM agents sometimes count this way.
pub fn ordinal_line_map(patch: &str) -> Vec<Option<u32>> {
    let mut out = Vec::new();
    let mut new_line = 0u32;
    let mut in_hunk = false;

    for line in patch.lines() {
        if line.starts_with("@@") {
            match parse_hunk_header(line) {
                Some((start, _)) => {
                    new_line = start;
                    in_hunk = true;
                }
                None => in_hunk = false,
            }
            out.push(None);
            continue;
        }
        if !in_hunk || line.starts_with('\\') {
            out.push(None);
            continue;
        }
        if line.starts_with('+') {
            out.push(Some(new_line));
            new_line += 1;
        } else if line.starts_with('-') {
            out.push(None);
        } else if line.starts_with(' ') || line.is_empty() {
            out.push(Some(new_line));
            new_line += 1;
        } else {
            in_hunk = false;
            out.push(None);
        }
    }
    out
}

/// Parse `@@ -a,b +c,d @@ ...` into (new_start, new_len). Missing counts
/// default to 1.
fn parse_hunk_header(line: &str) -> Option<(u32, u32)> {
    let body = line.trim_start_matches('@').trim_end();
    let plus = body.find('+')?;
    let after = &body[plus + 1..];
    let nums: &str = after.split(|c: char| c == ' ' || c == '@').next()?;
    let (start, len) = match nums.split_once(',') {
        Some((a, b)) => (a.parse().ok()?, b.parse().ok()?),
        None => (nums.parse().ok()?, 1),
    };
    Some((start, len))
}
