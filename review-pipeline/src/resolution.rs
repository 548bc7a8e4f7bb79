//! Stale-comment resolution, including grouped partial resolution.
//!
//! A previously posted comment may carry several fingerprint markers (one
//! grouped body covering adjacent findings). Resolution is strictly
//! per-comment:
//!
//! - every well-formed marker stale → resolve the whole comment;
//! - some stale → strike through only the stale finding blocks, leaving
//!   every other byte of the body untouched and all markers in place;
//! - any malformed marker → warn once and leave the comment alone.
//!
//! One structured `comment_resolution` log line is emitted per processed
//! comment. Raw fingerprints stay out of the log payloads.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::findings::fingerprint::{extract_markers, parse_dedupe_key, strip_markers};
use crate::forge::ExistingComment;

/// Footer appended to a fully resolved body.
pub const RESOLVED_FOOTER: &str = "✅ Resolved - This issue appears to have been fixed.";

/// Start of one finding block inside a grouped body: emoji + `**Line N**`.
fn block_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(?:🔴|🟡|🔵) \*\*Line \d+\*\*").unwrap())
}

/// Planned update for one existing comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Every marker is stale: replace the body with the resolved form.
    Resolve { comment_id: String, new_body: String },
    /// Some markers are stale: strike through their blocks only.
    StrikeStale { comment_id: String, new_body: String },
}

impl ResolutionAction {
    pub fn comment_id(&self) -> &str {
        match self {
            ResolutionAction::Resolve { comment_id, .. } => comment_id,
            ResolutionAction::StrikeStale { comment_id, .. } => comment_id,
        }
    }

    pub fn new_body(&self) -> &str {
        match self {
            ResolutionAction::Resolve { new_body, .. } => new_body,
            ResolutionAction::StrikeStale { new_body, .. } => new_body,
        }
    }
}

/// Decide the update (if any) for each existing comment given the stale key
/// set. Pure: no I/O beyond the structured logs.
pub fn plan_resolutions(
    comments: &[ExistingComment],
    stale_keys: &HashSet<String>,
    platform: &str,
) -> Vec<ResolutionAction> {
    let mut actions = Vec::new();

    for comment in comments {
        let markers = extract_markers(&comment.body);
        if markers.is_empty() {
            continue;
        }

        if markers.iter().any(|m| parse_dedupe_key(m).is_none()) {
            info!(
                "{}",
                serde_json::json!({
                    "event": "comment_resolution_warning",
                    "platform": platform,
                    "commentId": comment.id,
                    "reason": "malformed_marker",
                })
            );
            continue;
        }

        let unique: HashSet<&String> = markers.iter().collect();
        let stale: Vec<&String> = unique
            .iter()
            .copied()
            .filter(|m| stale_keys.contains(m.as_str()))
            .collect();
        if stale.is_empty() {
            continue;
        }

        let fully_stale = stale.len() == unique.len();
        let already_resolved = is_resolved_body(&comment.body);

        let action = if fully_stale {
            if already_resolved {
                // Nothing to write on repeat runs where everything stays stale.
                None
            } else {
                Some(ResolutionAction::Resolve {
                    comment_id: comment.id.clone(),
                    new_body: resolved_body(&comment.body, &markers),
                })
            }
        } else {
            let stale_set: HashSet<&str> = stale.iter().map(|s| s.as_str()).collect();
            let struck = strike_stale_blocks(&comment.body, &stale_set);
            if struck == comment.body {
                None
            } else {
                Some(ResolutionAction::StrikeStale {
                    comment_id: comment.id.clone(),
                    new_body: struck,
                })
            }
        };

        info!(
            "{}",
            serde_json::json!({
                "event": "comment_resolution",
                "platform": platform,
                "commentId": comment.id,
                "fingerprintCount": unique.len(),
                "staleCount": stale.len(),
                "resolved": fully_stale,
            })
        );

        if let Some(action) = action {
            actions.push(action);
        }
    }

    actions
}

/// A body we already rewrote into resolved form.
fn is_resolved_body(body: &str) -> bool {
    body.trim_start().starts_with("~~") && body.contains(RESOLVED_FOOTER)
}

/// Wrap the marker-stripped body in strike-through, append the resolved
/// footer, and re-emit every original marker verbatim.
fn resolved_body(body: &str, markers: &[String]) -> String {
    let stripped = strip_markers(body);
    let mut out = format!("~~{}~~\n\n{}\n", stripped.trim(), RESOLVED_FOOTER);
    for marker in markers {
        out.push_str(&crate::findings::fingerprint::build_marker_for_key(marker));
        out.push('\n');
    }
    out
}

/// Strike through only the blocks whose marker is stale. Blocks are located
/// by their emoji + `**Line N**` header; each block ends where the next one
/// starts. Marker lines and already-struck lines pass through untouched, and
/// blocks that stay active are copied byte-for-byte.
fn strike_stale_blocks(body: &str, stale: &HashSet<&str>) -> String {
    let starts: Vec<usize> = block_header_re().find_iter(body).map(|m| m.start()).collect();
    if starts.is_empty() {
        return body.to_string();
    }

    let mut out = String::with_capacity(body.len() + 64);
    out.push_str(&body[..starts[0]]);

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(body.len());
        let block = &body[start..end];
        let block_markers = extract_markers(block);
        let is_stale = !block_markers.is_empty()
            && block_markers.iter().all(|m| stale.contains(m.as_str()));
        if is_stale {
            out.push_str(&strike_block(block));
        } else {
            out.push_str(block);
        }
    }
    out
}

/// Strike one block's text lines, appending a ✅ to the header line.
fn strike_block(block: &str) -> String {
    let mut out = String::with_capacity(block.len() + 16);
    let mut is_header = true;
    for line in block.split_inclusive('\n') {
        let (text, newline) = match line.strip_suffix('\n') {
            Some(t) => (t, "\n"),
            None => (line, ""),
        };
        let trimmed = text.trim();
        let keep_as_is = trimmed.is_empty()
            || trimmed.starts_with(crate::findings::fingerprint::MARKER_PREFIX)
            || (trimmed.starts_with("~~") && trimmed.ends_with("~~"))
            || trimmed.ends_with('✅');
        if keep_as_is {
            out.push_str(text);
        } else if is_header {
            out.push_str(&format!("~~{text}~~ ✅"));
            is_header = false;
        } else {
            out.push_str(&format!("~~{text}~~"));
        }
        out.push_str(newline);
    }
    out
}
