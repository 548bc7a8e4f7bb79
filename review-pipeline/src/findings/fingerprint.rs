//! Stable finding identity: fingerprints, dedupe keys, and wire markers.
//!
//! The fingerprint deliberately excludes the source agent so the same issue
//! found by two analyzers collapses to one identity. Message normalization
//! neutralizes drifting line references before hashing.
//!
//! The HTML-comment marker format is a wire protocol shared with previously
//! posted comments; the prefix is a compile-time constant and is never built
//! from user input.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::Finding;

/// Marker wrapped around a dedupe key inside posted comment bodies.
pub const MARKER_PREFIX: &str = "<!-- odd-ai-reviewers:fingerprint:v1:";
pub const MARKER_SUFFIX: &str = " -->";

/// Fingerprint length in hex characters.
pub const FINGERPRINT_HEX_LEN: usize = 32;

fn line_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"line \d+").unwrap())
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!-- odd-ai-reviewers:fingerprint:v1:([^>]*?) -->").unwrap()
    })
}

/// Lowercase, collapse whitespace, and replace `line N` references so the
/// same message re-reported on a shifted line hashes identically.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let neutral = line_token_re().replace_all(&lowered, "line N");
    neutral.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 32-hex stable identity over (rule component, file, normalized message).
pub fn fingerprint(finding: &Finding) -> String {
    let rule_component = match &finding.rule_id {
        Some(rule) if !rule.trim().is_empty() => rule.clone(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(finding.message.as_bytes());
            format!("{:x}", hasher.finalize())[..16].to_string()
        }
    };
    let mut hasher = Sha256::new();
    hasher.update(rule_component.as_bytes());
    hasher.update(b":");
    hasher.update(finding.file.as_bytes());
    hasher.update(b":");
    hasher.update(normalize_message(&finding.message).as_bytes());
    format!("{:x}", hasher.finalize())[..FINGERPRINT_HEX_LEN].to_string()
}

/// The finding's fingerprint if already set and well-formed, else derived.
pub fn effective_fingerprint(finding: &Finding) -> String {
    match &finding.fingerprint {
        Some(fp) if is_well_formed_fingerprint(fp) => fp.clone(),
        _ => fingerprint(finding),
    }
}

pub fn is_well_formed_fingerprint(s: &str) -> bool {
    s.len() == FINGERPRINT_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `fingerprint:file:line` with line 0 for file-level findings.
pub fn dedupe_key(finding: &Finding) -> String {
    format!(
        "{}:{}:{}",
        effective_fingerprint(finding),
        finding.file,
        finding.line.unwrap_or(0)
    )
}

/// Parsed form of a dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedDedupeKey {
    pub fingerprint: String,
    pub file: String,
    pub line: u32,
}

/// Recover (fingerprint, file, line) from a key. The file portion may itself
/// contain colons: the first 32 hex chars are the fingerprint and the last
/// `:N` is the line; everything between is the file.
pub fn parse_dedupe_key(key: &str) -> Option<ParsedDedupeKey> {
    if key.len() <= FINGERPRINT_HEX_LEN + 1 {
        return None;
    }
    let fingerprint = &key[..FINGERPRINT_HEX_LEN];
    if !is_well_formed_fingerprint(fingerprint) {
        return None;
    }
    let rest = key[FINGERPRINT_HEX_LEN..].strip_prefix(':')?;
    let (file, line_str) = rest.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    let line: u32 = line_str.parse().ok()?;
    Some(ParsedDedupeKey {
        fingerprint: fingerprint.to_string(),
        file: file.to_string(),
        line,
    })
}

/// Build the marker for one finding.
pub fn build_marker(finding: &Finding) -> String {
    build_marker_for_key(&dedupe_key(finding))
}

pub fn build_marker_for_key(key: &str) -> String {
    format!("{MARKER_PREFIX}{key}{MARKER_SUFFIX}")
}

/// Extract every marker payload (the raw key text) from a body. Payloads are
/// returned as-is; callers decide how to treat malformed keys.
pub fn extract_markers(body: &str) -> Vec<String> {
    marker_re()
        .captures_iter(body)
        .map(|c| c[1].to_string())
        .collect()
}

/// Remove our markers from a body. Lines that held nothing but a marker are
/// dropped entirely.
pub fn strip_markers(body: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in body.lines() {
        if marker_re().is_match(line) {
            let rest = marker_re().replace_all(line, "");
            if rest.trim().is_empty() {
                continue;
            }
            out.push(rest.into_owned());
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n").trim_end().to_string()
}
