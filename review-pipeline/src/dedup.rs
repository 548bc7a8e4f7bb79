//! Cross-run duplicate suppression and stale-comment detection.
//!
//! When code shifts between pushes the same issue resurfaces on a nearby
//! line while the prior run's comment still sits on the old one. Exact
//! dedupe keys miss that case, so existing comments are also indexed by
//! (fingerprint, file) with every line they were seen at; a new finding
//! within the proximity threshold of any of those lines is the same issue
//! that moved.

use std::collections::{BTreeMap, HashSet};

use crate::findings::fingerprint::{ParsedDedupeKey, dedupe_key, effective_fingerprint};
use crate::findings::Finding;

/// Lines within this distance refer to the same issue across runs.
pub const LINE_PROXIMITY_THRESHOLD: u32 = 20;

/// (fingerprint, file) → lines at which existing comments carry that
/// identity. Owned by the reporter's publish call for the run's duration.
#[derive(Debug, Clone, Default)]
pub struct ProximityMap {
    map: BTreeMap<(String, String), Vec<u32>>,
}

impl ProximityMap {
    /// Index existing comment keys.
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a ParsedDedupeKey>) -> Self {
        let mut map: BTreeMap<(String, String), Vec<u32>> = BTreeMap::new();
        for key in keys {
            map.entry((key.fingerprint.clone(), key.file.clone()))
                .or_default()
                .push(key.line);
        }
        Self { map }
    }

    pub fn lines_for(&self, fingerprint: &str, file: &str) -> &[u32] {
        self.map
            .get(&(fingerprint.to_string(), file.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record a line just posted so later findings in the same run see it.
    /// The line list is replaced wholesale, never mutated in place.
    pub fn record(&mut self, fingerprint: &str, file: &str, line: u32) {
        let key = (fingerprint.to_string(), file.to_string());
        let mut lines = self.map.get(&key).cloned().unwrap_or_default();
        lines.push(line);
        self.map.insert(key, lines);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// True when `finding` is already represented by an existing comment:
/// exact dedupe key match, or any existing line for the same
/// (fingerprint, file) within the proximity threshold.
pub fn is_duplicate_by_proximity(
    finding: &Finding,
    exact_keys: &HashSet<String>,
    proximity: &ProximityMap,
) -> bool {
    if exact_keys.contains(&dedupe_key(finding)) {
        return true;
    }
    let fp = effective_fingerprint(finding);
    let line = finding.line.unwrap_or(0);
    proximity
        .lines_for(&fp, &finding.file)
        .iter()
        .any(|existing| existing.abs_diff(line) <= LINE_PROXIMITY_THRESHOLD)
}

/// Keys of existing comments whose identity no current finding matches
/// within the proximity threshold. These comments are candidates for
/// resolution.
pub fn identify_stale_comments(
    existing_keys: &[ParsedDedupeKey],
    current_findings: &[Finding],
) -> HashSet<String> {
    // Index current findings the same way the proximity map indexes
    // existing comments.
    let mut current: BTreeMap<(&str, &str), Vec<u32>> = BTreeMap::new();
    let fingerprints: Vec<String> = current_findings
        .iter()
        .map(effective_fingerprint)
        .collect();
    for (f, fp) in current_findings.iter().zip(&fingerprints) {
        current
            .entry((fp.as_str(), f.file.as_str()))
            .or_default()
            .push(f.line.unwrap_or(0));
    }

    existing_keys
        .iter()
        .filter(|key| {
            let lines = current.get(&(key.fingerprint.as_str(), key.file.as_str()));
            match lines {
                None => true,
                Some(lines) => !lines
                    .iter()
                    .any(|l| l.abs_diff(key.line) <= LINE_PROXIMITY_THRESHOLD),
            }
        })
        .map(|key| format!("{}:{}:{}", key.fingerprint, key.file, key.line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::fingerprint::parse_dedupe_key;
    use crate::findings::Severity;
    use std::collections::BTreeMap as Meta;

    fn finding(file: &str, line: Option<u32>, rule: &str) -> Finding {
        Finding {
            severity: Severity::Warning,
            file: file.into(),
            line,
            end_line: None,
            message: "same issue text".into(),
            suggestion: None,
            rule_id: Some(rule.into()),
            source_agent: "semgrep".into(),
            fingerprint: None,
            metadata: Meta::new(),
        }
    }

    fn key_for(f: &Finding) -> ParsedDedupeKey {
        parse_dedupe_key(&dedupe_key(f)).unwrap()
    }

    #[test]
    fn exact_key_is_a_duplicate() {
        let f = finding("src/a.rs", Some(11), "R1");
        let keys: HashSet<String> = [dedupe_key(&f)].into();
        assert!(is_duplicate_by_proximity(&f, &keys, &ProximityMap::default()));
    }

    #[test]
    fn nearby_line_is_a_duplicate_within_threshold() {
        let old = finding("src/a.rs", Some(11), "R1");
        let map = ProximityMap::from_keys([&key_for(&old)]);
        let moved = finding("src/a.rs", Some(14), "R1");
        assert!(is_duplicate_by_proximity(&moved, &HashSet::new(), &map));

        let far = finding("src/a.rs", Some(32), "R1");
        assert!(!is_duplicate_by_proximity(&far, &HashSet::new(), &map));

        let edge = finding("src/a.rs", Some(31), "R1");
        assert!(is_duplicate_by_proximity(&edge, &HashSet::new(), &map));
    }

    #[test]
    fn proximity_is_symmetric() {
        let a = finding("src/a.rs", Some(30), "R1");
        let b = finding("src/a.rs", Some(14), "R1");
        let map_b = ProximityMap::from_keys([&key_for(&b)]);
        let map_a = ProximityMap::from_keys([&key_for(&a)]);
        assert_eq!(
            is_duplicate_by_proximity(&a, &HashSet::new(), &map_b),
            is_duplicate_by_proximity(&b, &HashSet::new(), &map_a),
        );
    }

    #[test]
    fn different_file_or_fingerprint_is_not_a_duplicate() {
        let old = finding("src/a.rs", Some(11), "R1");
        let map = ProximityMap::from_keys([&key_for(&old)]);
        assert!(!is_duplicate_by_proximity(
            &finding("src/b.rs", Some(11), "R1"),
            &HashSet::new(),
            &map
        ));
        assert!(!is_duplicate_by_proximity(
            &finding("src/a.rs", Some(11), "R2"),
            &HashSet::new(),
            &map
        ));
    }

    #[test]
    fn recorded_lines_are_seen_by_later_findings() {
        let mut map = ProximityMap::default();
        let f = finding("src/a.rs", Some(50), "R1");
        let fp = effective_fingerprint(&f);
        assert!(!is_duplicate_by_proximity(&f, &HashSet::new(), &map));
        map.record(&fp, "src/a.rs", 50);
        let again = finding("src/a.rs", Some(55), "R1");
        assert!(is_duplicate_by_proximity(&again, &HashSet::new(), &map));
    }

    #[test]
    fn stale_detection_respects_proximity() {
        let old_near = finding("src/a.rs", Some(11), "R1");
        let old_far = finding("src/a.rs", Some(90), "R1");
        let old_other = finding("src/b.rs", Some(5), "R2");
        let existing = vec![key_for(&old_near), key_for(&old_far), key_for(&old_other)];

        // Current run only re-finds the issue near line 14.
        let current = vec![finding("src/a.rs", Some(14), "R1")];
        let stale = identify_stale_comments(&existing, &current);

        assert!(!stale.contains(&dedupe_key(&old_near)));
        assert!(stale.contains(&dedupe_key(&old_far)));
        assert!(stale.contains(&dedupe_key(&old_other)));
    }
}
