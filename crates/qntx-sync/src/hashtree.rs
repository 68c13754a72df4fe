//! Rolling hash tree over local attestations (spec §4.8).
//!
//! Attestations partition into groups by `Attestation::group_key()`
//! (blake3 of the sorted subject set, qntx-core). Each group hashes its
//! sorted member IDs; the root hashes the sorted group hashes. Grounded in
//! the teacher's `blake3` use for canonical content hashing
//! (`bpmn_integration/canonical.rs`).

use std::collections::BTreeMap;

use qntx_core::model::Attestation;

/// `group_key -> (group_hash, member ids, sorted)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashTree {
    pub root_hash: String,
    pub groups: BTreeMap<String, GroupEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub hash: String,
    pub member_ids: Vec<String>,
}

impl HashTree {
    pub fn build(attestations: &[Attestation]) -> Self {
        let mut by_group: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for a in attestations {
            by_group.entry(a.group_key()).or_default().push(a.id.clone());
        }

        let mut groups = BTreeMap::new();
        for (key, mut ids) in by_group {
            ids.sort();
            let hash = hash_ids(&ids);
            groups.insert(key, GroupEntry { hash, member_ids: ids });
        }

        let root_hash = hash_group_hashes(&groups);
        Self { root_hash, groups }
    }

    /// Group keys present in `self` but absent, or hashed differently, in
    /// `other` — and vice versa (the set is symmetric by construction:
    /// iterating `self` then `other` covers keys unique to either side).
    pub fn differing_groups<'a>(&'a self, other: &'a HashTree) -> Vec<&'a str> {
        let mut diffs = Vec::new();
        for (key, entry) in &self.groups {
            match other.groups.get(key) {
                Some(other_entry) if other_entry.hash == entry.hash => {}
                _ => diffs.push(key.as_str()),
            }
        }
        for key in other.groups.keys() {
            if !self.groups.contains_key(key) && !diffs.contains(&key.as_str()) {
                diffs.push(key.as_str());
            }
        }
        diffs
    }
}

fn hash_ids(sorted_ids: &[String]) -> String {
    let joined = sorted_ids.join("\u{1f}");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}

fn hash_group_hashes(groups: &BTreeMap<String, GroupEntry>) -> String {
    let joined = groups.values().map(|g| g.hash.as_str()).collect::<Vec<_>>().join("\u{1f}");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}
