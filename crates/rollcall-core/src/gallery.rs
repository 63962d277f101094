//! Searchable gallery built from raw enrollment records.
//!
//! The index is an immutable snapshot. Enrollment changes are reflected by
//! building a new index, never by mutating an existing one.

use crate::types::{EnrollmentRecord, FeatureVector, IdentityId};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// An enrolled identity and every vector contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub vectors: Vec<FeatureVector>,
}

/// Grouping key for enrollments: trimmed, case-insensitive display name.
pub fn normalize_name(display_name: &str) -> String {
    display_name.trim().to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    identities: BTreeMap<IdentityId, Identity>,
}

impl GalleryIndex {
    /// Build an index from raw enrollment rows.
    ///
    /// Rows whose display names normalize to the same key merge into one
    /// identity holding all of their vectors. The merged identity takes the
    /// smallest identity id in its group, and the display name of that id's
    /// first row.
    ///
    /// Two differently named groups resolving to the same id are merged under
    /// that id (the name whose key sorts first wins) so that none of their
    /// vectors drop out of matching.
    pub fn build(records: impl IntoIterator<Item = EnrollmentRecord>) -> Self {
        let mut groups: BTreeMap<String, Identity> = BTreeMap::new();

        for record in records {
            let key = normalize_name(&record.display_name);
            if key.is_empty() {
                tracing::warn!(
                    identity = %record.identity_id,
                    "skipping enrollment with blank display name"
                );
                continue;
            }

            let display_name = record.display_name.trim().to_string();
            match groups.get_mut(&key) {
                Some(identity) => {
                    if record.identity_id < identity.id {
                        identity.id = record.identity_id;
                        identity.display_name = display_name;
                    }
                    identity.vectors.push(record.vector);
                }
                None => {
                    groups.insert(
                        key,
                        Identity {
                            id: record.identity_id,
                            display_name,
                            vectors: vec![record.vector],
                        },
                    );
                }
            }
        }

        let mut identities: BTreeMap<IdentityId, Identity> = BTreeMap::new();
        for identity in groups.into_values() {
            match identities.entry(identity.id) {
                Entry::Vacant(slot) => {
                    slot.insert(identity);
                }
                Entry::Occupied(mut slot) => {
                    let kept = slot.get_mut();
                    tracing::warn!(
                        identity = %identity.id,
                        kept = %kept.display_name,
                        merged = %identity.display_name,
                        "differently named enrollments share an identity id; merging"
                    );
                    kept.vectors.extend(identity.vectors);
                }
            }
        }

        tracing::debug!(
            identities = identities.len(),
            vectors = identities.values().map(|i| i.vectors.len()).sum::<usize>(),
            "gallery index built"
        );

        Self { identities }
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of identities (after merging).
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Total number of enrolled vectors across all identities.
    pub fn vector_count(&self) -> usize {
        self.identities.values().map(|i| i.vectors.len()).sum()
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.get(&id)
    }

    /// Identities in ascending id order.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, name: &str, axis: usize) -> EnrollmentRecord {
        EnrollmentRecord {
            identity_id: IdentityId(id),
            display_name: name.to_string(),
            vector: FeatureVector::axis(axis, 1.0),
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Ada Lovelace "), "ada lovelace");
        assert_eq!(normalize_name("ADA"), normalize_name("ada"));
    }

    #[test]
    fn test_empty_records() {
        let index = GalleryIndex::build(Vec::new());
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        assert_eq!(index.vector_count(), 0);
    }

    #[test]
    fn test_merges_by_normalized_name() {
        let index = GalleryIndex::build(vec![
            record(7, "Grace Hopper", 0),
            record(3, "  grace hopper", 1),
            record(5, "Alan Turing", 2),
            record(9, "GRACE HOPPER ", 3),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.vector_count(), 4);

        let grace = index.get(IdentityId(3)).expect("merged identity keeps smallest id");
        assert_eq!(grace.display_name, "grace hopper");
        assert_eq!(grace.vectors.len(), 3);
        assert!(index.get(IdentityId(7)).is_none());
        assert!(index.get(IdentityId(9)).is_none());
    }

    #[test]
    fn test_keeps_every_vector() {
        let index = GalleryIndex::build(vec![
            record(1, "Ada", 0),
            record(1, "Ada", 1),
            record(1, "Ada", 2),
        ]);
        let ada = index.get(IdentityId(1)).unwrap();
        assert_eq!(ada.vectors.len(), 3);
        assert_eq!(ada.display_name, "Ada");
    }

    #[test]
    fn test_skips_blank_names() {
        let index = GalleryIndex::build(vec![record(1, "   ", 0), record(2, "Bob", 1)]);
        assert_eq!(index.len(), 1);
        assert!(index.get(IdentityId(2)).is_some());
    }

    #[test]
    fn test_shared_id_across_names_keeps_every_vector() {
        for _ in 0..8 {
            let index = GalleryIndex::build(vec![record(1, "Ada", 0), record(1, "Bob", 1)]);
            assert_eq!(index.len(), 1);
            assert_eq!(index.vector_count(), 2);
            assert_eq!(index.get(IdentityId(1)).unwrap().display_name, "Ada");
        }
    }

    #[test]
    fn test_merged_group_landing_on_taken_id() {
        // "bob" and "Bob" merge under id 1, which "Ada" already holds.
        let index = GalleryIndex::build(vec![
            record(1, "Ada", 0),
            record(2, "Bob", 1),
            record(1, "bob", 2),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.vector_count(), 3);
        let merged = index.get(IdentityId(1)).unwrap();
        assert_eq!(merged.display_name, "Ada");
        assert_eq!(merged.vectors[0], FeatureVector::axis(0, 1.0));
    }

    #[test]
    fn test_identities_ordered_by_id() {
        let index = GalleryIndex::build(vec![
            record(30, "C", 0),
            record(10, "A", 1),
            record(20, "B", 2),
        ]);
        let ids: Vec<i64> = index.identities().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }
}
