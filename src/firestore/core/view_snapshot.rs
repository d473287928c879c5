use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: Document) -> Self {
        Self { change_type, doc }
    }
}

/// Whether a view reflects only the local cache or is in sync with the
/// backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Accumulates at most one change per document, folding consecutive changes
/// to the same key into their combined effect.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        let key = change.doc.key().clone();
        if !self.changes.contains_key(&key) {
            self.changes.insert(key, change);
            return Ok(());
        }
        let old = &self.changes[&key];

        use ChangeType::*;
        let merged = match (change.change_type, old.change_type) {
            (new_type, Metadata) if new_type != Added => Some(change),
            (Metadata, old_type) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.doc))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Modified, Added) => Some(DocumentViewChange::new(Added, change.doc)),
            (Removed, Added) => None,
            (Removed, Modified) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Added, Removed) => Some(DocumentViewChange::new(Modified, change.doc)),
            (new_type, old_type) => {
                return Err(internal_error(format!(
                    "Unsupported combination of changes: {new_type:?} after {old_type:?}"
                )))
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// A change together with the document's position before and after it.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedChange {
    pub change_type: ChangeType,
    pub doc: Document,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// The result set of a query at one point in time plus the changes since the
/// previous snapshot delivered for the same view.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// Snapshot reporting every document of `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        let old_docs = DocumentSet::new(documents.comparator());
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Replays `doc_changes` against `old_docs`, yielding the index each
    /// change removed the document from and inserted it at.
    pub fn indexed_changes(&self) -> Vec<IndexedChange> {
        if self.old_docs.is_empty() {
            return self
                .doc_changes
                .iter()
                .enumerate()
                .map(|(index, change)| IndexedChange {
                    change_type: change.change_type,
                    doc: change.doc.clone(),
                    old_index: None,
                    new_index: Some(index),
                })
                .collect();
        }

        let mut working = self.old_docs.clone();
        self.doc_changes
            .iter()
            .map(|change| {
                let key = change.doc.key();
                let old_index = working.index_of(key);
                if old_index.is_some() {
                    working.delete(key);
                }
                let new_index = if change.change_type == ChangeType::Removed {
                    None
                } else {
                    working.add(change.doc.clone());
                    working.index_of(key)
                };
                IndexedChange {
                    change_type: change.change_type,
                    doc: change.doc.clone(),
                    old_index,
                    new_index,
                }
            })
            .collect()
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.sync_state_changed == other.sync_state_changed
            && self.excludes_metadata_changes == other.excludes_metadata_changes
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.docs == other.docs
            && self.old_docs == other.old_docs
            && self.doc_changes == other.doc_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, key, query};

    fn change(change_type: ChangeType, path: &str, version: i64) -> DocumentViewChange {
        DocumentViewChange::new(change_type, doc(path, version, &[]))
    }

    fn only_change(set: &DocumentChangeSet) -> Option<(ChangeType, i64)> {
        let changes = set.changes();
        assert!(changes.len() <= 1);
        changes
            .first()
            .map(|change| (change.change_type, change.doc.version().to_micros()))
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a", 1)).unwrap();
        set.track(change(ChangeType::Removed, "c/a", 1)).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, "c/a", 1)).unwrap();
        set.track(change(ChangeType::Added, "c/a", 2)).unwrap();
        assert_eq!(only_change(&set), Some((ChangeType::Modified, 2)));
    }

    #[test]
    fn metadata_keeps_earlier_change_type() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a", 1)).unwrap();
        set.track(change(ChangeType::Metadata, "c/a", 2)).unwrap();
        assert_eq!(only_change(&set), Some((ChangeType::Added, 2)));

        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Metadata, "c/a", 1)).unwrap();
        set.track(change(ChangeType::Modified, "c/a", 2)).unwrap();
        assert_eq!(only_change(&set), Some((ChangeType::Modified, 2)));
    }

    #[test]
    fn modified_then_removed_reports_old_document() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Modified, "c/a", 1)).unwrap();
        set.track(change(ChangeType::Removed, "c/a", 2)).unwrap();
        assert_eq!(only_change(&set), Some((ChangeType::Removed, 1)));
    }

    #[test]
    fn added_twice_is_rejected() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a", 1)).unwrap();
        assert!(set.track(change(ChangeType::Added, "c/a", 1)).is_err());
    }

    #[test]
    fn indexed_changes_track_positions() {
        let q = query("c");
        let mut old_docs = DocumentSet::new(q.comparator());
        old_docs.add(doc("c/a", 1, &[]));
        old_docs.add(doc("c/c", 1, &[]));
        let mut docs = old_docs.clone();
        docs.delete(&key("c/a"));
        docs.add(doc("c/b", 1, &[]));

        let snapshot = ViewSnapshot {
            query: q,
            docs,
            old_docs,
            doc_changes: vec![
                change(ChangeType::Removed, "c/a", 1),
                change(ChangeType::Added, "c/b", 1),
            ],
            mutated_keys: DocumentKeySet::new(),
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: false,
        };
        let indexed = snapshot.indexed_changes();
        assert_eq!(indexed[0].old_index, Some(0));
        assert_eq!(indexed[0].new_index, None);
        assert_eq!(indexed[1].old_index, None);
        assert_eq!(indexed[1].new_index, Some(0));
    }

    #[test]
    fn initial_snapshot_adds_everything() {
        let q = query("c");
        let mut docs = DocumentSet::new(q.comparator());
        docs.add(doc("c/b", 1, &[]));
        docs.add(doc("c/a", 1, &[]));
        let snapshot =
            ViewSnapshot::from_initial_documents(q, docs, DocumentKeySet::new(), true);
        let indexed = snapshot.indexed_changes();
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed[1].doc.key().id(), "b");
        assert_eq!(indexed[1].new_index, Some(1));
        assert!(snapshot.sync_state_changed);
        assert!(!snapshot.has_pending_writes());
    }
}
