use std::cmp::Ordering;

use crate::firestore::core::{
    ChangeType, DocumentChangeSet, DocumentViewChange, LimitType, OnlineState, Query, SyncState,
    ViewSnapshot,
};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, DocumentKeySet, DocumentSet, MaybeDocument,
    MaybeDocumentMap,
};
use crate::firestore::remote::TargetChange;

/// A document entering or leaving limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Intermediate result of [`View::compute_doc_changes`]; not yet applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit could not be honored with the documents given; the caller
    /// must rerun the query against the local store and recompute.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side state of one query: the documents it currently shows and the
/// keys the backend has confirmed for its target.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    synced_documents: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend reported as part of this view's target.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Diffs `doc_changes` against the current documents without applying
    /// them. Passing the result of an earlier call that needed a refill
    /// continues from that state.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &MaybeDocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let refilling = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // The document at the limit edge, if the view is full. Changes past it
        // may have hidden documents that now need to be loaded.
        let limit = self.query.limit().map(|limit| limit as usize);
        let edge_doc = match (limit, self.query.limit_type()) {
            (Some(limit), LimitType::First) if old_document_set.len() == limit => {
                old_document_set.last().cloned()
            }
            (Some(limit), LimitType::Last) if old_document_set.len() == limit => {
                old_document_set.first().cloned()
            }
            _ => None,
        };

        for (key, new_maybe_doc) in doc_changes {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc = match new_maybe_doc {
                MaybeDocument::Document(doc) => {
                    if doc.key() != key {
                        return Err(internal_error(format!(
                            "Mismatching keys found in document changes: {key} != {}",
                            doc.key()
                        )));
                    }
                    self.query.matches(doc).then(|| doc.clone())
                }
                _ => None,
            };

            let old_doc_had_pending_mutations = old_doc
                .as_ref()
                .is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.as_ref().is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ))?;
                            change_applied = true;
                            if let Some(edge) = &edge_doc {
                                if self.past_edge(new_doc, edge) {
                                    needs_refill = true;
                                }
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ))?;
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set
                        .track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()))?;
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set
                        .track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()))?;
                    change_applied = true;
                    if edge_doc.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.add(new_doc);
                        if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.delete(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                new_document_set.delete(evicted.key());
                new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted))?;
            }
        }

        if needs_refill && refilling {
            return Err(internal_error(
                "View was refilled using docs that themselves needed refilling.",
            ));
        }

        Ok(ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        })
    }

    fn past_edge(&self, doc: &Document, edge: &Document) -> bool {
        let ordering = (self.comparator)(doc, edge);
        match self.query.limit_type() {
            LimitType::First => ordering == Ordering::Greater,
            LimitType::Last => ordering == Ordering::Less,
        }
    }

    /// Commits computed changes and produces a snapshot when anything visible
    /// changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> FirestoreResult<ViewChange> {
        if doc_changes.needs_refill {
            return Err(internal_error("Cannot apply changes that need a refill"));
        }

        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        let comparator = &self.comparator;
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change)?;
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return Ok(ViewChange {
                snapshot: None,
                limbo_changes,
            });
        }

        Ok(ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        })
    }

    /// Going offline marks a current view as from-cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> FirestoreResult<ViewChange> {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None)
        } else {
            Ok(ViewChange::default())
        }
    }

    /// Resets the view to the persisted local documents and remote keys. Used
    /// when another client changed the cache underneath this one.
    pub fn synchronize_with_persisted_state(
        &mut self,
        local_docs: &MaybeDocumentMap,
        remote_keys: DocumentKeySet,
    ) -> FirestoreResult<ViewChange> {
        self.synced_documents = remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let doc_changes = self.compute_doc_changes(local_docs, None)?;
        self.apply_changes(doc_changes, true, None)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) -> FirestoreResult<()> {
        let Some(target_change) = target_change else {
            return Ok(());
        };
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.modified_documents {
            if !self.synced_documents.contains(key) {
                return Err(internal_error(format!(
                    "Modified document {key} not found in view."
                )));
            }
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
        Ok(())
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain the document's presence until they are
            // acknowledged.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .map(|doc| doc.key())
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo_documents
            .iter()
            .filter(|key| !self.limbo_documents.contains(*key))
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .iter()
                .filter(|key| !old_limbo_documents.contains(*key))
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    // A write acknowledged before the watch stream caught up would briefly
    // show the old remote state; hold the local version until then.
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Direction;
    use crate::test_support::{deleted_doc, doc, key, query};
    use crate::firestore::value::FirestoreValue;

    fn updates(docs: Vec<MaybeDocument>) -> MaybeDocumentMap {
        docs.into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect()
    }

    fn apply(view: &mut View, docs: Vec<MaybeDocument>, target_change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&updates(docs), None).unwrap();
        view.apply_changes(changes, true, target_change).unwrap()
    }

    fn ack_target(keys: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: keys.iter().map(|path| key(path)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn first_change_reports_added_documents_from_cache() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 1, &[]).into(), doc("rooms/b", 1, &[]).into()],
            None,
        );
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
    }

    #[test]
    fn filters_documents_outside_query() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let change = apply(&mut view, vec![doc("other/a", 1, &[]).into()], None);
        assert!(change.snapshot.unwrap().docs.is_empty());
    }

    #[test]
    fn current_target_change_marks_view_synced() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, &[]).into()], None);
        let change = apply(&mut view, vec![], Some(&ack_target(&["rooms/a"])));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.doc_changes.is_empty());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn unsynced_document_goes_into_limbo_once_current() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        apply(
            &mut view,
            vec![doc("rooms/a", 1, &[]).into(), doc("rooms/b", 1, &[]).into()],
            None,
        );
        let change = apply(&mut view, vec![], Some(&ack_target(&["rooms/a"])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.is_none());

        let deleted = apply(&mut view, vec![deleted_doc("rooms/b", 2).into()], None);
        assert_eq!(
            deleted.limbo_changes,
            vec![LimboDocumentChange::Removed(key("rooms/b"))]
        );
        let snapshot = deleted.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn local_mutations_keep_document_out_of_limbo() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 0, &[]).with_local_mutations().into()],
            Some(&ack_target(&[])),
        );
        assert!(change.limbo_changes.is_empty());
        assert!(change.snapshot.unwrap().has_pending_writes());
    }

    #[test]
    fn metadata_change_when_write_is_acknowledged() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let value = [("x", FirestoreValue::from_integer(1))];
        apply(
            &mut view,
            vec![doc("rooms/a", 0, &value).with_local_mutations().into()],
            None,
        );
        let change = apply(&mut view, vec![doc("rooms/a", 2, &value).into()], None);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn limit_query_requests_refill_when_edge_document_removed() {
        let limited = query("rooms")
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_first(2);
        let mut view = View::new(limited, DocumentKeySet::new());
        let x = |value| [("x", FirestoreValue::from_integer(value))];
        apply(
            &mut view,
            vec![
                doc("rooms/a", 1, &x(1)).into(),
                doc("rooms/b", 1, &x(2)).into(),
                doc("rooms/c", 1, &x(3)).into(),
            ],
            None,
        );
        assert_eq!(view.compute_initial_snapshot().docs.len(), 2);

        let changes = view
            .compute_doc_changes(&updates(vec![deleted_doc("rooms/a", 2).into()]), None)
            .unwrap();
        assert!(changes.needs_refill);
        assert!(view.apply_changes(changes, true, None).is_err());
    }

    #[test]
    fn empty_changes_on_synced_view_emit_nothing() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        let synced = apply(
            &mut view,
            vec![doc("rooms/a", 1, &[]).into()],
            Some(&ack_target(&["rooms/a"])),
        );
        assert!(!synced.snapshot.unwrap().from_cache);

        let changes = view
            .compute_doc_changes(&MaybeDocumentMap::new(), None)
            .unwrap();
        assert!(!changes.needs_refill);
        let change = view.apply_changes(changes, true, None).unwrap();
        assert!(change.snapshot.is_none());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn insert_before_limit_edge_evicts_last_document() {
        let limited = query("rooms")
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_first(2);
        let mut view = View::new(limited, DocumentKeySet::new());
        let x = |value| [("x", FirestoreValue::from_integer(value))];
        apply(
            &mut view,
            vec![
                doc("rooms/a", 1, &x(1)).into(),
                doc("rooms/b", 1, &x(2)).into(),
                doc("rooms/c", 1, &x(3)).into(),
            ],
            None,
        );
        let initial: Vec<DocumentKey> = view
            .compute_initial_snapshot()
            .docs
            .iter()
            .map(|doc| doc.key().clone())
            .collect();
        assert_eq!(initial, vec![key("rooms/a"), key("rooms/b")]);

        let changes = view
            .compute_doc_changes(&updates(vec![doc("rooms/d", 2, &x(0)).into()]), None)
            .unwrap();
        assert!(!changes.needs_refill);
        let snapshot = view.apply_changes(changes, true, None).unwrap().snapshot.unwrap();

        let keys: Vec<DocumentKey> = snapshot.docs.iter().map(|doc| doc.key().clone()).collect();
        assert_eq!(keys, vec![key("rooms/d"), key("rooms/a")]);
        let changes: Vec<(ChangeType, DocumentKey)> = snapshot
            .doc_changes
            .iter()
            .map(|change| (change.change_type, change.doc.key().clone()))
            .collect();
        assert_eq!(
            changes,
            vec![
                (ChangeType::Removed, key("rooms/b")),
                (ChangeType::Added, key("rooms/d")),
            ]
        );
    }

    #[test]
    fn limit_to_last_keeps_tail() {
        let limited = query("rooms")
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_last(1);
        let mut view = View::new(limited, DocumentKeySet::new());
        let x = |value| [("x", FirestoreValue::from_integer(value))];
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 1, &x(1)).into(), doc("rooms/b", 1, &x(2)).into()],
            None,
        );
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert_eq!(snapshot.docs.first().unwrap().key(), &key("rooms/b"));
    }

    #[test]
    fn going_offline_marks_snapshot_from_cache() {
        let mut view = View::new(query("rooms"), DocumentKeySet::new());
        apply(&mut view, vec![], Some(&ack_target(&[])));
        let change = view.apply_online_state_change(OnlineState::Offline).unwrap();
        assert!(change.snapshot.unwrap().from_cache);
        let again = view.apply_online_state_change(OnlineState::Offline).unwrap();
        assert!(again.snapshot.is_none());
    }
}
