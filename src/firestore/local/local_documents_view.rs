use std::collections::BTreeSet;

use crate::firestore::core::{Query, User};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationBatch, NoDocument, NullableMaybeDocumentMap, ResourcePath, SnapshotVersion,
};

/// Read-only view of documents with the user's pending mutations layered
/// over the remote document cache.
pub struct LocalDocumentsView<'a> {
    txn: &'a mut dyn PersistenceTransaction,
    user: &'a User,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(txn: &'a mut dyn PersistenceTransaction, user: &'a User) -> Self {
        Self { txn, user }
    }

    /// Local view of `key`, or `None` if neither the cache nor a pending
    /// mutation knows about it.
    pub fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        let batches = self
            .txn
            .mutation_queue(self.user)
            .all_mutation_batches_affecting_document_key(key);
        let remote = self.txn.remote_document_cache().get_entry(key);
        apply_batches(key, remote, &batches)
    }

    /// Local view of each key. Keys nobody knows about map to a
    /// `NoDocument` at version zero.
    pub fn get_documents(&mut self, keys: &DocumentKeySet) -> FirestoreResult<MaybeDocumentMap> {
        let base_docs = self.txn.remote_document_cache().get_entries(keys);
        self.get_local_view_of_documents(base_docs)
    }

    /// Layers pending mutations over already fetched remote documents.
    pub fn get_local_view_of_documents(
        &mut self,
        base_docs: NullableMaybeDocumentMap,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let keys: DocumentKeySet = base_docs.keys().cloned().collect();
        let batches = self
            .txn
            .mutation_queue(self.user)
            .all_mutation_batches_affecting_document_keys(&keys);

        let mut results = MaybeDocumentMap::new();
        for (key, maybe_doc) in base_docs {
            let local_view = apply_batches(&key, maybe_doc, &batches)?
                .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min()).into());
            results.insert(key, local_view);
        }
        Ok(results)
    }

    /// Documents matching `query` in the local view. Only remote entries
    /// read after `since_read_time` are scanned; documents touched by
    /// pending mutations are always considered.
    pub fn get_documents_matching_query(
        &mut self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query.path())
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(query, since_read_time)
        } else {
            self.get_documents_matching_collection_query(query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &mut self,
        path: &ResourcePath,
    ) -> FirestoreResult<DocumentMap> {
        let key = DocumentKey::from_path(path.clone())?;
        let mut results = DocumentMap::new();
        if let Some(MaybeDocument::Document(doc)) = self.get_document(&key)? {
            results.insert(key, doc);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &mut self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut results = DocumentMap::new();
        for collection in self.collection_paths(query) {
            let collection_query = query.as_collection_query_at_path(collection);
            results.extend(
                self.get_documents_matching_collection_query(&collection_query, since_read_time)?,
            );
        }
        Ok(results)
    }

    /// Every known collection under the query's path whose id matches the
    /// collection group, found from cached documents and pending writes.
    fn collection_paths(&mut self, query: &Query) -> BTreeSet<ResourcePath> {
        let Some(collection_id) = query.collection_group_id() else {
            return BTreeSet::new();
        };
        let mut keys = self.txn.remote_document_cache().keys();
        for batch in self.txn.mutation_queue(self.user).all_mutation_batches() {
            keys.extend(batch.keys());
        }
        keys.iter()
            .filter(|key| key.has_collection_id(collection_id))
            .map(DocumentKey::collection_path)
            .filter(|collection| query.path().is_prefix_of(collection))
            .collect()
    }

    fn get_documents_matching_collection_query(
        &mut self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut results = self
            .txn
            .remote_document_cache()
            .get_documents_matching_query(query, since_read_time)?;
        let batches = self
            .txn
            .mutation_queue(self.user)
            .all_mutation_batches_affecting_query(query);
        self.add_missing_base_documents(&batches, &mut results);

        for batch in &batches {
            for mutation in batch.mutations() {
                let key = mutation.key();
                let base_doc: Option<MaybeDocument> = results.get(key).cloned().map(Into::into);
                let mutated = mutation.apply_to_local_view(
                    base_doc.clone(),
                    base_doc.as_ref(),
                    batch.local_write_time(),
                )?;
                match mutated {
                    Some(MaybeDocument::Document(doc)) => {
                        results.insert(key.clone(), doc);
                    }
                    _ => {
                        results.remove(key);
                    }
                }
            }
        }

        results.retain(|_, doc| query.matches(doc));
        Ok(results)
    }

    /// Patches only apply to existing documents, so documents that the
    /// query scan skipped (older read time, no longer matching) are loaded
    /// for any key a pending patch touches.
    fn add_missing_base_documents(&mut self, batches: &[MutationBatch], results: &mut DocumentMap) {
        let missing: DocumentKeySet = batches
            .iter()
            .flat_map(|batch| batch.mutations())
            .filter(|mutation| matches!(mutation, Mutation::Patch(_)))
            .map(|mutation| mutation.key().clone())
            .filter(|key| !results.contains_key(key))
            .collect();
        if missing.is_empty() {
            return;
        }
        for (key, maybe_doc) in self.txn.remote_document_cache().get_entries(&missing) {
            if let Some(MaybeDocument::Document(doc)) = maybe_doc {
                results.insert(key, doc);
            }
        }
    }
}

fn apply_batches(
    key: &DocumentKey,
    maybe_doc: Option<MaybeDocument>,
    batches: &[MutationBatch],
) -> FirestoreResult<Option<MaybeDocument>> {
    let mut local_view = maybe_doc;
    for batch in batches {
        local_view = batch.apply_to_local_view(key, local_view)?;
    }
    Ok(local_view)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::FilterOperator;
    use crate::firestore::local::{MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{
        delete_mutation, doc, key, map, patch_mutation, query, set_mutation, version,
    };

    fn seeded(remote: Vec<MaybeDocument>, writes: Vec<Vec<Mutation>>) -> Arc<dyn Persistence> {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::with_eager_gc());
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                for maybe_doc in remote {
                    let read_time = version(maybe_doc.version().to_micros().max(1));
                    txn.remote_document_cache().add_entry(maybe_doc, read_time)?;
                }
                for mutations in writes {
                    txn.mutation_queue(&User::unauthenticated()).add_mutation_batch(
                        Timestamp::from_micros(1),
                        Vec::new(),
                        mutations,
                    )?;
                }
                Ok(())
            })
            .unwrap();
        persistence
    }

    fn read<T>(
        persistence: &Arc<dyn Persistence>,
        f: impl FnOnce(&mut LocalDocumentsView<'_>) -> FirestoreResult<T>,
    ) -> T {
        let user = User::unauthenticated();
        persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                f(&mut LocalDocumentsView::new(txn, &user))
            })
            .unwrap()
    }

    #[test]
    fn layers_pending_mutations_over_remote_document() {
        let persistence = seeded(
            vec![doc("rooms/a", 3, &[("x", FirestoreValue::from_integer(1))]).into()],
            vec![vec![patch_mutation(
                "rooms/a",
                &[("y", FirestoreValue::from_integer(2))],
            )]],
        );
        let local = read(&persistence, |view| view.get_document(&key("rooms/a")))
            .and_then(MaybeDocument::into_document)
            .expect("document");
        assert!(local.has_local_mutations());
        assert_eq!(local.version(), version(3));
        assert_eq!(
            local.data(),
            &map(&[
                ("x", FirestoreValue::from_integer(1)),
                ("y", FirestoreValue::from_integer(2)),
            ])
        );
    }

    #[test]
    fn unknown_keys_read_as_missing_documents() {
        let persistence = seeded(Vec::new(), Vec::new());
        let keys: DocumentKeySet = [key("rooms/missing")].into_iter().collect();
        let docs = read(&persistence, |view| view.get_documents(&keys));
        assert_eq!(
            docs[&key("rooms/missing")],
            NoDocument::new(key("rooms/missing"), SnapshotVersion::min()).into()
        );
    }

    #[test]
    fn collection_query_includes_local_writes_and_drops_deletes() {
        let one = [("x", FirestoreValue::from_integer(1))];
        let persistence = seeded(
            vec![doc("rooms/a", 1, &one).into(), doc("rooms/b", 1, &one).into()],
            vec![
                vec![set_mutation("rooms/c", &one)],
                vec![delete_mutation("rooms/b")],
                vec![set_mutation("other/d", &one)],
            ],
        );
        let filtered = query("rooms")
            .filter("x", FilterOperator::Equal, FirestoreValue::from_integer(1))
            .unwrap();
        let docs = read(&persistence, |view| {
            view.get_documents_matching_query(&filtered, SnapshotVersion::min())
        });
        assert_eq!(
            docs.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/c")]
        );
        assert!(docs[&key("rooms/c")].has_local_mutations());
    }

    #[test]
    fn collection_group_query_spans_parents() {
        let persistence = seeded(
            vec![
                doc("rooms/a/messages/1", 1, &[]).into(),
                doc("rooms/b/messages/2", 1, &[]).into(),
                doc("rooms/b/other/3", 1, &[]).into(),
            ],
            vec![vec![set_mutation("users/u/messages/4", &[])]],
        );
        let group = Query::collection_group("messages");
        let docs = read(&persistence, |view| {
            view.get_documents_matching_query(&group, SnapshotVersion::min())
        });
        assert_eq!(
            docs.keys().cloned().collect::<Vec<_>>(),
            vec![
                key("rooms/a/messages/1"),
                key("rooms/b/messages/2"),
                key("users/u/messages/4"),
            ]
        );
    }

    #[test]
    fn document_query_returns_single_document() {
        let persistence = seeded(vec![doc("rooms/a", 1, &[]).into()], Vec::new());
        let single = Query::for_document(&key("rooms/a"));
        let docs = read(&persistence, |view| {
            view.get_documents_matching_query(&single, SnapshotVersion::min())
        });
        assert_eq!(docs.len(), 1);
    }
}
