use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::LocalDocumentsView;
use crate::firestore::model::{
    DocumentKeySet, DocumentMap, DocumentSet, MaybeDocument, MaybeDocumentMap, SnapshotVersion,
};

/// Strategy for running a query against the local cache.
///
/// Results may include documents that no longer match; callers re-filter
/// through a [`View`](crate::firestore::core::View).
pub trait QueryEngine: Send + Sync {
    fn get_documents_matching_query(
        &self,
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap>;
}

/// Scans every cached document in the query's collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleQueryEngine;

impl QueryEngine for SimpleQueryEngine {
    fn get_documents_matching_query(
        &self,
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
        _last_limbo_free_snapshot_version: SnapshotVersion,
        _remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        local_documents.get_documents_matching_query(query, SnapshotVersion::min())
    }
}

/// Reuses the keys the backend last reported for the target and only scans
/// documents read after the target was last free of limbo documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexFreeQueryEngine;

impl IndexFreeQueryEngine {
    fn execute_full_collection_scan(
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        log::debug!("Using full collection scan to execute query: {}", query.canonical_id());
        local_documents.get_documents_matching_query(query, SnapshotVersion::min())
    }

    fn apply_query(query: &Query, documents: MaybeDocumentMap) -> DocumentSet {
        let mut results = DocumentSet::new(query.comparator());
        for maybe_doc in documents.into_values() {
            if let MaybeDocument::Document(doc) = maybe_doc {
                if query.matches(&doc) {
                    results.add(doc);
                }
            }
        }
        results
    }

    /// A limit query needs a full scan when a document at the limit edge may
    /// have been replaced by one the backend never reported for the target.
    fn needs_refill(
        limit_type: LimitType,
        sorted_previous_results: &DocumentSet,
        remote_keys: &DocumentKeySet,
        limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        if remote_keys.len() != sorted_previous_results.len() {
            return true;
        }
        let edge = match limit_type {
            LimitType::First => sorted_previous_results.last(),
            LimitType::Last => sorted_previous_results.first(),
        };
        match edge {
            Some(doc) => {
                doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version
            }
            None => false,
        }
    }
}

impl QueryEngine for IndexFreeQueryEngine {
    fn get_documents_matching_query(
        &self,
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        // Queries that match all documents don't benefit from index-free
        // execution.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Self::execute_full_collection_scan(local_documents, query);
        }

        let previous_documents = local_documents.get_documents(remote_keys)?;
        let previous_results = Self::apply_query(query, previous_documents);

        if query.limit().is_some()
            && Self::needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return Self::execute_full_collection_scan(local_documents, query);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );

        let mut updated_results = local_documents
            .get_documents_matching_query(query, last_limbo_free_snapshot_version)?;
        // Entries present in both maps are identical.
        for doc in previous_results.iter() {
            updated_results.insert(doc.key().clone(), doc.clone());
        }
        Ok(updated_results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::{Direction, FilterOperator, User};
    use crate::firestore::local::{MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{doc, key, patch_mutation, query, version};

    struct Fixture {
        persistence: Arc<dyn Persistence>,
        user: User,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                persistence: Arc::new(MemoryPersistence::with_eager_gc()),
                user: User::unauthenticated(),
            }
        }

        fn add_remote(&self, path: &str, micros: i64, x: i64) {
            self.persistence
                .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                    txn.remote_document_cache().add_entry(
                        doc(path, micros, &[("x", FirestoreValue::from_integer(x))]).into(),
                        version(micros),
                    )
                })
                .unwrap();
        }

        fn patch(&self, path: &str, x: i64) {
            self.persistence
                .run_transaction("patch", TransactionMode::ReadWrite, |txn| {
                    txn.mutation_queue(&self.user).add_mutation_batch(
                        Timestamp::from_micros(1),
                        Vec::new(),
                        vec![patch_mutation(path, &[("x", FirestoreValue::from_integer(x))])],
                    )?;
                    Ok(())
                })
                .unwrap();
        }

        fn run(
            &self,
            engine: &dyn QueryEngine,
            query: &Query,
            last_limbo_free: SnapshotVersion,
            remote_keys: &[&str],
        ) -> Vec<String> {
            let remote_keys: DocumentKeySet = remote_keys.iter().map(|path| key(path)).collect();
            let user = self.user.clone();
            let docs = self
                .persistence
                .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                    let mut view = LocalDocumentsView::new(txn, &user);
                    engine.get_documents_matching_query(&mut view, query, last_limbo_free, &remote_keys)
                })
                .unwrap();
            docs.keys().map(|key| key.to_string()).collect()
        }
    }

    fn positive(path: &str) -> Query {
        query(path)
            .filter("x", FilterOperator::GreaterThan, FirestoreValue::from_integer(0))
            .unwrap()
    }

    #[test]
    fn index_free_skips_documents_read_before_limbo_free_version() {
        let fixture = Fixture::new();
        fixture.add_remote("rooms/a", 1, 1);
        fixture.add_remote("rooms/b", 1, 1);
        fixture.add_remote("rooms/c", 5, 1);

        // rooms/b was never reported for the target and predates the
        // limbo-free version, so it is not rescanned.
        let keys = fixture.run(&IndexFreeQueryEngine, &positive("rooms"), version(2), &["rooms/a"]);
        assert_eq!(keys, vec!["rooms/a", "rooms/c"]);

        let keys = fixture.run(&SimpleQueryEngine, &positive("rooms"), version(2), &["rooms/a"]);
        assert_eq!(keys, vec!["rooms/a", "rooms/b", "rooms/c"]);
    }

    #[test]
    fn index_free_falls_back_without_limbo_free_version() {
        let fixture = Fixture::new();
        fixture.add_remote("rooms/a", 1, 1);
        fixture.add_remote("rooms/b", 1, 1);
        let keys = fixture.run(
            &IndexFreeQueryEngine,
            &positive("rooms"),
            SnapshotVersion::min(),
            &["rooms/a"],
        );
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);
    }

    #[test]
    fn limit_query_refills_when_a_previous_match_dropped_out() {
        let fixture = Fixture::new();
        fixture.add_remote("rooms/a", 1, 1);
        fixture.add_remote("rooms/b", 1, 2);
        fixture.add_remote("rooms/c", 1, 3);
        fixture.patch("rooms/a", -1);

        let limited = positive("rooms")
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_first(2);
        let keys = fixture.run(&IndexFreeQueryEngine, &limited, version(1), &["rooms/a", "rooms/b"]);
        assert_eq!(keys, vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn limit_query_reuses_results_when_edge_is_stable() {
        let fixture = Fixture::new();
        fixture.add_remote("rooms/a", 1, 1);
        fixture.add_remote("rooms/b", 1, 2);
        fixture.add_remote("rooms/c", 1, 3);

        let limited = positive("rooms")
            .order_by("x", Direction::Ascending)
            .unwrap()
            .limit_to_first(2);
        let keys = fixture.run(&IndexFreeQueryEngine, &limited, version(1), &["rooms/a", "rooms/b"]);
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);
    }
}
