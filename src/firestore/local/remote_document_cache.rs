use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::LocalSerializer;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap,
    NullableMaybeDocumentMap, SnapshotVersion,
};

/// Cache of the latest document state reported by the backend, never
/// containing local mutations.
pub trait RemoteDocumentCache: Send {
    /// Stores `maybe_doc`, recording when it was read from the backend.
    fn add_entry(&mut self, maybe_doc: MaybeDocument, read_time: SnapshotVersion) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey);

    fn get_entry(&self, key: &DocumentKey) -> Option<MaybeDocument>;

    fn get_entries(&self, keys: &DocumentKeySet) -> NullableMaybeDocumentMap;

    /// Documents matching a collection query read after `since_read_time`.
    /// Collection-group queries must be split per collection by the caller.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap>;

    /// Entries read after `since_read_time`, plus the newest read time seen.
    fn get_new_document_changes(&self, since_read_time: SnapshotVersion) -> (MaybeDocumentMap, SnapshotVersion);

    /// Total size in bytes of the cached entries.
    fn size(&self) -> i64;

    fn keys(&self) -> DocumentKeySet;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    maybe_doc: MaybeDocument,
    size: i64,
    read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: BTreeMap<DocumentKey, CacheEntry>,
    size: i64,
    serializer: LocalSerializer,
    /// Prior entry of every key written since the journal was opened.
    journal: Option<BTreeMap<DocumentKey, Option<CacheEntry>>>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_journal(&mut self) {
        self.journal = Some(BTreeMap::new());
    }

    pub(crate) fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Puts back every entry written since [`begin_journal`](Self::begin_journal).
    pub(crate) fn rollback_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (key, previous) in journal {
            let replaced = match previous {
                Some(entry) => {
                    self.size += entry.size;
                    self.docs.insert(key, entry)
                }
                None => self.docs.remove(&key),
            };
            self.size -= replaced.map_or(0, |entry| entry.size);
        }
    }

    fn record(&mut self, key: &DocumentKey) {
        if let Some(journal) = &mut self.journal {
            if !journal.contains_key(key) {
                journal.insert(key.clone(), self.docs.get(key).cloned());
            }
        }
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, maybe_doc: MaybeDocument, read_time: SnapshotVersion) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error(format!(
                "Cannot add a document to the RemoteDocumentCache with a read time of zero: {}",
                maybe_doc.key()
            )));
        }
        let key = maybe_doc.key().clone();
        self.record(&key);
        let size = self.serializer.document_size(&maybe_doc);
        let previous = self.docs.insert(
            key,
            CacheEntry {
                maybe_doc,
                size,
                read_time,
            },
        );
        self.size += size - previous.map(|entry| entry.size).unwrap_or(0);
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        self.record(key);
        if let Some(entry) = self.docs.remove(key) {
            self.size -= entry.size;
        }
    }

    fn get_entry(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        self.docs.get(key).map(|entry| entry.maybe_doc.clone())
    }

    fn get_entries(&self, keys: &DocumentKeySet) -> NullableMaybeDocumentMap {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_collection_group_query() {
            return Err(internal_error(
                "CollectionGroup queries should be handled in LocalDocumentsView",
            ));
        }

        let prefix = query.path();
        let mut results = DocumentMap::new();
        for (key, entry) in &self.docs {
            if !prefix.is_prefix_of(key.path()) {
                continue;
            }
            let MaybeDocument::Document(doc) = &entry.maybe_doc else {
                continue;
            };
            if entry.read_time <= since_read_time {
                continue;
            }
            if !query.matches(doc) {
                continue;
            }
            results.insert(key.clone(), doc.clone());
        }
        Ok(results)
    }

    fn get_new_document_changes(&self, since_read_time: SnapshotVersion) -> (MaybeDocumentMap, SnapshotVersion) {
        let mut changes = MaybeDocumentMap::new();
        let mut read_time = since_read_time;
        for (key, entry) in &self.docs {
            if entry.read_time > since_read_time {
                changes.insert(key.clone(), entry.maybe_doc.clone());
                read_time = read_time.max(entry.read_time);
            }
        }
        (changes, read_time)
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn keys(&self) -> DocumentKeySet {
        self.docs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::FilterOperator;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{deleted_doc, doc, key, query, version};

    fn cache_with(docs: Vec<(MaybeDocument, i64)>) -> MemoryRemoteDocumentCache {
        let mut cache = MemoryRemoteDocumentCache::new();
        for (doc, read_time) in docs {
            cache.add_entry(doc, version(read_time)).unwrap();
        }
        cache
    }

    #[test]
    fn tracks_size_across_replacements() {
        let mut cache = cache_with(vec![(doc("c/a", 1, &[]).into(), 1)]);
        let initial = cache.size();
        assert!(initial > 0);

        cache
            .add_entry(
                doc("c/a", 2, &[("x", FirestoreValue::from_string("long value"))]).into(),
                version(2),
            )
            .unwrap();
        assert!(cache.size() > initial);

        cache.remove_entry(&key("c/a"));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get_entries(&[key("c/a")].into_iter().collect())[&key("c/a")], None);
    }

    #[test]
    fn rejects_documents_without_read_time() {
        let mut cache = MemoryRemoteDocumentCache::new();
        assert!(cache
            .add_entry(doc("c/a", 1, &[]).into(), SnapshotVersion::min())
            .is_err());
        assert!(cache.get_entry(&key("c/a")).is_none());
    }

    #[test]
    fn query_returns_matching_direct_children_after_read_time() {
        let one = [("x", FirestoreValue::from_integer(1))];
        let cache = cache_with(vec![
            (doc("rooms/a", 1, &one).into(), 1),
            (doc("rooms/b", 2, &one).into(), 5),
            (doc("rooms/c", 2, &[]).into(), 5),
            (doc("rooms/a/messages/1", 1, &one).into(), 5),
            (deleted_doc("rooms/d", 5).into(), 5),
        ]);
        let filtered = query("rooms")
            .filter("x", FilterOperator::Equal, FirestoreValue::from_integer(1))
            .unwrap();

        let all = cache
            .get_documents_matching_query(&filtered, SnapshotVersion::min())
            .unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a"), key("rooms/b")]);

        let recent = cache
            .get_documents_matching_query(&filtered, version(1))
            .unwrap();
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }

    #[test]
    fn new_document_changes_report_latest_read_time() {
        let cache = cache_with(vec![
            (doc("c/a", 1, &[]).into(), 1),
            (doc("c/b", 3, &[]).into(), 3),
            (deleted_doc("c/c", 4).into(), 4),
        ]);
        let (changes, read_time) = cache.get_new_document_changes(version(1));
        assert_eq!(changes.len(), 2);
        assert_eq!(read_time, version(4));
    }
}
