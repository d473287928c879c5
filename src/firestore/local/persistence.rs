use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::{ListenSequenceNumber, TargetId, User};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{
    BundleCache, MutationQueue, ReferenceSet, RemoteDocumentCache, TargetCache, TargetData,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet};
use crate::firestore::settings::GarbageCollectionSettings;

/// Access level requested for a persistence transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Only allowed while this client holds the primary lease.
    ReadWritePrimary,
}

/// Storage backend for the local store.
///
/// Every read and write of cached state happens inside
/// [`run_transaction`](dyn Persistence::run_transaction); a transaction whose
/// body fails leaves no trace.
pub trait Persistence: Send + Sync {
    /// Object-safe entry point behind [`run_transaction`](dyn Persistence::run_transaction).
    fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        body: &mut dyn FnMut(&mut dyn PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;

    /// Documents pinned by active local views; never garbage collected.
    fn set_in_memory_pins(&self, pins: Arc<StdMutex<ReferenceSet>>);

    fn garbage_collection_mode(&self) -> GarbageCollectionSettings;

    fn is_primary(&self) -> bool;

    /// Updates the lease state. Only multi-client drivers change it outside
    /// of tests.
    fn set_primary(&self, is_primary: bool);

    fn is_started(&self) -> bool;

    fn shutdown(&self);
}

impl dyn Persistence {
    /// Runs `body` atomically and returns its result.
    pub fn run_transaction<T>(
        &self,
        action: &str,
        mode: TransactionMode,
        body: impl FnOnce(&mut dyn PersistenceTransaction) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        let mut body = Some(body);
        let mut output = None;
        self.run_transaction_dyn(action, mode, &mut |txn| {
            let body = body
                .take()
                .ok_or_else(|| internal_error("Transaction body invoked twice"))?;
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("Transaction '{action}' produced no result")))
    }
}

/// View of the caches inside one transaction, plus the hooks that keep the
/// garbage collector informed about references.
pub trait PersistenceTransaction {
    /// LRU sequence number stamped on everything touched by this
    /// transaction; `ListenSequence::INVALID` under eager collection.
    fn current_sequence_number(&self) -> ListenSequenceNumber;

    fn mutation_queue(&mut self, user: &User) -> &mut dyn MutationQueue;

    fn mutation_queues_contain_key(&self, key: &DocumentKey) -> bool;

    fn remote_document_cache(&mut self) -> &mut dyn RemoteDocumentCache;

    fn target_cache(&mut self) -> &mut dyn TargetCache;

    fn bundle_cache(&mut self) -> &mut dyn BundleCache;

    fn add_reference(&mut self, key: &DocumentKey);

    fn remove_reference(&mut self, key: &DocumentKey);

    fn remove_mutation_reference(&mut self, key: &DocumentKey);

    /// Drops the target from the cache (eager) or marks it collectable (LRU).
    fn remove_target(&mut self, target_data: &TargetData) -> FirestoreResult<()>;

    /// A limbo document was resolved and may no longer be referenced.
    fn update_limbo_document(&mut self, key: &DocumentKey);

    /// Present only when LRU collection is enabled.
    fn lru_delegate(&mut self) -> Option<&mut dyn LruDelegate>;

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.target_cache().add_matching_keys(keys, target_id);
        for key in keys {
            self.add_reference(key);
        }
    }

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.target_cache().remove_matching_keys(keys, target_id);
        for key in keys {
            self.remove_reference(key);
        }
    }
}

/// Hooks the LRU garbage collector needs from the storage driver.
pub trait LruDelegate {
    /// Targets plus orphaned documents, each counting as one sequence number.
    fn sequence_number_count(&self) -> usize;

    fn target_sequence_numbers(&self) -> Vec<ListenSequenceNumber>;

    fn orphaned_document_sequence_numbers(&self) -> Vec<ListenSequenceNumber>;

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize;

    fn remove_orphaned_documents(&mut self, upper_bound: ListenSequenceNumber) -> usize;

    /// Bytes used by cached documents.
    fn cache_size(&self) -> i64;
}
