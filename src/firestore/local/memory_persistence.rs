use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use crate::firestore::core::{ListenSequence, ListenSequenceNumber, TargetId, User};
use crate::firestore::error::{failed_precondition, primary_lease_lost, FirestoreResult};
use crate::firestore::local::{
    BundleCache, LruDelegate, MemoryBundleCache, MemoryMutationQueue, MemoryRemoteDocumentCache,
    MemoryTargetCache, MutationQueue, Persistence, PersistenceTransaction, ReferenceSet,
    RemoteDocumentCache, TargetCache, TargetData, TransactionMode,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet};
use crate::firestore::settings::{GarbageCollectionSettings, LruParams};

/// In-memory storage driver.
///
/// Transactions are serialized behind one lock. Read-write transactions keep
/// an undo log of what they touched; a failed one is rolled back from it.
pub struct MemoryPersistence {
    state: StdMutex<MemoryState>,
    garbage_collection: GarbageCollectionSettings,
    in_memory_pins: StdMutex<Option<Arc<StdMutex<ReferenceSet>>>>,
    primary: AtomicBool,
    started: AtomicBool,
}

struct MemoryState {
    mutation_queues: BTreeMap<String, MemoryMutationQueue>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    bundle_cache: MemoryBundleCache,
    delegate: ReferenceDelegate,
}

enum ReferenceDelegate {
    /// Documents that lost a reference during the running transaction.
    Eager { orphaned: DocumentKeySet },
    Lru {
        orphaned_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
        listen_sequence: ListenSequence,
    },
}

impl MemoryPersistence {
    pub fn new(garbage_collection: GarbageCollectionSettings) -> Self {
        let target_cache = MemoryTargetCache::new();
        let delegate = match &garbage_collection {
            GarbageCollectionSettings::Eager => ReferenceDelegate::Eager {
                orphaned: DocumentKeySet::new(),
            },
            GarbageCollectionSettings::Lru(_) => ReferenceDelegate::Lru {
                orphaned_sequence_numbers: BTreeMap::new(),
                listen_sequence: ListenSequence::new(target_cache.highest_sequence_number()),
            },
        };
        log::debug!("Starting memory persistence ({garbage_collection:?})");
        Self {
            state: StdMutex::new(MemoryState {
                mutation_queues: BTreeMap::new(),
                remote_documents: MemoryRemoteDocumentCache::new(),
                target_cache,
                bundle_cache: MemoryBundleCache::new(),
                delegate,
            }),
            garbage_collection,
            in_memory_pins: StdMutex::new(None),
            primary: AtomicBool::new(true),
            started: AtomicBool::new(true),
        }
    }

    pub fn with_eager_gc() -> Self {
        Self::new(GarbageCollectionSettings::Eager)
    }

    pub fn with_lru_gc(params: LruParams) -> Self {
        Self::new(GarbageCollectionSettings::Lru(params))
    }

    fn pins(&self) -> Option<Arc<StdMutex<ReferenceSet>>> {
        self.in_memory_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Persistence for MemoryPersistence {
    fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        body: &mut dyn FnMut(&mut dyn PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Cannot run '{action}' after persistence was shut down"
            )));
        }
        if mode == TransactionMode::ReadWritePrimary && !self.is_primary() {
            log::debug!("Rejecting '{action}': primary lease not held");
            return Err(primary_lease_lost());
        }

        log::trace!("Starting transaction '{action}' ({mode:?})");
        let pins = self.pins();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let undo = match mode {
            TransactionMode::ReadOnly => None,
            _ => Some(UndoLog::begin(&mut *state)),
        };

        let current_sequence_number = match &mut state.delegate {
            ReferenceDelegate::Eager { orphaned } => {
                orphaned.clear();
                ListenSequence::INVALID
            }
            ReferenceDelegate::Lru {
                listen_sequence, ..
            } => listen_sequence.next(),
        };

        let mut txn = MemoryTransaction {
            state: &mut *state,
            current_sequence_number,
            pins,
            undo,
        };
        match body(&mut txn) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(err) => {
                log::debug!("Transaction '{action}' failed: {err}");
                txn.rollback();
                Err(err)
            }
        }
    }

    fn set_in_memory_pins(&self, pins: Arc<StdMutex<ReferenceSet>>) {
        *self
            .in_memory_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pins);
    }

    fn garbage_collection_mode(&self) -> GarbageCollectionSettings {
        self.garbage_collection
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn set_primary(&self, is_primary: bool) {
        self.primary.store(is_primary, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        log::debug!("Shutting down memory persistence");
        self.started.store(false, Ordering::SeqCst);
    }
}

/// What a read-write transaction changed outside the journaled caches.
/// Mutation queues and the bundle cache are small, so they are copied the
/// first time a transaction touches them.
#[derive(Default)]
struct UndoLog {
    mutation_queues: BTreeMap<String, Option<MemoryMutationQueue>>,
    bundle_cache: Option<MemoryBundleCache>,
    orphaned_sequence_numbers: BTreeMap<DocumentKey, Option<ListenSequenceNumber>>,
    listen_sequence: Option<ListenSequence>,
}

impl UndoLog {
    /// Must run before the transaction draws its sequence number.
    fn begin(state: &mut MemoryState) -> Self {
        state.remote_documents.begin_journal();
        state.target_cache.begin_journal();
        let listen_sequence = match &state.delegate {
            ReferenceDelegate::Lru {
                listen_sequence, ..
            } => Some(listen_sequence.clone()),
            ReferenceDelegate::Eager { .. } => None,
        };
        Self {
            listen_sequence,
            ..Self::default()
        }
    }

    fn commit(state: &mut MemoryState) {
        state.remote_documents.commit_journal();
        state.target_cache.commit_journal();
    }

    fn rollback(self, state: &mut MemoryState) {
        state.remote_documents.rollback_journal();
        state.target_cache.rollback_journal();
        for (user_key, previous) in self.mutation_queues {
            match previous {
                Some(queue) => {
                    state.mutation_queues.insert(user_key, queue);
                }
                None => {
                    state.mutation_queues.remove(&user_key);
                }
            }
        }
        if let Some(bundle_cache) = self.bundle_cache {
            state.bundle_cache = bundle_cache;
        }
        match &mut state.delegate {
            ReferenceDelegate::Eager { orphaned } => orphaned.clear(),
            ReferenceDelegate::Lru {
                orphaned_sequence_numbers,
                listen_sequence,
            } => {
                for (key, previous) in self.orphaned_sequence_numbers {
                    match previous {
                        Some(sequence_number) => {
                            orphaned_sequence_numbers.insert(key, sequence_number);
                        }
                        None => {
                            orphaned_sequence_numbers.remove(&key);
                        }
                    }
                }
                if let Some(previous) = self.listen_sequence {
                    *listen_sequence = previous;
                }
            }
        }
    }
}

struct MemoryTransaction<'a> {
    state: &'a mut MemoryState,
    current_sequence_number: ListenSequenceNumber,
    pins: Option<Arc<StdMutex<ReferenceSet>>>,
    undo: Option<UndoLog>,
}

impl MemoryTransaction<'_> {
    fn pinned_in_memory(&self, key: &DocumentKey) -> bool {
        self.pins.as_ref().is_some_and(|pins| {
            pins.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(key)
        })
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.state.target_cache.contains_key(key)
            || self.mutation_queues_contain_key(key)
            || self.pinned_in_memory(key)
    }

    fn is_pinned(&self, key: &DocumentKey, upper_bound: ListenSequenceNumber) -> bool {
        if self.is_referenced(key) {
            return true;
        }
        match &self.state.delegate {
            ReferenceDelegate::Lru {
                orphaned_sequence_numbers,
                ..
            } => orphaned_sequence_numbers
                .get(key)
                .is_some_and(|sequence_number| *sequence_number > upper_bound),
            ReferenceDelegate::Eager { .. } => false,
        }
    }

    fn mark_orphaned(&mut self, key: &DocumentKey) {
        if let ReferenceDelegate::Eager { orphaned } = &mut self.state.delegate {
            orphaned.insert(key.clone());
            return;
        }
        self.set_orphaned_sequence_number(key, Some(self.current_sequence_number));
    }

    /// Writes the LRU sequence number of `key`, remembering the old one.
    fn set_orphaned_sequence_number(
        &mut self,
        key: &DocumentKey,
        sequence_number: Option<ListenSequenceNumber>,
    ) {
        let ReferenceDelegate::Lru {
            orphaned_sequence_numbers,
            ..
        } = &mut self.state.delegate
        else {
            return;
        };
        let previous = match sequence_number {
            Some(sequence_number) => orphaned_sequence_numbers.insert(key.clone(), sequence_number),
            None => orphaned_sequence_numbers.remove(key),
        };
        if let Some(undo) = &mut self.undo {
            undo.orphaned_sequence_numbers
                .entry(key.clone())
                .or_insert(previous);
        }
    }

    fn commit(mut self) {
        if let ReferenceDelegate::Eager { orphaned } = &mut self.state.delegate {
            let orphaned = std::mem::take(orphaned);
            for key in orphaned {
                if !self.is_referenced(&key) {
                    log::trace!("Collecting unreferenced document {key}");
                    self.state.remote_documents.remove_entry(&key);
                }
            }
        }
        if self.undo.is_some() {
            UndoLog::commit(self.state);
        }
    }

    fn rollback(self) {
        if let Some(undo) = self.undo {
            undo.rollback(self.state);
        }
    }
}

impl PersistenceTransaction for MemoryTransaction<'_> {
    fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    fn mutation_queue(&mut self, user: &User) -> &mut dyn MutationQueue {
        let user_key = user.to_key();
        if let Some(undo) = &mut self.undo {
            if !undo.mutation_queues.contains_key(&user_key) {
                let previous = self.state.mutation_queues.get(&user_key).cloned();
                undo.mutation_queues.insert(user_key.clone(), previous);
            }
        }
        self.state.mutation_queues.entry(user_key).or_default()
    }

    fn mutation_queues_contain_key(&self, key: &DocumentKey) -> bool {
        self.state
            .mutation_queues
            .values()
            .any(|queue| queue.contains_key(key))
    }

    fn remote_document_cache(&mut self) -> &mut dyn RemoteDocumentCache {
        &mut self.state.remote_documents
    }

    fn target_cache(&mut self) -> &mut dyn TargetCache {
        &mut self.state.target_cache
    }

    fn bundle_cache(&mut self) -> &mut dyn BundleCache {
        if let Some(undo) = &mut self.undo {
            if undo.bundle_cache.is_none() {
                undo.bundle_cache = Some(self.state.bundle_cache.clone());
            }
        }
        &mut self.state.bundle_cache
    }

    fn add_reference(&mut self, key: &DocumentKey) {
        if let ReferenceDelegate::Eager { orphaned } = &mut self.state.delegate {
            orphaned.remove(key);
            return;
        }
        self.set_orphaned_sequence_number(key, Some(self.current_sequence_number));
    }

    fn remove_reference(&mut self, key: &DocumentKey) {
        self.mark_orphaned(key);
    }

    fn remove_mutation_reference(&mut self, key: &DocumentKey) {
        self.mark_orphaned(key);
    }

    fn remove_target(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        if let ReferenceDelegate::Lru { .. } = self.state.delegate {
            let updated = target_data
                .clone()
                .with_sequence_number(self.current_sequence_number);
            return self.state.target_cache.update_target_data(updated);
        }
        let keys = self
            .state
            .target_cache
            .get_matching_keys_for_target_id(target_data.target_id);
        for key in &keys {
            self.mark_orphaned(key);
        }
        self.state.target_cache.remove_target_data(target_data);
        Ok(())
    }

    fn update_limbo_document(&mut self, key: &DocumentKey) {
        self.mark_orphaned(key);
    }

    fn lru_delegate(&mut self) -> Option<&mut dyn LruDelegate> {
        match self.state.delegate {
            ReferenceDelegate::Lru { .. } => Some(self as &mut dyn LruDelegate),
            ReferenceDelegate::Eager { .. } => None,
        }
    }
}

impl LruDelegate for MemoryTransaction<'_> {
    fn sequence_number_count(&self) -> usize {
        self.state.target_cache.target_count() + self.orphaned_document_sequence_numbers().len()
    }

    fn target_sequence_numbers(&self) -> Vec<ListenSequenceNumber> {
        self.state.target_cache.target_sequence_numbers()
    }

    fn orphaned_document_sequence_numbers(&self) -> Vec<ListenSequenceNumber> {
        let ReferenceDelegate::Lru {
            orphaned_sequence_numbers,
            ..
        } = &self.state.delegate
        else {
            return Vec::new();
        };
        orphaned_sequence_numbers
            .iter()
            .filter(|(key, _)| !self.is_referenced(key))
            .map(|(_, sequence_number)| *sequence_number)
            .collect()
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        self.state
            .target_cache
            .remove_targets(upper_bound, active_target_ids)
    }

    fn remove_orphaned_documents(&mut self, upper_bound: ListenSequenceNumber) -> usize {
        let removable: Vec<DocumentKey> = self
            .state
            .remote_documents
            .keys()
            .into_iter()
            .filter(|key| !self.is_pinned(key, upper_bound))
            .collect();
        for key in &removable {
            self.state.remote_documents.remove_entry(key);
            self.set_orphaned_sequence_number(key, None);
        }
        removable.len()
    }

    fn cache_size(&self) -> i64 {
        self.state.remote_documents.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, FirestoreErrorCode};
    use crate::firestore::local::TargetPurpose;
    use crate::test_support::{doc, key, query, version};

    fn persistence() -> Arc<dyn Persistence> {
        Arc::new(MemoryPersistence::with_eager_gc())
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let persistence = persistence();
        let result: FirestoreResult<()> =
            persistence.run_transaction("write then fail", TransactionMode::ReadWrite, |txn| {
                txn.remote_document_cache()
                    .add_entry(doc("c/a", 1, &[]).into(), version(1))?;
                Err(internal_error("boom"))
            });
        assert!(result.is_err());

        let found = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok(txn.remote_document_cache().get_entry(&key("c/a")))
            })
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn failed_transaction_restores_touched_caches() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(MemoryPersistence::with_lru_gc(LruParams::DEFAULT));
        let (target, seeded_size) = persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                txn.remote_document_cache()
                    .add_entry(doc("c/a", 1, &[]).into(), version(1))?;
                let target_id = txn.target_cache().allocate_target_id();
                let data = TargetData::new(
                    query("c").to_target(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                txn.target_cache().add_target_data(data.clone())?;
                let keys: DocumentKeySet = [key("c/a")].into_iter().collect();
                txn.target_cache().add_matching_keys(&keys, target_id);
                Ok((data, txn.remote_document_cache().size()))
            })
            .unwrap();

        let mut failed_sequence_number = ListenSequence::INVALID;
        let result: FirestoreResult<()> =
            persistence.run_transaction("touch then fail", TransactionMode::ReadWrite, |txn| {
                failed_sequence_number = txn.current_sequence_number();
                txn.remote_document_cache().remove_entry(&key("c/a"));
                txn.remote_document_cache()
                    .add_entry(doc("c/b", 2, &[]).into(), version(2))?;
                txn.target_cache()
                    .remove_matching_keys_for_target_id(target.target_id);
                txn.target_cache().allocate_target_id();
                txn.remove_target(&target)?;
                txn.remove_reference(&key("c/a"));
                Err(internal_error("boom"))
            });
        assert!(result.is_err());

        persistence
            .run_transaction("verify", TransactionMode::ReadWrite, |txn| {
                assert_eq!(txn.current_sequence_number(), failed_sequence_number);
                let documents = txn.remote_document_cache();
                assert!(documents.get_entry(&key("c/a")).is_some());
                assert!(documents.get_entry(&key("c/b")).is_none());
                assert_eq!(documents.size(), seeded_size);

                let targets = txn.target_cache();
                assert_eq!(targets.get_target_data(&target.target), Some(target.clone()));
                assert_eq!(
                    targets.get_matching_keys_for_target_id(target.target_id),
                    [key("c/a")].into_iter().collect::<DocumentKeySet>()
                );
                assert_eq!(targets.allocate_target_id(), target.target_id + 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn primary_transactions_require_the_lease() {
        let persistence = persistence();
        persistence.set_primary(false);
        let err = persistence
            .run_transaction("primary only", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_primary_lease_lost());

        persistence.shutdown();
        let err = persistence
            .run_transaction("after shutdown", TransactionMode::ReadOnly, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn eager_delegate_collects_unreferenced_documents() {
        let persistence = persistence();
        let pins = Arc::new(StdMutex::new(ReferenceSet::new()));
        persistence.set_in_memory_pins(pins.clone());
        pins.lock().unwrap().add_reference(key("c/pinned"), 2);

        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                for path in ["c/a", "c/b", "c/pinned"] {
                    txn.remote_document_cache()
                        .add_entry(doc(path, 1, &[]).into(), version(1))?;
                }
                let keys: DocumentKeySet = [key("c/b")].into_iter().collect();
                txn.add_matching_keys(&keys, 2);
                for path in ["c/a", "c/pinned"] {
                    txn.remove_reference(&key(path));
                }
                Ok(())
            })
            .unwrap();

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok(txn.remote_document_cache().keys())
            })
            .unwrap();
        assert_eq!(
            remaining,
            [key("c/b"), key("c/pinned")].into_iter().collect::<DocumentKeySet>()
        );
    }

    #[test]
    fn lru_remove_target_only_bumps_sequence_number() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(MemoryPersistence::with_lru_gc(LruParams::DEFAULT));
        let target = persistence
            .run_transaction("allocate", TransactionMode::ReadWrite, |txn| {
                let target_id = txn.target_cache().allocate_target_id();
                let data = TargetData::new(
                    query("rooms").to_target(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                txn.target_cache().add_target_data(data.clone())?;
                Ok(data)
            })
            .unwrap();

        let stored = persistence
            .run_transaction("release", TransactionMode::ReadWritePrimary, |txn| {
                txn.remove_target(&target)?;
                assert!(txn.lru_delegate().is_some());
                Ok(txn.target_cache().get_target_data(&target.target))
            })
            .unwrap()
            .expect("target kept for LRU");
        assert!(stored.sequence_number > target.sequence_number);
    }
}
