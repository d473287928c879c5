use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use crate::firestore::core::{BatchId, Query, Target, TargetId, User};
use crate::firestore::error::{
    internal_error, invalid_argument, FirestoreResult,
};
use crate::firestore::local::{
    BundleMetadata, BundledDocument, LocalDocumentsView, LocalViewChanges, LruGarbageCollector,
    LruResults, NamedQuery, Persistence, PersistenceTransaction, QueryEngine, ReferenceSet,
    TargetData, TargetPurpose, TransactionMode,
};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, DocumentVersionMap, FieldMask, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationBatch, MutationBatchResult, NoDocument,
    NullableMaybeDocumentMap, ResourcePath, SnapshotVersion, Timestamp,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};

/// Resume tokens older than this are persisted even without key changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of [`LocalStore::local_write`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MaybeDocumentMap,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: DocumentKeySet,
}

/// Result of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: MaybeDocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Local cache of documents, targets and pending writes.
///
/// Every read and write goes through a persistence transaction. The store
/// additionally keeps the target data of active targets in memory, which may
/// hold a newer resume token than the persisted copy.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    query_engine: Box<dyn QueryEngine>,
    user: User,
    local_view_references: Arc<StdMutex<ReferenceSet>>,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_target: BTreeMap<String, TargetId>,
    last_document_change_read_time: SnapshotVersion,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        query_engine: Box<dyn QueryEngine>,
        initial_user: User,
    ) -> Self {
        let local_view_references = Arc::new(StdMutex::new(ReferenceSet::new()));
        persistence.set_in_memory_pins(local_view_references.clone());
        Self {
            persistence,
            query_engine,
            user: initial_user,
            local_view_references,
            target_data_by_target: BTreeMap::new(),
            target_ids_by_target: BTreeMap::new(),
            last_document_change_read_time: SnapshotVersion::min(),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> &User {
        &self.user
    }

    pub fn start(&mut self) -> FirestoreResult<()> {
        let user = &self.user;
        let read_time = self.persistence.run_transaction(
            "Start LocalStore",
            TransactionMode::ReadOnly,
            |txn| {
                txn.mutation_queue(user).perform_consistency_check()?;
                let (_, read_time) = txn
                    .remote_document_cache()
                    .get_new_document_changes(SnapshotVersion::min());
                Ok(read_time)
            },
        )?;
        self.last_document_change_read_time = read_time;
        Ok(())
    }

    /// Switches to `user`'s mutation queue and returns every document whose
    /// local view may differ between the two users.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_user = &self.user;
        let result = self.persistence.run_transaction(
            "Handle user change",
            TransactionMode::ReadOnly,
            |txn| {
                let old_batches = txn.mutation_queue(old_user).all_mutation_batches();
                let new_batches = txn.mutation_queue(&user).all_mutation_batches();

                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(&new_batches) {
                    changed_keys.extend(batch.keys());
                }
                let affected_documents =
                    LocalDocumentsView::new(txn, &user).get_documents(&changed_keys)?;
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids: old_batches.iter().map(MutationBatch::batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(MutationBatch::batch_id).collect(),
                })
            },
        )?;
        log::debug!("LocalStore switched to user {user}");
        self.user = user;
        Ok(result)
    }

    /// Queues `mutations` as a new batch and returns the resulting local
    /// view of every touched document.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        if mutations.iter().any(|m| matches!(m, Mutation::Verify(_))) {
            return Err(invalid_argument(
                "Verify mutations can only be used in transactions",
            ));
        }
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();
        let user = &self.user;

        let (batch, mut existing_docs) = self.persistence.run_transaction(
            "Locally write mutations",
            TransactionMode::ReadWrite,
            |txn| {
                let existing_docs = LocalDocumentsView::new(txn, user).get_documents(&keys)?;

                // Non-idempotent transforms record the value they start from
                // so reapplying them never flickers.
                let base_mutations = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let base_value =
                            mutation.extract_base_value(existing_docs.get(mutation.key()))?;
                        let field_mask = FieldMask::from_map_value(&base_value);
                        Some(Mutation::patch(mutation.key().clone(), base_value, field_mask))
                    })
                    .collect();

                let batch = txn.mutation_queue(user).add_mutation_batch(
                    local_write_time,
                    base_mutations,
                    mutations,
                )?;
                Ok((batch, existing_docs))
            },
        )?;

        batch.apply_to_local_document_set(&mut existing_docs)?;
        Ok(LocalWriteResult {
            batch_id: batch.batch_id(),
            changes: existing_docs,
        })
    }

    /// Local view of the documents a pending batch touches.
    pub fn lookup_mutation_documents(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MaybeDocumentMap>> {
        let user = &self.user;
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                let Some(batch) = txn.mutation_queue(user).lookup_mutation_batch(batch_id) else {
                    return Ok(None);
                };
                LocalDocumentsView::new(txn, user)
                    .get_documents(&batch.keys())
                    .map(Some)
            })
    }

    /// Applies the backend's acknowledgment of the oldest pending batch.
    pub fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let user = &self.user;
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = batch_result.batch();
                let affected = batch.keys();
                txn.mutation_queue(user)
                    .acknowledge_batch(batch, batch_result.stream_token().to_vec())?;
                apply_write_to_remote_documents(txn, user, batch_result)?;
                txn.mutation_queue(user).perform_consistency_check()?;
                LocalDocumentsView::new(txn, user).get_documents(&affected)
            })
    }

    /// Drops a pending batch the backend refused.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<MaybeDocumentMap> {
        let user = &self.user;
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = txn
                    .mutation_queue(user)
                    .lookup_mutation_batch(batch_id)
                    .ok_or_else(|| internal_error("Attempt to reject nonexistent batch!"))?;
                let affected = batch.keys();
                remove_mutation_batch(txn, user, &batch)?;
                txn.mutation_queue(user).perform_consistency_check()?;
                LocalDocumentsView::new(txn, user).get_documents(&affected)
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let user = &self.user;
        self.persistence.run_transaction(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue(user).highest_unacknowledged_batch_id()),
        )
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let user = &self.user;
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                Ok(txn.mutation_queue(user).last_stream_token())
            })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let user = &self.user;
        self.persistence.run_transaction(
            "Set last stream token",
            TransactionMode::ReadWritePrimary,
            |txn| {
                txn.mutation_queue(user).set_last_stream_token(stream_token);
                Ok(())
            },
        )
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence.run_transaction(
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.target_cache().last_remote_snapshot_version()),
        )
    }

    /// Merges a watch snapshot into the cache and returns the local view of
    /// every document that changed.
    pub fn apply_remote_event(&mut self, remote_event: &RemoteEvent) -> FirestoreResult<MaybeDocumentMap> {
        let remote_version = remote_event.snapshot_version;
        let user = &self.user;
        let target_data_by_target = &self.target_data_by_target;

        let (changed_docs, updated_targets) = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let mut updated_targets = Vec::new();
                for (target_id, change) in &remote_event.target_changes {
                    // Only active targets keep their remote keys up to date.
                    let Some(old_target_data) = target_data_by_target.get(target_id) else {
                        continue;
                    };
                    txn.remove_matching_keys(&change.removed_documents, *target_id);
                    txn.add_matching_keys(&change.added_documents, *target_id);

                    let mut new_target_data =
                        old_target_data.with_sequence_number(txn.current_sequence_number());
                    if remote_event.target_mismatches.contains(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data = new_target_data
                            .with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(old_target_data, &new_target_data, change) {
                        txn.target_cache().update_target_data(new_target_data.clone())?;
                    }
                    updated_targets.push(new_target_data);
                }

                let changed_docs = populate_document_changes(
                    txn,
                    &remote_event.document_updates,
                    remote_version,
                    None,
                )?;
                for key in remote_event.document_updates.keys() {
                    if remote_event.resolved_limbo_documents.contains(key) {
                        txn.update_limbo_document(key);
                    }
                }

                // Synthesized events for rejected limbo resolutions carry no
                // version.
                if !remote_version.is_min() {
                    let last_remote_version = txn.target_cache().last_remote_snapshot_version();
                    if remote_version < last_remote_version {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot?? {remote_version} < {last_remote_version}"
                        )));
                    }
                    let sequence_number = txn.current_sequence_number();
                    txn.target_cache()
                        .set_target_metadata(sequence_number, Some(remote_version));
                }

                let changed_docs = LocalDocumentsView::new(txn, user)
                    .get_local_view_of_documents(changed_docs)?;
                Ok((changed_docs, updated_targets))
            },
        )?;

        for target_data in updated_targets {
            self.target_data_by_target
                .insert(target_data.target_id, target_data);
        }
        Ok(changed_docs)
    }

    /// Pins documents that views show but whose targets may not reference,
    /// and advances the limbo-free version of targets that are in sync.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let references = &self.local_view_references;
        let result = self.persistence.run_transaction(
            "notifyLocalViewChanges",
            TransactionMode::ReadWrite,
            |txn| {
                for view_change in view_changes {
                    let mut pins = references.lock().unwrap_or_else(PoisonError::into_inner);
                    pins.add_references(&view_change.added_keys, view_change.target_id);
                    pins.remove_references(&view_change.removed_keys, view_change.target_id);
                    drop(pins);
                    for key in &view_change.removed_keys {
                        txn.remove_reference(key);
                    }
                }
                Ok(())
            },
        );
        if let Err(err) = result {
            if err.is_fatal() {
                return Err(err);
            }
            log::debug!("Failed to update sequence numbers: {err}");
        }

        for view_change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = self.target_data_by_target.get_mut(&view_change.target_id) {
                let last_limbo_free = target_data.snapshot_version;
                *target_data = target_data.with_last_limbo_free_snapshot_version(last_limbo_free);
            }
        }
        Ok(())
    }

    /// First pending batch after `after_batch_id`, for the write pipeline.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let user = &self.user;
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                Ok(txn
                    .mutation_queue(user)
                    .next_mutation_batch_after_batch_id(after_batch_id))
            })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        let user = &self.user;
        self.persistence
            .run_transaction("read document", TransactionMode::ReadOnly, |txn| {
                LocalDocumentsView::new(txn, user).get_document(key)
            })
    }

    /// Returns the target data of `target`, assigning a new target id the
    /// first time the target is seen.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.persistence.run_transaction(
            "Allocate target",
            TransactionMode::ReadWrite,
            |txn| {
                if let Some(cached) = txn.target_cache().get_target_data(&target) {
                    return Ok(cached);
                }
                let target_id = txn.target_cache().allocate_target_id();
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                txn.target_cache().add_target_data(target_data.clone())?;
                Ok(target_data)
            },
        )?;

        // Another client may have persisted a newer version of the target.
        let is_newer = self
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if is_newer {
            self.target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            self.target_ids_by_target
                .insert(target.canonical_id().to_string(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Target data of an active target, falling back to the persisted copy.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.active_target_data(target) {
            return Ok(Some(target_data.clone()));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                Ok(txn.target_cache().get_target_data(target))
            })
    }

    pub fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        if let Some(target_data) = self.target_data_by_target.get(&target_id) {
            return Ok(Some(target_data.target.clone()));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                Ok(txn
                    .target_cache()
                    .get_target_data_for_target_id(target_id)
                    .map(|target_data| target_data.target))
            })
    }

    /// Stops tracking an active target. Unless `keep_persisted_target_data`
    /// is set, the target is handed to the garbage collector, which needs
    /// the primary lease; without it the target stays active.
    pub fn release_target(
        &mut self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let target_data = self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("Tried to release nonexistent target: {target_id}")))?;
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };

        let references = &self.local_view_references;
        let result = self
            .persistence
            .run_transaction("Release target", mode, |txn| {
                let removed = references
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove_references_for_id(target_id);
                for key in &removed {
                    txn.remove_reference(key);
                }
                if !keep_persisted_target_data {
                    txn.remove_target(&target_data)?;
                }
                Ok(())
            });
        result?;

        self.target_data_by_target.remove(&target_id);
        self.target_ids_by_target
            .remove(target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the cache. Without `use_previous_results` the
    /// previously synced keys are ignored and the whole collection is
    /// scanned.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let active = self.active_target_data(&target).cloned();
        let user = &self.user;
        let query_engine = &self.query_engine;

        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let target_data = match active {
                    Some(target_data) => Some(target_data),
                    None => txn.target_cache().get_target_data(&target),
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        txn.target_cache()
                            .get_matching_keys_for_target_id(target_data.target_id),
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::new()),
                };

                let mut view = LocalDocumentsView::new(txn, user);
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(
                        &mut view,
                        query,
                        last_limbo_free,
                        &remote_keys,
                    )?
                } else {
                    query_engine.get_documents_matching_query(
                        &mut view,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    /// Keys the backend reported for `target_id`.
    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                Ok(txn.target_cache().get_matching_keys_for_target_id(target_id))
            })
    }

    /// Documents written to the cache since the previous call, including
    /// changes made by other clients.
    pub fn get_new_document_changes(&mut self) -> FirestoreResult<MaybeDocumentMap> {
        let since = self.last_document_change_read_time;
        let (changes, read_time) = self.persistence.run_transaction(
            "Get new document changes",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.remote_document_cache().get_new_document_changes(since)),
        )?;
        self.last_document_change_read_time = read_time;
        Ok(changes)
    }

    pub fn collect_garbage(&self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active_target_ids: BTreeSet<TargetId> =
            self.target_data_by_target.keys().copied().collect();
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                match txn.lru_delegate() {
                    Some(delegate) => garbage_collector.collect(delegate, &active_target_ids),
                    None => Ok(LruResults::DID_NOT_RUN),
                }
            })
    }

    /// Merges bundled documents into the cache as if they came from the
    /// backend and pins them under the bundle's umbrella target.
    pub fn apply_bundle_documents(
        &mut self,
        documents: &[BundledDocument],
        bundle_name: &str,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let mut document_keys = DocumentKeySet::new();
        let mut document_map = MaybeDocumentMap::new();
        let mut version_map = DocumentVersionMap::new();
        for bundled in documents {
            if bundled.document.is_some() {
                document_keys.insert(bundled.key.clone());
            }
            document_map.insert(bundled.key.clone(), bundled.to_maybe_document());
            version_map.insert(bundled.key.clone(), bundled.read_time);
        }

        let umbrella = self.allocate_target(umbrella_target(bundle_name))?;
        let user = &self.user;
        self.persistence
            .run_transaction("Apply bundle documents", TransactionMode::ReadWrite, |txn| {
                let changed_docs = populate_document_changes(
                    txn,
                    &document_map,
                    SnapshotVersion::min(),
                    Some(&version_map),
                )?;
                replace_matching_keys(txn, &document_keys, umbrella.target_id);
                LocalDocumentsView::new(txn, user).get_local_view_of_documents(changed_docs)
            })
    }

    /// Whether a bundle at least as new as `metadata` was already loaded.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence
            .run_transaction("hasNewerBundle", TransactionMode::ReadOnly, |txn| {
                Ok(txn
                    .bundle_cache()
                    .get_bundle_metadata(&metadata.id)
                    .is_some_and(|cached| cached.create_time >= metadata.create_time))
            })
    }

    pub fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |txn| {
                txn.bundle_cache().save_bundle_metadata(metadata);
                Ok(())
            })
    }

    pub fn get_named_query(&self, query_name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", TransactionMode::ReadOnly, |txn| {
                Ok(txn.bundle_cache().get_named_query(query_name))
            })
    }

    /// Saves a named query and, when the bundle is newer than the cache,
    /// resets its target so a later listen resumes from the bundle.
    pub fn save_named_query(
        &mut self,
        named_query: NamedQuery,
        documents: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        let allocated = self.allocate_target(named_query.query.to_target())?;
        let read_time = named_query.read_time;
        let updated = (allocated.snapshot_version < read_time)
            .then(|| allocated.with_resume_token(Vec::new(), read_time));

        self.persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |txn| {
                if let Some(updated) = &updated {
                    txn.target_cache().update_target_data(updated.clone())?;
                    replace_matching_keys(txn, documents, updated.target_id);
                }
                txn.bundle_cache().save_named_query(named_query);
                Ok(())
            })?;

        if let Some(updated) = updated {
            self.target_data_by_target.insert(updated.target_id, updated);
        }
        Ok(())
    }

    fn active_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_target
            .get(target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
    }
}

/// Target that keeps a bundle's documents from being collected.
fn umbrella_target(bundle_name: &str) -> Target {
    Query::new(ResourcePath::from_segments(["__bundle__", "docs", bundle_name])).to_target()
}

fn replace_matching_keys(
    txn: &mut dyn PersistenceTransaction,
    keys: &DocumentKeySet,
    target_id: TargetId,
) {
    let existing = txn.target_cache().get_matching_keys_for_target_id(target_id);
    txn.remove_matching_keys(&existing, target_id);
    txn.add_matching_keys(keys, target_id);
}

fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    // Always persist target data if we don't already have a resume token.
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.has_key_changes()
}

/// Writes `documents` into the remote document cache where they are newer
/// than the cached state. Returns the documents that were applied.
fn populate_document_changes(
    txn: &mut dyn PersistenceTransaction,
    documents: &MaybeDocumentMap,
    global_version: SnapshotVersion,
    document_versions: Option<&DocumentVersionMap>,
) -> FirestoreResult<NullableMaybeDocumentMap> {
    let keys: DocumentKeySet = documents.keys().cloned().collect();
    let existing_docs = txn.remote_document_cache().get_entries(&keys);

    let mut changed_docs = NullableMaybeDocumentMap::new();
    for (key, doc) in documents {
        let existing = existing_docs.get(key).and_then(Option::as_ref);
        let read_time = document_versions
            .and_then(|versions| versions.get(key).copied())
            .unwrap_or(global_version);

        // Rejected limbo resolutions fabricate a missing document at version
        // zero; it must never be added to the cache.
        if matches!(doc, MaybeDocument::NoDocument(_)) && doc.version().is_min() {
            txn.remote_document_cache().remove_entry(key);
            changed_docs.insert(key.clone(), Some(doc.clone()));
            continue;
        }

        let is_newer = match existing {
            None => true,
            Some(existing) => {
                doc.version() > existing.version()
                    || (doc.version() == existing.version() && existing.has_pending_writes())
            }
        };
        if is_newer {
            txn.remote_document_cache().add_entry(doc.clone(), read_time)?;
            changed_docs.insert(key.clone(), Some(doc.clone()));
        } else if let Some(existing) = existing {
            log::debug!(
                "Ignoring outdated watch update for {key}. Current version: {} Watch version: {}",
                existing.version(),
                doc.version()
            );
        }
    }
    Ok(changed_docs)
}

fn apply_write_to_remote_documents(
    txn: &mut dyn PersistenceTransaction,
    user: &User,
    batch_result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let batch = batch_result.batch();
    for key in batch.keys() {
        let remote_doc = txn.remote_document_cache().get_entry(&key);
        let ack_version = batch_result
            .doc_versions()
            .get(&key)
            .copied()
            .ok_or_else(|| internal_error("ack versions should contain every doc in the write"))?;

        let is_stale = remote_doc
            .as_ref()
            .map_or(true, |doc| doc.version() < ack_version);
        if !is_stale {
            continue;
        }
        if let Some(doc) = batch.apply_to_remote_document(&key, remote_doc, batch_result)? {
            // The commit version is the read time; the update time does not
            // advance for writes that leave the document unchanged.
            txn.remote_document_cache()
                .add_entry(doc, batch_result.commit_version())?;
        }
    }
    remove_mutation_batch(txn, user, batch)
}

fn remove_mutation_batch(
    txn: &mut dyn PersistenceTransaction,
    user: &User,
    batch: &MutationBatch,
) -> FirestoreResult<()> {
    txn.mutation_queue(user).remove_mutation_batch(batch)?;
    for key in batch.keys() {
        txn.remove_mutation_reference(&key);
    }
    Ok(())
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("user", &self.user)
            .field("active_targets", &self.target_data_by_target.keys())
            .finish()
    }
}

/// Fabricated deletion reported for a limbo document whose resolution was
/// rejected.
pub(crate) fn missing_document(key: DocumentKey) -> MaybeDocument {
    NoDocument::new(key, SnapshotVersion::min()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::{IndexFreeQueryEngine, MemoryPersistence};
    use crate::firestore::model::MutationResult;
    use crate::firestore::settings::LruParams;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{
        deleted_doc, doc, key, map, patch_mutation, query, set_mutation, version,
    };

    fn store() -> LocalStore {
        store_with(MemoryPersistence::with_eager_gc())
    }

    fn store_with(persistence: MemoryPersistence) -> LocalStore {
        let mut store = LocalStore::new(
            Arc::new(persistence),
            Box::new(IndexFreeQueryEngine),
            User::unauthenticated(),
        );
        store.start().unwrap();
        store
    }

    fn ack(store: &LocalStore, batch_id: BatchId, micros: i64) -> MaybeDocumentMap {
        let batch = store
            .next_mutation_batch(batch_id - 1)
            .unwrap()
            .expect("pending batch");
        let results = batch
            .mutations()
            .iter()
            .map(|_| MutationResult::new(version(micros), None))
            .collect();
        let result = MutationBatchResult::from(batch, version(micros), results, b"token".to_vec()).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_event(
        micros: i64,
        target_id: TargetId,
        docs: Vec<MaybeDocument>,
        current: bool,
    ) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(micros));
        let mut change = TargetChange {
            resume_token: format!("token-{micros}").into_bytes(),
            current,
            ..TargetChange::default()
        };
        for maybe_doc in docs {
            if maybe_doc.is_document() {
                change.added_documents.insert(maybe_doc.key().clone());
            } else {
                change.removed_documents.insert(maybe_doc.key().clone());
            }
            event
                .document_updates
                .insert(maybe_doc.key().clone(), maybe_doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn local_write_is_visible_until_acknowledged() {
        let store = store();
        let x1 = [("x", FirestoreValue::from_integer(1))];
        let result = store.local_write(vec![set_mutation("rooms/a", &x1)]).unwrap();
        let written = result.changes[&key("rooms/a")].as_document().cloned().unwrap();
        assert!(written.has_local_mutations());

        let read = store.read_document(&key("rooms/a")).unwrap().unwrap();
        assert!(read.has_pending_writes());

        let changes = ack(&store, result.batch_id, 5);
        let acked = changes[&key("rooms/a")].as_document().cloned().unwrap();
        assert!(!acked.has_local_mutations());
        assert_eq!(acked.version(), version(5));
        assert_eq!(acked.data(), &map(&x1));
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), crate::firestore::core::BATCH_ID_UNKNOWN);
        assert_eq!(store.last_stream_token().unwrap(), b"token".to_vec());
    }

    #[test]
    fn rejects_verify_mutations() {
        let store = store();
        let err = store
            .local_write(vec![Mutation::verify(
                key("rooms/a"),
                crate::firestore::model::Precondition::Exists(true),
            )])
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn rejecting_a_later_batch_restores_earlier_writes() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![doc("rooms/a", 1, &[("x", FirestoreValue::from_integer(1))]).into()],
                true,
            ))
            .unwrap();

        store
            .local_write(vec![patch_mutation("rooms/a", &[("y", FirestoreValue::from_integer(2))])])
            .unwrap();
        let delete = store.local_write(vec![crate::test_support::delete_mutation("rooms/a")]).unwrap();
        assert_eq!(
            store.read_document(&key("rooms/a")).unwrap(),
            Some(NoDocument::new(key("rooms/a"), SnapshotVersion::min()).into())
        );

        let changes = store.reject_batch(delete.batch_id).unwrap();
        let restored = changes[&key("rooms/a")].as_document().cloned().unwrap();
        assert_eq!(
            restored.data(),
            &map(&[
                ("x", FirestoreValue::from_integer(1)),
                ("y", FirestoreValue::from_integer(2)),
            ])
        );
        assert!(store.reject_batch(delete.batch_id).is_err());
    }

    #[test]
    fn remote_event_keeps_newest_version() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(
                5,
                target.target_id,
                vec![doc("rooms/a", 5, &[("v", FirestoreValue::from_integer(5))]).into()],
                false,
            ))
            .unwrap();
        let stale = store
            .apply_remote_event(&remote_event(
                6,
                target.target_id,
                vec![doc("rooms/a", 3, &[("v", FirestoreValue::from_integer(3))]).into()],
                false,
            ))
            .unwrap();
        assert!(stale.is_empty());
        let cached = store.read_document(&key("rooms/a")).unwrap().unwrap();
        assert_eq!(cached.version(), version(5));
        assert_eq!(store.last_remote_snapshot_version().unwrap(), version(6));

        let reverted = store.apply_remote_event(&remote_event(4, target.target_id, Vec::new(), false));
        assert!(reverted.is_err());
    }

    #[test]
    fn remote_event_removes_fabricated_deletes() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("rooms/a", 1, &[]).into()], true))
            .unwrap();

        let mut event = RemoteEvent::new(SnapshotVersion::min());
        event
            .document_updates
            .insert(key("rooms/a"), missing_document(key("rooms/a")));
        let changes = store.apply_remote_event(&event).unwrap();
        assert!(changes[&key("rooms/a")].is_no_document());
        assert_eq!(store.read_document(&key("rooms/a")).unwrap(), None);
    }

    #[test]
    fn allocate_target_is_idempotent_and_release_forgets_it() {
        let mut store = store();
        let first = store.allocate_target(query("rooms").to_target()).unwrap();
        let second = store.allocate_target(query("rooms").to_target()).unwrap();
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(
            store.get_cached_target(first.target_id).unwrap(),
            Some(query("rooms").to_target())
        );

        store.release_target(first.target_id, false).unwrap();
        assert!(store.get_target_data(&query("rooms").to_target()).unwrap().is_none());
        assert!(store.release_target(first.target_id, false).is_err());
    }

    #[test]
    fn eager_release_collects_target_documents() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("rooms/a", 1, &[]).into()], true))
            .unwrap();
        assert!(store.read_document(&key("rooms/a")).unwrap().is_some());

        store.release_target(target.target_id, false).unwrap();
        assert_eq!(store.read_document(&key("rooms/a")).unwrap(), None);
    }

    #[test]
    fn persists_target_data_on_first_token_and_key_changes() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(1, target.target_id, Vec::new(), true))
            .unwrap();
        let persisted = |store: &LocalStore| {
            store
                .persistence()
                .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                    Ok(txn.target_cache().get_target_data(&target.target))
                })
                .unwrap()
                .unwrap()
        };
        assert_eq!(persisted(&store).resume_token, b"token-1".to_vec());

        // Only the token changed, so the stored copy lags behind.
        store
            .apply_remote_event(&remote_event(2, target.target_id, Vec::new(), true))
            .unwrap();
        assert_eq!(persisted(&store).resume_token, b"token-1".to_vec());
        assert_eq!(
            store.get_target_data(&target.target).unwrap().unwrap().resume_token,
            b"token-2".to_vec()
        );

        store
            .apply_remote_event(&remote_event(3, target.target_id, vec![doc("rooms/b", 3, &[]).into()], true))
            .unwrap();
        assert_eq!(persisted(&store).resume_token, b"token-3".to_vec());

        let mut mismatch = remote_event(4, target.target_id, Vec::new(), false);
        mismatch.target_mismatches.push(target.target_id);
        store.apply_remote_event(&mismatch).unwrap();
        let reset = store.get_target_data(&target.target).unwrap().unwrap();
        assert!(reset.resume_token.is_empty());
        assert!(reset.last_limbo_free_snapshot_version.is_min());
    }

    #[test]
    fn execute_query_reports_remote_keys() {
        let mut store = store();
        let rooms = query("rooms");
        let target = store.allocate_target(rooms.to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![doc("rooms/a", 1, &[]).into(), deleted_doc("rooms/b", 1).into()],
                true,
            ))
            .unwrap();
        store.local_write(vec![set_mutation("rooms/c", &[])]).unwrap();

        let result = store.execute_query(&rooms, true).unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/c")]
        );
        assert_eq!(result.remote_keys, [key("rooms/a")].into_iter().collect());
        assert_eq!(store.remote_document_keys(target.target_id).unwrap(), result.remote_keys);
    }

    #[test]
    fn user_change_reports_documents_of_both_queues() {
        let mut store = store();
        let first = store.local_write(vec![set_mutation("rooms/a", &[])]).unwrap();
        let result = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![first.batch_id]);
        assert!(result.added_batch_ids.is_empty());
        assert!(result.affected_documents[&key("rooms/a")].is_no_document());

        store.local_write(vec![set_mutation("rooms/b", &[])]).unwrap();
        assert!(store.read_document(&key("rooms/a")).unwrap().is_none());
        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert!(back.affected_documents[&key("rooms/a")].is_document());
    }

    #[test]
    fn local_view_changes_pin_documents_and_advance_limbo_free_version() {
        let mut store = store();
        let target = store.allocate_target(query("rooms").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("rooms/a", 1, &[]).into()], true))
            .unwrap();

        let pinned: DocumentKeySet = [key("rooms/a")].into_iter().collect();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: target.target_id,
                from_cache: false,
                added_keys: pinned,
                removed_keys: DocumentKeySet::new(),
            }])
            .unwrap();
        let advanced = store.get_target_data(&target.target).unwrap().unwrap();
        assert_eq!(advanced.last_limbo_free_snapshot_version, version(1));

        // The target no longer references the document, but the view does.
        let mut removal = remote_event(2, target.target_id, Vec::new(), true);
        removal
            .target_changes
            .get_mut(&target.target_id)
            .unwrap()
            .removed_documents
            .insert(key("rooms/a"));
        store.apply_remote_event(&removal).unwrap();
        assert!(store.read_document(&key("rooms/a")).unwrap().is_some());
    }

    #[test]
    fn bundles_are_pinned_and_named_queries_reset_targets() {
        let mut store = store();
        let bundled = vec![
            BundledDocument {
                key: key("rooms/a"),
                read_time: version(10),
                document: Some(doc("rooms/a", 9, &[])),
                queries: vec!["rooms".to_string()],
            },
            BundledDocument {
                key: key("rooms/b"),
                read_time: version(10),
                document: None,
                queries: Vec::new(),
            },
        ];
        let changes = store.apply_bundle_documents(&bundled, "bundle-1").unwrap();
        assert_eq!(changes.len(), 2);
        assert!(store.read_document(&key("rooms/a")).unwrap().is_some());

        let metadata = BundleMetadata {
            id: "bundle-1".to_string(),
            version: 1,
            create_time: version(10),
        };
        assert!(!store.has_newer_bundle(&metadata).unwrap());
        store.save_bundle(metadata.clone()).unwrap();
        assert!(store.has_newer_bundle(&metadata).unwrap());

        let named = NamedQuery {
            name: "rooms".to_string(),
            query: query("rooms"),
            read_time: version(10),
        };
        store
            .save_named_query(named.clone(), &[key("rooms/a")].into_iter().collect())
            .unwrap();
        assert_eq!(store.get_named_query("rooms").unwrap(), Some(named));
        let target = store.get_target_data(&query("rooms").to_target()).unwrap().unwrap();
        assert_eq!(target.snapshot_version, version(10));
        assert_eq!(
            store.remote_document_keys(target.target_id).unwrap(),
            [key("rooms/a")].into_iter().collect()
        );
    }

    #[test]
    fn collect_garbage_needs_lru_persistence() {
        let store = store();
        let gc = LruGarbageCollector::new(LruParams::unvalidated(0, 100, 1000));
        assert_eq!(store.collect_garbage(&gc).unwrap(), LruResults::DID_NOT_RUN);

        let mut lru = store_with(MemoryPersistence::with_lru_gc(LruParams::DEFAULT));
        let active = lru.allocate_target(query("active").to_target()).unwrap();
        let released = lru.allocate_target(query("released").to_target()).unwrap();
        lru.release_target(released.target_id, false).unwrap();
        lru.apply_remote_event(&remote_event(1, active.target_id, vec![doc("active/a", 1, &[]).into()], true))
            .unwrap();

        let results = lru.collect_garbage(&gc).unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert!(lru.read_document(&key("active/a")).unwrap().is_some());
        assert!(lru.get_target_data(&active.target).unwrap().is_some());
    }
}
