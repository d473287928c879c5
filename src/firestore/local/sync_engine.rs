use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::channel::oneshot;

use crate::firestore::core::{
    BatchId, LimboDocumentChange, ListenSequence, OnlineState, OnlineStateSource, Query, TargetId,
    TargetIdGenerator, User, View, ViewSnapshot, BATCH_ID_UNKNOWN,
};
use crate::firestore::error::{
    cancelled, ignore_if_primary_lease_loss, internal_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::missing_document;
use crate::firestore::local::{
    BundleContents, LoadBundleProgress, LocalStore, LocalViewChanges, LruGarbageCollector,
    LruResults, MutationBatchState, QueryTargetState, ReferenceSet, SharedClientState, TargetData,
    TargetPurpose,
};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocumentMap, Mutation, MutationBatchResult,
    SnapshotVersion,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, TargetChange};
use crate::firestore::settings::{GarbageCollectionSettings, SyncEngineSettings};

/// Resolved once a write is acknowledged, or failed with the backend's
/// rejection.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receives what the sync engine produces for its queries.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query's target was rejected; the query is no longer listened to.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// An in-flight existence check for one limbo document.
#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the resolution target has reported the document. Its remote
    /// keys are derived from this flag.
    received_document: bool,
}

/// Orchestrates the local store, the remote store and the views of every
/// listened query.
///
/// All methods expect to be called from the client's async queue, one at a
/// time.
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: Arc<dyn RemoteStore>,
    shared_client_state: Box<dyn SharedClientState>,
    listener: Option<Arc<dyn SyncEngineListener>>,
    current_user: User,
    max_concurrent_limbo_resolutions: usize,
    garbage_collector: Option<LruGarbageCollector>,
    query_views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, in FIFO order.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Limbo documents keyed by the query targets that put them in limbo.
    limbo_document_refs: ReferenceSet,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    limbo_target_id_generator: TargetIdGenerator,
    online_state: OnlineState,
    is_primary_client: bool,
}

impl SyncEngine {
    /// Creates an engine over a started `local_store`.
    pub fn new(
        local_store: LocalStore,
        remote_store: Arc<dyn RemoteStore>,
        shared_client_state: Box<dyn SharedClientState>,
        settings: &SyncEngineSettings,
    ) -> Self {
        let garbage_collector = match settings.garbage_collection() {
            GarbageCollectionSettings::Lru(params) => Some(LruGarbageCollector::new(params)),
            GarbageCollectionSettings::Eager => None,
        };
        let current_user = local_store.current_user().clone();
        let is_primary_client = local_store.persistence().is_primary();
        Self {
            local_store,
            remote_store,
            shared_client_state,
            listener: None,
            current_user,
            max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions(),
            garbage_collector,
            query_views_by_query: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            mutation_user_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            online_state: OnlineState::Unknown,
            is_primary_client,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn SyncEngineListener>) {
        self.listener = Some(listener);
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn is_primary_client(&self) -> bool {
        self.is_primary_client
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Limbo documents with an active resolution target, by key.
    pub fn active_limbo_documents(&self) -> &BTreeMap<DocumentKey, TargetId> {
        &self.active_limbo_targets_by_key
    }

    /// Limbo documents still waiting for a resolution slot.
    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts listening to `query` and returns its first snapshot, computed
    /// from the local cache.
    pub async fn listen(&mut self, query: Query) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
            // Another client already set up this view's target.
            let target_id = query_view.target_id;
            let snapshot = query_view.view.compute_initial_snapshot();
            self.shared_client_state.add_local_query_target(target_id);
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let status = self.shared_client_state.add_local_query_target(target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                query,
                target_id,
                status == QueryTargetState::Current,
                target_data.resume_token.clone(),
            )
            .await?;
        if self.is_primary_client {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    /// Stops listening to `query`. The target is released once no query and
    /// no other client uses it.
    pub async fn unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = self
            .query_views_by_query
            .get(&canonical_id)
            .map(|query_view| query_view.target_id)
            .ok_or_else(|| internal_error(format!("Trying to unlisten on query not found: {canonical_id}")))?;

        // Only clean up the target once the last query using it is gone.
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|candidate| candidate.canonical_id() != canonical_id);
                self.query_views_by_query.remove(&canonical_id);
                return Ok(());
            }
        }

        if self.is_primary_client {
            // We need to remove the local query target first to allow us to
            // verify whether any other client is still interested in this
            // target.
            self.shared_client_state.remove_local_query_target(target_id);
            if !self.shared_client_state.is_active_query_target(target_id) {
                // Without the lease the new primary owns the target.
                let released =
                    ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
                if released.is_some() {
                    self.shared_client_state.clear_query_state(target_id);
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(target_id, None).await?;
                }
            }
        } else {
            self.remove_and_cleanup_target(target_id, None).await?;
            self.local_store.release_target(target_id, true)?;
        }
        Ok(())
    }

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` completes when the backend accepts or rejects the batch.
    pub async fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(err) if err.is_fatal() => {
                let _ = callback.send(Err(err.clone()));
                return Err(err);
            }
            Err(err) => {
                log::warn!("Failed to persist write: {err}");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };

        self.shared_client_state.add_pending_mutation(result.batch_id);
        self.mutation_user_callbacks
            .entry(self.current_user.to_key())
            .or_default()
            .insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Merges a watch snapshot and updates every affected view.
    pub async fn apply_remote_event(&mut self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        let changes = match self.local_store.apply_remote_event(&remote_event) {
            Ok(changes) => changes,
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!("Ignoring remote event after losing the primary lease: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.update_received_limbo_documents(&remote_event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&remote_event))
            .await
    }

    /// Tracks whether each limbo target has seen its document, once the
    /// event carrying it is applied.
    fn update_received_limbo_documents(&mut self, remote_event: &RemoteEvent) -> FirestoreResult<()> {
        for (target_id, target_change) in &remote_event.target_changes {
            let Some(limbo_resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            // A limbo target is a single-document listen.
            let change_count = target_change.added_documents.len()
                + target_change.modified_documents.len()
                + target_change.removed_documents.len();
            if change_count > 1 {
                return Err(internal_error("Limbo resolution for single document contains multiple changes."));
            }
            if !target_change.added_documents.is_empty() {
                limbo_resolution.received_document = true;
            } else if !target_change.modified_documents.is_empty() {
                if !limbo_resolution.received_document {
                    return Err(internal_error("Received change for limbo target document without add."));
                }
            } else if !target_change.removed_documents.is_empty() {
                if !limbo_resolution.received_document {
                    return Err(internal_error("Received remove for limbo target document without add."));
                }
                limbo_resolution.received_document = false;
            }
        }
        Ok(())
    }

    /// Applies an online state change to every view. Primary clients accept
    /// changes from the remote store, secondary clients from the shared
    /// client state.
    pub fn apply_online_state_change(
        &mut self,
        online_state: OnlineState,
        source: OnlineStateSource,
    ) -> FirestoreResult<()> {
        let accepted = match source {
            OnlineStateSource::RemoteStore => self.is_primary_client,
            OnlineStateSource::SharedClientState => !self.is_primary_client,
        };
        if !accepted {
            return Ok(());
        }

        let mut new_snapshots = Vec::new();
        for query_view in self.query_views_by_query.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state)?;
            debug_assert!(
                view_change.limbo_changes.is_empty(),
                "OnlineState should not affect limbo documents."
            );
            new_snapshots.extend(view_change.snapshot);
        }
        if let Some(listener) = &self.listener {
            listener.on_online_state_change(online_state);
        }
        self.raise_snapshots(new_snapshots);
        self.online_state = online_state;
        if self.is_primary_client {
            self.shared_client_state.set_online_state(online_state);
        }
        Ok(())
    }

    /// Handles the backend rejecting a listen. A rejected limbo target is
    /// treated as proof that the document does not exist.
    pub async fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));

        let limbo_key = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());
        if let Some(limbo_key) = limbo_key {
            // Treat the document as deleted at version zero, which never
            // reaches the remote document cache.
            let mut event = RemoteEvent::new(SnapshotVersion::min());
            event
                .document_updates
                .insert(limbo_key.clone(), missing_document(limbo_key.clone()));
            event.resolved_limbo_documents.insert(limbo_key.clone());
            self.apply_remote_event(event).await?;

            // The failed target is not unlistened; only the bookkeeping goes.
            self.active_limbo_targets_by_key.remove(&limbo_key);
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.pump_enqueued_limbo_resolutions().await
        } else {
            let released =
                ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
            if released.is_some() {
                self.remove_and_cleanup_target(target_id, Some(error)).await?;
            }
            Ok(())
        }
    }

    pub async fn apply_successful_write(&mut self, batch_result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = batch_result.batch().batch_id();
        let changes = match self.local_store.acknowledge_batch(&batch_result) {
            Ok(changes) => changes,
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!("Ignoring acknowledgment after losing the primary lease: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // The local store may or may not be able to apply the write result
        // and raise events immediately, so the user callback is resolved
        // first.
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    pub async fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!("Ignoring rejection after losing the primary lease: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.process_user_callback(batch_id, Some(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    /// Keys the engine treats as the backend's current result for
    /// `target_id`.
    pub fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::from([resolution.key.clone()]);
            }
        }

        let mut keys = DocumentKeySet::new();
        let Some(queries) = self.queries_by_target.get(&target_id) else {
            return keys;
        };
        for query in queries {
            if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    /// Resolves `callback` once every write pending right now has been
    /// acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network() {
            log::debug!(
                "The network is disabled. The task returned by 'wait_for_pending_writes' will not complete until the network is enabled."
            );
        }

        match self.local_store.highest_unacknowledged_batch_id() {
            Ok(BATCH_ID_UNKNOWN) => {
                let _ = callback.send(Ok(()));
                Ok(())
            }
            Ok(highest_batch_id) => {
                self.pending_writes_callbacks
                    .entry(highest_batch_id)
                    .or_default()
                    .push(callback);
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                let _ = callback.send(Err(err.clone()));
                Err(err)
            }
            Err(err) => {
                let _ = callback.send(Err(err));
                Ok(())
            }
        }
    }

    /// Switches to `user`'s mutation queue. Pending-writes callbacks are
    /// rejected because pending writes belong to a user.
    pub async fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        let user_changed = self.current_user != user;
        if user_changed {
            log::debug!("User change. New user: {}", user.to_key());
            let result = self.local_store.handle_user_change(user.clone())?;
            self.current_user = user.clone();

            self.reject_outstanding_pending_writes_callbacks(
                "'wait_for_pending_writes' promise is rejected due to a user change.",
            );
            self.shared_client_state.handle_user_change(
                &user,
                &result.removed_batch_ids,
                &result.added_batch_ids,
            );
            self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
                .await?;
        }
        self.remote_store.handle_credential_change(user_changed).await
    }

    /// Promotes this client to primary, or demotes it. Listeners stay
    /// registered either way; only network targets move.
    pub async fn apply_primary_state(&mut self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary && !self.is_primary_client {
            log::debug!("Client became primary");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(&active_targets, true)
                .await?;
            self.is_primary_client = true;
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await?;
            }
        } else if !is_primary && self.is_primary_client {
            log::debug!("Client lost primary state");
            let mut active_targets = Vec::new();
            let target_ids: Vec<TargetId> = self.queries_by_target.keys().copied().collect();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None).await?;
                    self.local_store.release_target(target_id, true)?;
                }
                self.remote_store.unlisten(target_id).await?;
            }

            self.synchronize_query_views_and_raise_snapshots(&active_targets, false)
                .await?;
            self.reset_limbo_documents().await?;
            self.is_primary_client = false;
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Applies a batch state broadcast by another client.
    pub async fn apply_batch_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(changes) = self.local_store.lookup_mutation_documents(batch_id)? else {
            // A user change can remove the batch before this client sees it.
            log::debug!("Cannot apply mutation batch with id: {batch_id}");
            return Ok(());
        };

        match state {
            MutationBatchState::Pending => {
                // With multi-tab enabled the primary may have pushed the
                // batch through a shared queue; make sure it is sent.
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                self.process_user_callback(batch_id, error);
                self.trigger_pending_writes_callbacks(batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    /// Applies a target state broadcast by the primary client.
    pub async fn apply_target_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary_client {
            // Primary clients are the source of query state notifications.
            log::debug!("Ignoring unexpected query state notification.");
            return Ok(());
        }
        if !self
            .queries_by_target
            .get(&target_id)
            .is_some_and(|queries| !queries.is_empty())
        {
            return Ok(());
        }

        match state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.local_store.get_new_document_changes()?;
                let synthesized = RemoteEvent::synthesize_current_change(
                    SnapshotVersion::min(),
                    target_id,
                    state == QueryTargetState::Current,
                );
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&synthesized))
                    .await
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true)?;
                let error = error.unwrap_or_else(|| cancelled(format!("Target {target_id} was rejected")));
                self.remove_and_cleanup_target(target_id, Some(error)).await
            }
        }
    }

    /// Follows targets added or removed by secondary clients. Only the
    /// primary client listens on their behalf.
    pub async fn apply_active_targets_change(
        &mut self,
        added: &[TargetId],
        removed: &[TargetId],
    ) -> FirestoreResult<()> {
        if !self.is_primary_client {
            return Ok(());
        }

        for &target_id in added {
            if self.queries_by_target.contains_key(&target_id) {
                // A target might have been added in a previous attempt.
                log::debug!("Adding an already active target {target_id}");
                continue;
            }
            let target = self
                .local_store
                .get_cached_target(target_id)?
                .ok_or_else(|| internal_error(format!("Missing target data for target {target_id}")))?;
            let target_data = self.local_store.allocate_target(target.clone())?;
            self.initialize_view_and_compute_snapshot(
                Query::from_target(&target),
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )
            .await?;
            self.remote_store.listen(target_data).await?;
        }

        for &target_id in removed {
            // Check that the target is still active since it might have been
            // removed if it has been rejected by the backend.
            if !self.queries_by_target.contains_key(&target_id) {
                continue;
            }
            let released =
                ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
            if released.is_some() {
                self.remote_store.unlisten(target_id).await?;
                self.remove_and_cleanup_target(target_id, None).await?;
            }
        }
        Ok(())
    }

    pub fn get_active_clients(&self) -> Vec<String> {
        self.shared_client_state.active_clients()
    }

    /// Applies a decoded bundle unless a bundle at least as new was loaded
    /// before.
    pub async fn apply_bundle_documents(&mut self, bundle: BundleContents) -> FirestoreResult<LoadBundleProgress> {
        let total_documents = bundle.documents.len();
        if self.local_store.has_newer_bundle(&bundle.metadata)? {
            log::debug!("Skipping bundle {}; a newer copy was already loaded", bundle.metadata.id);
            return Ok(LoadBundleProgress {
                documents_loaded: total_documents,
                total_documents,
            });
        }

        let changes = self
            .local_store
            .apply_bundle_documents(&bundle.documents, &bundle.metadata.id)?;
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await?;

        for named_query in &bundle.named_queries {
            let documents = bundle.documents_for_query(&named_query.name);
            self.local_store
                .save_named_query(named_query.clone(), &documents)?;
        }
        self.local_store.save_bundle(bundle.metadata)?;
        self.shared_client_state.notify_bundle_loaded();

        Ok(LoadBundleProgress {
            documents_loaded: total_documents,
            total_documents,
        })
    }

    /// Runs LRU collection. Only the primary client collects.
    pub fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        match &self.garbage_collector {
            Some(collector) if self.is_primary_client => self.local_store.collect_garbage(collector),
            _ => Ok(LruResults::DID_NOT_RUN),
        }
    }

    pub async fn shutdown(&mut self) -> FirestoreResult<()> {
        self.reject_outstanding_pending_writes_callbacks("The client has been terminated.");
        self.remote_store.shutdown().await?;
        self.shared_client_state.shutdown();
        self.local_store.persistence().shutdown();
        Ok(())
    }

    async fn initialize_view_and_compute_snapshot(
        &mut self,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let view_doc_changes = view.compute_doc_changes(&to_maybe_documents(query_result.documents), None)?;
        let synthesized_target_change = TargetChange {
            resume_token,
            current: current && self.online_state != OnlineState::Offline,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(
            view_doc_changes,
            self.is_primary_client,
            Some(&synthesized_target_change),
        )?;
        self.update_tracked_limbos(target_id, view_change.limbo_changes)
            .await?;

        let snapshot = match view_change.snapshot {
            Some(snapshot) => snapshot,
            None => view.compute_initial_snapshot(),
        };
        self.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        Ok(snapshot)
    }

    /// Re-diffs every view against `changes` and raises the resulting
    /// snapshots.
    async fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut new_snapshots = Vec::new();
        let mut doc_changes_in_all_views = Vec::new();

        let canonical_ids: Vec<String> = self.query_views_by_query.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = self.query_views_by_query.get(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let mut view_doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if view_doc_changes.needs_refill {
                // The query has a limit and some docs were removed, so it is
                // rerun against the local store.
                let query = query_view.query.clone();
                let query_result = self.local_store.execute_query(&query, false)?;
                let documents = to_maybe_documents(query_result.documents);
                if let Some(query_view) = self.query_views_by_query.get(&canonical_id) {
                    view_doc_changes = query_view
                        .view
                        .compute_doc_changes(&documents, Some(view_doc_changes))?;
                }
            }

            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let is_primary = self.is_primary_client;
            let Some(query_view) = self.query_views_by_query.get_mut(&canonical_id) else {
                continue;
            };
            let view_change = query_view
                .view
                .apply_changes(view_doc_changes, is_primary, target_change)?;
            self.update_tracked_limbos(target_id, view_change.limbo_changes)
                .await?;

            if let Some(snapshot) = view_change.snapshot {
                if is_primary {
                    let state = if snapshot.from_cache {
                        QueryTargetState::NotCurrent
                    } else {
                        QueryTargetState::Current
                    };
                    self.shared_client_state
                        .update_query_state(target_id, state, None);
                }
                doc_changes_in_all_views.push(LocalViewChanges::from_view_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        self.raise_snapshots(new_snapshots);
        self.local_store
            .notify_local_view_changes(&doc_changes_in_all_views)
    }

    /// Reconciles the views of `target_ids` with persisted state another
    /// client may have changed. Returns the target data to listen to.
    async fn synchronize_query_views_and_raise_snapshots(
        &mut self,
        target_ids: &[TargetId],
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut new_snapshots = Vec::new();

        for &target_id in target_ids {
            let queries = self
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                // The resume token and the synced keys might have changed in
                // the meantime.
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let query_result = self.local_store.execute_query(query, true)?;
                    let Some(query_view) = self.query_views_by_query.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let view_change = query_view.view.synchronize_with_persisted_state(
                        &to_maybe_documents(query_result.documents),
                        query_result.remote_keys,
                    )?;
                    if transition_to_primary {
                        self.update_tracked_limbos(target_id, view_change.limbo_changes)
                            .await?;
                    }
                    new_snapshots.extend(view_change.snapshot);
                }
                target_data
            } else {
                // Queries that never ran on this client need a target and a
                // view.
                let target = self
                    .local_store
                    .get_cached_target(target_id)?
                    .ok_or_else(|| internal_error(format!("Missing target data for target {target_id}")))?;
                let target_data = self.local_store.allocate_target(target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    Query::from_target(&target),
                    target_id,
                    false,
                    target_data.resume_token.clone(),
                )
                .await?;
                target_data
            };
            active_queries.push(target_data);
        }

        self.raise_snapshots(new_snapshots);
        Ok(active_queries)
    }

    async fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);

        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views_by_query.remove(&query.canonical_id());
            if let (Some(error), Some(listener)) = (&error, &self.listener) {
                listener.on_watch_error(&query, error.clone());
            }
        }

        if !self.is_primary_client {
            return Ok(());
        }
        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                // The key is no longer in limbo for any view.
                self.remove_limbo_target(&key).await?;
            }
        }
        Ok(())
    }

    async fn remove_limbo_target(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            // This key may already have been removed by a previous view
            // update.
            return Ok(());
        };
        self.remote_store.unlisten(limbo_target_id).await?;
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        log::debug!("Stopped limbo resolution for {key} (target {limbo_target_id})");
        self.pump_enqueued_limbo_resolutions().await
    }

    async fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for limbo_change in limbo_changes {
            match limbo_change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key).await?;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn track_limbo_change(&mut self, key: DocumentKey) -> FirestoreResult<()> {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return Ok(());
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions().await
    }

    /// Starts queued limbo resolutions while fewer than the configured
    /// maximum are active.
    async fn pump_enqueued_limbo_resolutions(&mut self) -> FirestoreResult<()> {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            log::debug!("Started limbo resolution for {key} (target {limbo_target_id})");
            self.remote_store
                .listen(TargetData::new(
                    Query::for_document(&key).to_target(),
                    limbo_target_id,
                    TargetPurpose::LimboResolution,
                    ListenSequence::INVALID,
                ))
                .await?;
        }
        Ok(())
    }

    async fn reset_limbo_documents(&mut self) -> FirestoreResult<()> {
        let limbo_target_ids: Vec<TargetId> = self.active_limbo_targets_by_key.values().copied().collect();
        for limbo_target_id in limbo_target_ids {
            self.remote_store.unlisten(limbo_target_id).await?;
        }
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_targets_by_key.clear();
        self.active_limbo_resolutions_by_target.clear();
        self.enqueued_limbo_resolutions.clear();
        Ok(())
    }

    fn process_user_callback(&mut self, batch_id: BatchId, error: Option<FirestoreError>) {
        let Some(callbacks) = self.mutation_user_callbacks.get_mut(&self.current_user.to_key()) else {
            return;
        };
        // A batch written by another client has no callback here.
        if let Some(callback) = callbacks.remove(&batch_id) {
            let _ = callback.send(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.on_watch_change(snapshots);
        }
    }
}

fn to_maybe_documents(documents: DocumentMap) -> MaybeDocumentMap {
    documents
        .into_iter()
        .map(|(key, doc)| (key, doc.into()))
        .collect()
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("current_user", &self.current_user)
            .field("is_primary_client", &self.is_primary_client)
            .field("queries", &self.query_views_by_query.keys())
            .field("active_limbo_documents", &self.active_limbo_targets_by_key)
            .finish()
    }
}
