use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};

use crate::firestore::core::{BatchId, OnlineState, OnlineStateSource, Query, TargetId, User, View, ViewSnapshot};
use crate::firestore::error::{cancelled, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    BundleContents, IndexFreeQueryEngine, LoadBundleProgress, LocalStore, LruResults, LruScheduler,
    Persistence, SharedClientState, SyncEngine, SyncEngineListener,
};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, MaybeDocument, MaybeDocumentMap, Mutation, MutationBatch,
    MutationBatchResult,
};
use crate::firestore::remote::{box_remote_syncer_future, RemoteEvent, RemoteStore, RemoteSyncer, RemoteSyncerFuture};
use crate::firestore::settings::{GarbageCollectionSettings, SyncEngineSettings};
use crate::firestore::util::AsyncQueue;

type SnapshotSender = mpsc::UnboundedSender<FirestoreResult<ViewSnapshot>>;

/// Stream of snapshots for one listened query.
///
/// The first item is the snapshot computed from the local cache. A rejected
/// query yields a single error and the stream ends.
#[derive(Debug)]
pub struct QueryListener {
    query: Query,
    listener_id: u64,
    receiver: mpsc::UnboundedReceiver<FirestoreResult<ViewSnapshot>>,
}

impl QueryListener {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn next_snapshot(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.next().await
    }

    /// Returns a snapshot that is already available without waiting.
    pub fn try_next_snapshot(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.try_next().ok().flatten()
    }
}

#[derive(Default)]
struct QueryListeners {
    senders: Vec<(u64, SnapshotSender)>,
    last_snapshot: Option<ViewSnapshot>,
}

/// Fans sync engine snapshots out to every listener of a query.
#[derive(Default)]
struct EventManager {
    queries: StdMutex<BTreeMap<String, QueryListeners>>,
    online_state: StdMutex<Option<OnlineState>>,
}

impl EventManager {
    /// Registers a listener. Returns whether it is the first one for the
    /// query; later listeners immediately receive the latest snapshot.
    fn add_listener(&self, query: &Query, listener_id: u64, sender: SnapshotSender) -> bool {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners = queries.entry(query.canonical_id()).or_default();
        let first = listeners.senders.is_empty();
        if let Some(snapshot) = &listeners.last_snapshot {
            let _ = sender.unbounded_send(Ok(snapshot.clone()));
        }
        listeners.senders.push((listener_id, sender));
        first
    }

    /// Removes a listener. Returns whether it was the last one.
    fn remove_listener(&self, query: &Query, listener_id: u64) -> bool {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        let canonical_id = query.canonical_id();
        let Some(listeners) = queries.get_mut(&canonical_id) else {
            return false;
        };
        let before = listeners.senders.len();
        listeners.senders.retain(|(id, _)| *id != listener_id);
        if listeners.senders.len() == before {
            return false;
        }
        if listeners.senders.is_empty() {
            queries.remove(&canonical_id);
            return true;
        }
        false
    }

    fn online_state(&self) -> Option<OnlineState> {
        *self.online_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        for snapshot in snapshots {
            let Some(listeners) = queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            listeners
                .senders
                .retain(|(_, sender)| sender.unbounded_send(Ok(snapshot.clone())).is_ok());
            listeners.last_snapshot = Some(snapshot);
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self
            .queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&query.canonical_id());
        for (_, sender) in removed.map(|listeners| listeners.senders).unwrap_or_default() {
            let _ = sender.unbounded_send(Err(error.clone()));
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        *self.online_state.lock().unwrap_or_else(PoisonError::into_inner) = Some(online_state);
    }
}

/// Entry point tying a sync engine to its async queue.
///
/// Every call is scheduled on the queue, so the engine only ever runs one
/// operation at a time. The client also acts as the [`RemoteSyncer`] of the
/// remote store it was built with.
pub struct FirestoreClient {
    queue: AsyncQueue<SyncEngine>,
    event_manager: Arc<EventManager>,
    next_listener_id: AtomicU64,
    gc_scheduler: StdMutex<Option<LruScheduler>>,
}

impl FirestoreClient {
    /// Starts the local store for `initial_user` and builds the engine.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote_store: Arc<dyn RemoteStore>,
        shared_client_state: Box<dyn SharedClientState>,
        initial_user: User,
        settings: SyncEngineSettings,
    ) -> FirestoreResult<Self> {
        let mut local_store = LocalStore::new(persistence, Box::new(IndexFreeQueryEngine), initial_user);
        local_store.start()?;

        let event_manager = Arc::new(EventManager::default());
        let mut sync_engine = SyncEngine::new(local_store, remote_store, shared_client_state, &settings);
        sync_engine.set_listener(event_manager.clone());

        let gc_scheduler = match settings.garbage_collection() {
            GarbageCollectionSettings::Lru(params) => Some(LruScheduler::new(params)),
            GarbageCollectionSettings::Eager => None,
        };
        Ok(Self {
            queue: AsyncQueue::new(sync_engine),
            event_manager,
            next_listener_id: AtomicU64::new(1),
            gc_scheduler: StdMutex::new(gc_scheduler),
        })
    }

    /// The fatal error that stopped the client, if any.
    pub fn failure(&self) -> Option<FirestoreError> {
        self.queue.failure()
    }

    pub fn online_state(&self) -> Option<OnlineState> {
        self.event_manager.online_state()
    }

    /// Schedules periodic LRU collection. A no-op under eager collection.
    pub fn start_garbage_collection(&self) {
        let mut scheduler = self.gc_scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(scheduler) = scheduler.as_mut() else {
            return;
        };
        let queue = self.queue.clone();
        scheduler.start(move || {
            let queue = queue.clone();
            async move {
                queue
                    .enqueue(|engine| async move { engine.collect_garbage() }.boxed())
                    .await
            }
        });
    }

    pub async fn listen(&self, query: Query) -> FirestoreResult<QueryListener> {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded();
        let event_manager = Arc::clone(&self.event_manager);
        let listened = query.clone();

        self.queue
            .enqueue(move |engine| {
                async move {
                    if !event_manager.add_listener(&listened, listener_id, sender) {
                        return Ok(());
                    }
                    match engine.listen(listened.clone()).await {
                        Ok(snapshot) => {
                            event_manager.on_watch_change(vec![snapshot]);
                            Ok(())
                        }
                        Err(err) => {
                            event_manager.remove_listener(&listened, listener_id);
                            Err(err)
                        }
                    }
                }
                .boxed()
            })
            .await?;

        Ok(QueryListener {
            query,
            listener_id,
            receiver,
        })
    }

    /// Stops `listener`. The query is unlistened once its last listener is
    /// gone.
    pub async fn unlisten(&self, listener: QueryListener) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue(move |engine| {
                async move {
                    if event_manager.remove_listener(&listener.query, listener.listener_id) {
                        engine.unlisten(&listener.query).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// Applies `mutations` locally and resolves once the backend accepted
    /// them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (callback, acknowledged) = oneshot::channel();
        self.queue
            .enqueue(move |engine| engine.write(mutations, callback).boxed())
            .await?;
        acknowledged
            .await
            .map_err(|_| cancelled("The write was dropped before the backend answered"))?
    }

    /// Resolves once every write issued so far was acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (callback, done) = oneshot::channel();
        self.queue
            .enqueue(move |engine| async move { engine.register_pending_writes_callback(callback) }.boxed())
            .await?;
        done.await
            .map_err(|_| cancelled("The client was terminated with writes still pending"))?
    }

    /// Reads `key` from the local cache with pending writes applied. `None`
    /// means the document is known not to exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let maybe_doc = self
            .queue
            .enqueue(move |engine| async move { engine.local_store().read_document(&key) }.boxed())
            .await?;
        match maybe_doc {
            Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
            Some(MaybeDocument::NoDocument(_)) => Ok(None),
            _ => Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. \
                 Run again without reading from the cache to attempt to retrieve the document from the server.)",
            )),
        }
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.queue
            .enqueue(move |engine| {
                async move {
                    let query_result = engine.local_store().execute_query(&query, true)?;
                    let mut view = View::new(query, query_result.remote_keys);
                    let documents: MaybeDocumentMap = query_result
                        .documents
                        .into_iter()
                        .map(|(key, doc)| (key, doc.into()))
                        .collect();
                    let doc_changes = view.compute_doc_changes(&documents, None)?;
                    let view_change = view.apply_changes(doc_changes, false, None)?;
                    Ok(view_change
                        .snapshot
                        .unwrap_or_else(|| view.compute_initial_snapshot()))
                }
                .boxed()
            })
            .await
    }

    pub async fn load_bundle_documents(&self, bundle: BundleContents) -> FirestoreResult<LoadBundleProgress> {
        self.queue
            .enqueue(move |engine| engine.apply_bundle_documents(bundle).boxed())
            .await
    }

    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |engine| engine.handle_credential_change(user).boxed())
            .await
    }

    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |engine| engine.apply_primary_state(is_primary).boxed())
            .await
    }

    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.queue
            .enqueue(|engine| async move { engine.collect_garbage() }.boxed())
            .await
    }

    /// Stops the engine. Every later operation fails.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if let Some(scheduler) = self
            .gc_scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            scheduler.stop();
        }
        self.queue
            .enqueue_and_initiate_shutdown(|engine| engine.shutdown().boxed())
            .await
    }
}

impl RemoteSyncer for FirestoreClient {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteSyncerFuture<'_, FirestoreResult<()>> {
        box_remote_syncer_future(
            self.queue
                .enqueue(move |engine| engine.apply_remote_event(event).boxed()),
        )
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>> {
        box_remote_syncer_future(
            self.queue
                .enqueue(move |engine| engine.reject_listen(target_id, error).boxed()),
        )
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>> {
        box_remote_syncer_future(
            self.queue
                .enqueue(move |engine| engine.apply_successful_write(result).boxed()),
        )
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>> {
        box_remote_syncer_future(
            self.queue
                .enqueue(move |engine| engine.reject_failed_write(batch_id, error).boxed()),
        )
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteSyncerFuture<'_, FirestoreResult<()>> {
        box_remote_syncer_future(self.queue.enqueue(move |engine| {
            async move { engine.apply_online_state_change(online_state, OnlineStateSource::RemoteStore) }.boxed()
        }))
    }

    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<DocumentKeySet>> {
        box_remote_syncer_future(
            self.queue
                .enqueue(move |engine| async move { Ok(engine.get_remote_keys_for_target(target_id)) }.boxed()),
        )
    }

    fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_syncer_future(self.queue.enqueue(move |engine| {
            async move { engine.local_store().next_mutation_batch(after_batch_id) }.boxed()
        }))
    }
}

impl std::fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::{MemoryPersistence, MemorySharedClientState};
    use crate::firestore::remote::NoopRemoteStore;
    use crate::firestore::settings::LruParams;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{key, query, set_mutation};

    fn client() -> (FirestoreClient, Arc<NoopRemoteStore>) {
        let remote = Arc::new(NoopRemoteStore::new());
        let client = FirestoreClient::new(
            Arc::new(MemoryPersistence::with_lru_gc(LruParams::DEFAULT)),
            remote.clone(),
            Box::new(MemorySharedClientState::default()),
            User::unauthenticated(),
            SyncEngineSettings::default(),
        )
        .unwrap();
        (client, remote)
    }

    #[tokio::test]
    async fn second_listener_shares_the_target() {
        let (client, remote) = client();
        let mut first = client.listen(query("rooms")).await.unwrap();
        let mut second = client.listen(query("rooms")).await.unwrap();
        assert_eq!(remote.listen_targets().len(), 1);
        assert!(first.try_next_snapshot().unwrap().unwrap().docs.is_empty());
        assert!(second.try_next_snapshot().is_some());

        client.unlisten(first).await.unwrap();
        assert_eq!(remote.listen_targets().len(), 1);
        client.unlisten(second).await.unwrap();
        assert!(remote.listen_targets().is_empty());
    }

    #[tokio::test]
    async fn local_writes_reach_listeners_and_cache_reads() {
        let (client, _remote) = client();
        let mut listener = client.listen(query("rooms")).await.unwrap();
        listener.try_next_snapshot();

        let x1 = [("x", FirestoreValue::from_integer(1))];
        let (callback, _acknowledged) = oneshot::channel();
        client
            .queue
            .enqueue(move |engine| engine.write(vec![set_mutation("rooms/a", &x1)], callback).boxed())
            .await
            .unwrap();

        let snapshot = listener.try_next_snapshot().unwrap().unwrap();
        assert!(snapshot.has_pending_writes());
        let cached = client
            .get_document_from_local_cache(key("rooms/a"))
            .await
            .unwrap()
            .unwrap();
        assert!(cached.has_local_mutations());

        let from_cache = client.get_documents_from_local_cache(query("rooms")).await.unwrap();
        assert_eq!(from_cache.docs.len(), 1);
        assert!(from_cache.from_cache);

        let missing = client.get_document_from_local_cache(key("rooms/b")).await.unwrap_err();
        assert_eq!(missing.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn terminated_client_rejects_operations() {
        let (client, remote) = client();
        client.wait_for_pending_writes().await.unwrap();
        client.terminate().await.unwrap();
        assert!(!remote.can_use_network());

        let err = client.listen(query("rooms")).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }
}
