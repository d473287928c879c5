use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::{BatchId, OnlineState, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKeySet, MutationBatch, MutationBatchResult};
use crate::firestore::remote::RemoteEvent;

pub type RemoteSyncerFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_remote_syncer_future<'a, F, T>(future: F) -> RemoteSyncerFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks a remote store uses to hand watch and write results back to
/// the sync engine.
///
/// Implementations route every call through the client's async queue, so
/// callbacks never run concurrently with other engine work.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a `RemoteEvent` produced by the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteSyncerFuture<'_, FirestoreResult<()>>;

    /// Signals that a watch target was rejected by the backend.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>>;

    /// Applies the acknowledgement for a committed mutation batch.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>>;

    /// Rejects a pending mutation batch the backend refused.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<()>>;

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteSyncerFuture<'_, FirestoreResult<()>>;

    /// Keys the engine currently considers part of the target; used to
    /// evaluate existence filters.
    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<DocumentKeySet>>;

    /// Next pending batch to send after `after_batch_id`.
    fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> RemoteSyncerFuture<'_, FirestoreResult<Option<MutationBatch>>>;
}
