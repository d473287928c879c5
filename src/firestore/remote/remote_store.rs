use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use async_trait::async_trait;

use crate::firestore::core::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::TargetData;

/// Network side of the client as seen by the sync engine.
///
/// A remote store owns the watch and write streams. It reports results
/// through a [`RemoteSyncer`](crate::firestore::remote::RemoteSyncer).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Starts watching `target_data` on the backend.
    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()>;

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()>;

    /// Sends pending mutation batches until the write pipeline is full.
    async fn fill_write_pipeline(&self) -> FirestoreResult<()>;

    fn can_use_network(&self) -> bool;

    /// Only the primary client keeps network streams open.
    async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()>;

    /// Restarts streams with new credentials.
    async fn handle_credential_change(&self, user_changed: bool) -> FirestoreResult<()>;

    async fn shutdown(&self) -> FirestoreResult<()>;
}

/// Remote store that never talks to a backend. It records what the engine
/// asked for, which makes it usable both offline and in tests.
#[derive(Debug, Default)]
pub struct NoopRemoteStore {
    listen_targets: StdMutex<BTreeMap<TargetId, TargetData>>,
    write_pipeline_fills: AtomicUsize,
    network_disabled: AtomicBool,
    is_primary: AtomicBool,
}

impl NoopRemoteStore {
    pub fn new() -> Self {
        Self {
            is_primary: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Targets currently being listened to.
    pub fn listen_targets(&self) -> BTreeMap<TargetId, TargetData> {
        self.listen_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&target_id)
    }

    pub fn write_pipeline_fills(&self) -> usize {
        self.write_pipeline_fills.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_network_enabled(&self, enabled: bool) {
        self.network_disabled.store(!enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for NoopRemoteStore {
    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        log::debug!("listen to target {}", target_data.target_id);
        self.listen_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_data.target_id, target_data);
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        log::debug!("unlisten from target {target_id}");
        self.listen_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target_id);
        Ok(())
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.write_pipeline_fills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_use_network(&self) -> bool {
        !self.network_disabled.load(Ordering::SeqCst)
    }

    async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.is_primary.store(is_primary, Ordering::SeqCst);
        if !is_primary {
            self.listen_targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        Ok(())
    }

    async fn handle_credential_change(&self, _user_changed: bool) -> FirestoreResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        self.network_disabled.store(true, Ordering::SeqCst);
        self.listen_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
