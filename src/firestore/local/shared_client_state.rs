use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{BatchId, OnlineState, TargetId, User};
use crate::firestore::error::FirestoreError;

/// State of a pending write as broadcast between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

/// State of a query target as broadcast between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Channel through which clients sharing one cache learn about each other's
/// targets, writes and online state.
///
/// The sync engine only ever talks to this interface; the primary lease
/// itself is arbitrated by the persistence layer.
pub trait SharedClientState: Send + Sync {
    fn client_id(&self) -> &str;

    fn add_pending_mutation(&mut self, batch_id: BatchId);

    fn update_mutation_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    );

    /// Registers a target listened to by this client and returns the state
    /// other clients last reported for it.
    fn add_local_query_target(&mut self, target_id: TargetId) -> QueryTargetState;

    fn remove_local_query_target(&mut self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any client still listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    /// Union of the targets of every client.
    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn update_query_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    );

    fn clear_query_state(&mut self, target_id: TargetId);

    fn handle_user_change(&mut self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&mut self, online_state: OnlineState);

    /// Ids of every client currently sharing the cache.
    fn active_clients(&self) -> Vec<String>;

    fn notify_bundle_loaded(&mut self);

    fn shutdown(&mut self);
}

/// Shared state for a single client that shares its cache with nobody.
#[derive(Debug)]
pub struct MemorySharedClientState {
    client_id: String,
    query_state: BTreeMap<TargetId, QueryTargetState>,
    active_target_ids: BTreeSet<TargetId>,
    pending_batch_ids: BTreeSet<BatchId>,
    online_state: OnlineState,
    user: User,
}

impl MemorySharedClientState {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            query_state: BTreeMap::new(),
            active_target_ids: BTreeSet::new(),
            pending_batch_ids: BTreeSet::new(),
            online_state: OnlineState::Unknown,
            user: User::unauthenticated(),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn pending_batch_ids(&self) -> &BTreeSet<BatchId> {
        &self.pending_batch_ids
    }

    pub fn query_state(&self, target_id: TargetId) -> Option<QueryTargetState> {
        self.query_state.get(&target_id).copied()
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

impl Default for MemorySharedClientState {
    fn default() -> Self {
        Self::new("local")
    }
}

impl SharedClientState for MemorySharedClientState {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn add_pending_mutation(&mut self, batch_id: BatchId) {
        self.pending_batch_ids.insert(batch_id);
    }

    fn update_mutation_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        _error: Option<&FirestoreError>,
    ) {
        if state != MutationBatchState::Pending {
            self.pending_batch_ids.remove(&batch_id);
        }
    }

    fn add_local_query_target(&mut self, target_id: TargetId) -> QueryTargetState {
        let current = match self.query_state.get(&target_id) {
            Some(QueryTargetState::Current) => QueryTargetState::Current,
            Some(_) => QueryTargetState::NotCurrent,
            None => {
                self.query_state
                    .insert(target_id, QueryTargetState::NotCurrent);
                QueryTargetState::NotCurrent
            }
        };
        self.active_target_ids.insert(target_id);
        current
    }

    fn remove_local_query_target(&mut self, target_id: TargetId) {
        self.active_target_ids.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.active_target_ids.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.active_target_ids.contains(&target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.active_target_ids.clone()
    }

    fn update_query_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        _error: Option<&FirestoreError>,
    ) {
        self.query_state.insert(target_id, state);
    }

    fn clear_query_state(&mut self, target_id: TargetId) {
        self.query_state.remove(&target_id);
    }

    fn handle_user_change(&mut self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        for batch_id in removed_batch_ids {
            self.pending_batch_ids.remove(batch_id);
        }
        self.pending_batch_ids.extend(added_batch_ids.iter().copied());
        self.user = user.clone();
    }

    fn set_online_state(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
    }

    fn active_clients(&self) -> Vec<String> {
        vec![self.client_id.clone()]
    }

    fn notify_bundle_loaded(&mut self) {}

    fn shutdown(&mut self) {
        self.active_target_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_state_of_previously_seen_targets() {
        let mut state = MemorySharedClientState::default();
        assert_eq!(state.add_local_query_target(2), QueryTargetState::NotCurrent);
        state.update_query_state(2, QueryTargetState::Current, None);
        state.remove_local_query_target(2);
        assert!(!state.is_active_query_target(2));

        assert_eq!(state.add_local_query_target(2), QueryTargetState::Current);
        assert_eq!(state.get_all_active_query_targets(), BTreeSet::from([2]));

        state.clear_query_state(2);
        assert_eq!(state.query_state(2), None);
    }

    #[test]
    fn tracks_pending_mutations_across_user_changes() {
        let mut state = MemorySharedClientState::new("client-a");
        state.add_pending_mutation(1);
        state.add_pending_mutation(2);
        state.update_mutation_state(1, MutationBatchState::Acknowledged, None);
        state.update_mutation_state(2, MutationBatchState::Pending, None);
        assert_eq!(state.pending_batch_ids(), &BTreeSet::from([2]));

        state.handle_user_change(&User::new("alice"), &[2], &[7]);
        assert_eq!(state.pending_batch_ids(), &BTreeSet::from([7]));
        assert_eq!(state.user(), &User::new("alice"));
        assert_eq!(state.active_clients(), vec!["client-a".to_string()]);
    }
}
