use std::collections::BTreeMap;

use crate::firestore::core::TargetId;
use crate::firestore::model::{DocumentKeySet, MaybeDocumentMap, SnapshotVersion};

/// Aggregated result of a batch of watch responses, applied atomically to the
/// local store.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; their cached mapping
    /// must be rebuilt from scratch.
    pub target_mismatches: Vec<TargetId>,
    pub document_updates: MaybeDocumentMap,
    /// Limbo documents confirmed (or denied) by their resolution target.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// Event telling the local store that `target_id` became current without
    /// any document changes. Used when a listen stream goes quiet and for
    /// rejected limbo lookups.
    pub fn synthesize_current_change(
        snapshot_version: SnapshotVersion,
        target_id: TargetId,
        current: bool,
    ) -> Self {
        let mut event = Self::new(snapshot_version);
        event
            .target_changes
            .insert(target_id, TargetChange::create_synthesized(current));
        event
    }
}

/// Per-target change metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn create_synthesized(current: bool) -> Self {
        Self {
            current,
            ..Default::default()
        }
    }

    pub fn has_key_changes(&self) -> bool {
        !(self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty())
    }
}
