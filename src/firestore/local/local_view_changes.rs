use crate::firestore::core::{ChangeType, TargetId, ViewSnapshot};
use crate::firestore::model::DocumentKeySet;

/// Keys a view started or stopped showing, used to pin documents that are
/// visible locally but not part of the target's remote result.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_view_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.doc.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.doc.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
