use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{ListenSequenceNumber, Target, TargetId, TargetIdGenerator};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{ReferenceSet, TargetData};
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};

/// Persisted metadata about every target the client listened to, plus the
/// document keys the backend reported for each.
pub trait TargetCache: Send {
    /// Hands out a fresh even target id.
    fn allocate_target_id(&mut self) -> TargetId;

    fn highest_sequence_number(&self) -> ListenSequenceNumber;

    /// Global snapshot version of the last consistent remote event.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_target_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    );

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    /// Removes the target and its matching keys.
    fn remove_target_data(&mut self, target_data: &TargetData);

    /// Removes targets with a sequence number at or below `upper_bound` that
    /// are not in `active_target_ids`. Returns how many were removed.
    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize;

    fn target_count(&self) -> usize;

    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn get_target_data_for_target_id(&self, target_id: TargetId) -> Option<TargetData>;

    fn target_sequence_numbers(&self) -> Vec<ListenSequenceNumber>;

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> DocumentKeySet;

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet;

    /// Whether any target references `key`.
    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: BTreeMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    references: ReferenceSet,
    target_id_generator: TargetIdGenerator,
    journal: Option<TargetCacheJournal>,
}

/// State needed to undo the writes of one transaction: the prior value of
/// every target and reference it touched, plus the scalar metadata.
#[derive(Clone, Debug)]
struct TargetCacheJournal {
    targets: BTreeMap<String, Option<TargetData>>,
    references: BTreeMap<(DocumentKey, TargetId), bool>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    target_id_generator: TargetIdGenerator,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            references: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(0),
            journal: None,
        }
    }

    /// Starts recording prior values so the next writes can be undone.
    pub(crate) fn begin_journal(&mut self) {
        self.journal = Some(TargetCacheJournal {
            targets: BTreeMap::new(),
            references: BTreeMap::new(),
            last_remote_snapshot_version: self.last_remote_snapshot_version,
            highest_target_id: self.highest_target_id,
            highest_sequence_number: self.highest_sequence_number,
            target_id_generator: self.target_id_generator.clone(),
        });
    }

    pub(crate) fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Restores the state from before [`begin_journal`](Self::begin_journal).
    pub(crate) fn rollback_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (canonical_id, previous) in journal.targets {
            match previous {
                Some(target_data) => {
                    self.targets.insert(canonical_id, target_data);
                }
                None => {
                    self.targets.remove(&canonical_id);
                }
            }
        }
        for ((key, target_id), present) in journal.references {
            if present {
                self.references.add_reference(key, target_id);
            } else {
                self.references.remove_reference(&key, target_id);
            }
        }
        self.last_remote_snapshot_version = journal.last_remote_snapshot_version;
        self.highest_target_id = journal.highest_target_id;
        self.highest_sequence_number = journal.highest_sequence_number;
        self.target_id_generator = journal.target_id_generator;
    }

    fn record_target(&mut self, canonical_id: &str) {
        if let Some(journal) = &mut self.journal {
            if !journal.targets.contains_key(canonical_id) {
                journal
                    .targets
                    .insert(canonical_id.to_string(), self.targets.get(canonical_id).cloned());
            }
        }
    }

    fn record_references(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        if let Some(journal) = &mut self.journal {
            for key in keys {
                let present = self.references.contains(key, target_id);
                journal
                    .references
                    .entry((key.clone(), target_id))
                    .or_insert(present);
            }
        }
    }

    fn remove_references_for_target(&mut self, target_id: TargetId) -> DocumentKeySet {
        let removed = self.references.remove_references_for_id(target_id);
        if let Some(journal) = &mut self.journal {
            for key in &removed {
                journal
                    .references
                    .entry((key.clone(), target_id))
                    .or_insert(true);
            }
        }
        removed
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::for_target_cache(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.record_target(target_data.target.canonical_id());
        self.targets
            .insert(target_data.target.canonical_id().to_string(), target_data);
    }
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> TargetId {
        let target_id = self.target_id_generator.next();
        self.highest_target_id = target_id;
        target_id
    }

    fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_target_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
        if highest_listen_sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = highest_listen_sequence_number;
        }
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if self.targets.contains_key(target_data.target.canonical_id()) {
            return Err(internal_error(format!(
                "Adding a target that already exists: {}",
                target_data.target.canonical_id()
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if !self.targets.contains_key(target_data.target.canonical_id()) {
            return Err(internal_error(format!(
                "Updating a non-existent target: {}",
                target_data.target.canonical_id()
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_data: &TargetData) {
        self.record_target(target_data.target.canonical_id());
        self.targets.remove(target_data.target.canonical_id());
        self.remove_references_for_target(target_data.target_id);
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let removable: Vec<(String, TargetId)> = self
            .targets
            .iter()
            .filter(|(_, data)| {
                data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id)
            })
            .map(|(canonical_id, data)| (canonical_id.clone(), data.target_id))
            .collect();
        for (canonical_id, target_id) in &removable {
            self.record_target(canonical_id);
            self.targets.remove(canonical_id);
            self.remove_references_for_target(*target_id);
        }
        removable.len()
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(target.canonical_id()).cloned()
    }

    fn get_target_data_for_target_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets
            .values()
            .find(|data| data.target_id == target_id)
            .cloned()
    }

    fn target_sequence_numbers(&self) -> Vec<ListenSequenceNumber> {
        self.targets.values().map(|data| data.sequence_number).collect()
    }

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.record_references(keys, target_id);
        self.references.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.record_references(keys, target_id);
        self.references.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> DocumentKeySet {
        self.remove_references_for_target(target_id)
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::TargetPurpose;
    use crate::test_support::{key, query};

    fn target_data(cache: &mut MemoryTargetCache, path: &str, sequence_number: i64) -> TargetData {
        let target_id = cache.allocate_target_id();
        TargetData::new(
            query(path).to_target(),
            target_id,
            TargetPurpose::Listen,
            sequence_number,
        )
    }

    #[test]
    fn stores_targets_by_canonical_id() {
        let mut cache = MemoryTargetCache::new();
        let rooms = target_data(&mut cache, "rooms", 1);
        cache.add_target_data(rooms.clone()).unwrap();
        assert!(cache.add_target_data(rooms.clone()).is_err());
        assert_eq!(cache.get_target_data(&query("rooms").to_target()), Some(rooms.clone()));
        assert_eq!(cache.get_target_data_for_target_id(rooms.target_id), Some(rooms.clone()));
        assert_eq!(cache.target_count(), 1);
        assert_eq!(cache.highest_sequence_number(), 1);

        let updated = rooms.with_sequence_number(7);
        cache.update_target_data(updated).unwrap();
        assert_eq!(cache.highest_sequence_number(), 7);
        let unknown = target_data(&mut cache, "other", 1);
        assert!(cache.update_target_data(unknown).is_err());
    }

    #[test]
    fn allocates_even_ids() {
        let mut cache = MemoryTargetCache::new();
        let first = cache.allocate_target_id();
        let second = cache.allocate_target_id();
        assert_eq!(first % 2, 0);
        assert_eq!(second, first + 2);
    }

    #[test]
    fn matching_keys_follow_target_removal() {
        let mut cache = MemoryTargetCache::new();
        let rooms = target_data(&mut cache, "rooms", 1);
        cache.add_target_data(rooms.clone()).unwrap();
        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.add_matching_keys(&keys, rooms.target_id);
        assert!(cache.contains_key(&key("rooms/a")));

        cache.remove_matching_keys(&[key("rooms/a")].into_iter().collect(), rooms.target_id);
        assert!(!cache.contains_key(&key("rooms/a")));

        cache.remove_target_data(&rooms);
        assert!(!cache.contains_key(&key("rooms/b")));
        assert_eq!(cache.target_count(), 0);
    }

    #[test]
    fn removes_only_inactive_targets_below_bound() {
        let mut cache = MemoryTargetCache::new();
        let old = target_data(&mut cache, "old", 1);
        let active = target_data(&mut cache, "active", 1);
        let recent = target_data(&mut cache, "recent", 10);
        for data in [&old, &active, &recent] {
            cache.add_target_data(data.clone()).unwrap();
        }
        let active_ids: BTreeSet<TargetId> = [active.target_id].into_iter().collect();
        assert_eq!(cache.remove_targets(5, &active_ids), 1);
        assert!(cache.get_target_data(&old.target).is_none());
        assert_eq!(cache.target_count(), 2);
    }
}
