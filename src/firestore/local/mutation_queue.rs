use std::collections::BTreeSet;

use crate::firestore::core::{BatchId, Query, BATCH_ID_UNKNOWN};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp};

/// Per-user queue of mutation batches not yet acknowledged by the backend.
///
/// Batches are kept in ascending batch id order. Batch ids are assigned by the
/// queue and never reused.
pub trait MutationQueue: Send {
    /// True when no batch is pending.
    fn check_empty(&self) -> bool;

    /// Records the backend acknowledgment of `batch`, which must be the oldest
    /// pending batch. The batch itself stays queued until removed.
    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn last_stream_token(&self) -> Vec<u8>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>);

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// Id of the newest pending batch, or [`BATCH_ID_UNKNOWN`].
    fn highest_unacknowledged_batch_id(&self) -> BatchId;

    fn all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_document_keys(&self, keys: &DocumentKeySet) -> Vec<MutationBatch>;

    /// Batches touching any document the query could match, ignoring filters.
    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()>;

    fn contains_key(&self, key: &DocumentKey) -> bool;

    /// Verifies the queue holds no stale key references once it is empty.
    fn perform_consistency_check(&self) -> FirestoreResult<()>;
}

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    batches_by_document_key: BTreeSet<(DocumentKey, BatchId)>,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: BTreeSet::new(),
        }
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Result<usize, usize> {
        self.queue
            .binary_search_by_key(&batch_id, MutationBatch::batch_id)
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> impl Iterator<Item = BatchId> + '_ {
        let key = key.clone();
        self.batches_by_document_key
            .range((key.clone(), BatchId::MIN)..)
            .take_while(move |(candidate, _)| *candidate == key)
            .map(|(_, batch_id)| *batch_id)
    }

    fn batches_for_ids(&self, batch_ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn check_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        match self.queue.first() {
            Some(first) if first.batch_id() == batch.batch_id() => {
                self.last_stream_token = stream_token;
                Ok(())
            }
            Some(first) => Err(internal_error(format!(
                "Can only acknowledge the first batch in the mutation queue (expected {}, got {})",
                first.batch_id(),
                batch.batch_id()
            ))),
            None => Err(internal_error(format!(
                "Cannot acknowledge batch {} of an empty mutation queue",
                batch.batch_id()
            ))),
        }
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.last_stream_token.clone()
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("Mutation batches should not be empty"));
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        if let Some(previous) = self.queue.last() {
            if previous.batch_id() >= batch_id {
                return Err(internal_error(
                    "Mutation batch ids must be monotonically increasing",
                ));
            }
        }

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in batch.mutations() {
            self.batches_by_document_key
                .insert((mutation.key().clone(), batch_id));
        }
        self.queue.push(batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.index_of_batch_id(batch_id)
            .ok()
            .map(|index| self.queue[index].clone())
    }

    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        // Nothing can follow the largest id.
        let next_batch_id = batch_id.checked_add(1)?;
        let index = match self.index_of_batch_id(next_batch_id) {
            Ok(index) | Err(index) => index,
        };
        self.queue.get(index).cloned()
    }

    fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.clone()
    }

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        let batch_ids = self.batch_ids_for_key(key).collect();
        self.batches_for_ids(batch_ids)
    }

    fn all_mutation_batches_affecting_document_keys(&self, keys: &DocumentKeySet) -> Vec<MutationBatch> {
        let batch_ids = keys
            .iter()
            .flat_map(|key| self.batch_ids_for_key(key))
            .collect();
        self.batches_for_ids(batch_ids)
    }

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let batch_ids = self
            .batches_by_document_key
            .iter()
            .filter(|(key, _)| query.matches_key(key))
            .map(|(_, batch_id)| *batch_id)
            .collect();
        self.batches_for_ids(batch_ids)
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        let index = self.index_of_batch_id(batch.batch_id()).map_err(|_| {
            internal_error(format!(
                "Cannot remove batch {} that is not in the mutation queue",
                batch.batch_id()
            ))
        })?;
        self.queue.remove(index);
        for mutation in batch.mutations() {
            self.batches_by_document_key
                .remove(&(mutation.key().clone(), batch.batch_id()));
        }
        Ok(())
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.queue.is_empty() && !self.batches_by_document_key.is_empty() {
            return Err(internal_error(
                "Document leak -- detected dangling mutation references when queue is empty.",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{key, query, set_mutation};

    fn add(queue: &mut MemoryMutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths.iter().map(|path| set_mutation(path, &[])).collect();
        queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), mutations)
            .unwrap()
    }

    #[test]
    fn assigns_increasing_batch_ids() {
        let mut queue = MemoryMutationQueue::new();
        assert!(queue.check_empty());
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);

        let first = add(&mut queue, &["c/a"]);
        let second = add(&mut queue, &["c/b"]);
        assert!(first.batch_id() < second.batch_id());
        assert_eq!(queue.highest_unacknowledged_batch_id(), second.batch_id());
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN),
            Some(first.clone())
        );
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(first.batch_id()),
            Some(second)
        );
    }

    #[test]
    fn no_batch_follows_the_largest_id() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, &["c/a"]);
        assert_eq!(queue.next_mutation_batch_after_batch_id(BatchId::MAX), None);
    }

    #[test]
    fn acknowledge_requires_first_batch() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, &["c/a"]);
        let second = add(&mut queue, &["c/b"]);

        let err = queue.acknowledge_batch(&second, vec![1]).unwrap_err();
        assert!(err.is_fatal());
        assert!(queue.lookup_mutation_batch(first.batch_id()).is_some());

        queue.acknowledge_batch(&first, vec![2]).unwrap();
        assert_eq!(queue.last_stream_token(), vec![2]);
    }

    #[test]
    fn removing_any_batch_keeps_the_rest() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, &["c/a"]);
        let second = add(&mut queue, &["c/a", "c/b"]);

        queue.remove_mutation_batch(&second).unwrap();
        assert_eq!(queue.all_mutation_batches(), vec![first.clone()]);
        assert!(!queue.contains_key(&key("c/b")));
        assert!(queue.contains_key(&key("c/a")));

        queue.remove_mutation_batch(&first).unwrap();
        assert!(queue.check_empty());
        queue.perform_consistency_check().unwrap();
        assert!(queue.remove_mutation_batch(&first).is_err());
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, &["rooms/a"]);
        let second = add(&mut queue, &["rooms/b", "other/x"]);
        add(&mut queue, &["rooms/a/messages/1"]);

        assert_eq!(
            queue.all_mutation_batches_affecting_document_key(&key("rooms/a")),
            vec![first.clone()]
        );
        let keys: DocumentKeySet = [key("rooms/a"), key("other/x")].into_iter().collect();
        assert_eq!(
            queue.all_mutation_batches_affecting_document_keys(&keys),
            vec![first.clone(), second.clone()]
        );
        assert_eq!(
            queue.all_mutation_batches_affecting_query(&query("rooms")),
            vec![first, second]
        );
    }
}
