use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::firestore::core::{ListenSequence, ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::LruDelegate;
use crate::firestore::settings::LruParams;
use crate::firestore::util::runtime;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub const DID_NOT_RUN: LruResults = LruResults {
        did_run: false,
        sequence_numbers_collected: 0,
        targets_removed: 0,
        documents_removed: 0,
    };
}

/// Keeps the `max_elements` smallest sequence numbers seen so far.
struct RollingSequenceNumberBuffer {
    buffer: BTreeSet<(ListenSequenceNumber, usize)>,
    previous_index: usize,
    max_elements: usize,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            buffer: BTreeSet::new(),
            previous_index: 0,
            max_elements,
        }
    }

    fn add_element(&mut self, sequence_number: ListenSequenceNumber) {
        self.previous_index += 1;
        let entry = (sequence_number, self.previous_index);
        if self.buffer.len() < self.max_elements {
            self.buffer.insert(entry);
            return;
        }
        if let Some(highest) = self.buffer.last().copied() {
            if entry < highest {
                self.buffer.remove(&highest);
                self.buffer.insert(entry);
            }
        }
    }

    fn max_value(&self) -> ListenSequenceNumber {
        self.buffer
            .last()
            .map(|(sequence_number, _)| *sequence_number)
            .unwrap_or(ListenSequence::INVALID)
    }
}

/// Removes the least recently used targets and documents once the cache
/// outgrows its configured threshold. Active targets and documents pinned
/// by mutations or local views are never removed.
#[derive(Clone, Copy, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// Number of sequence numbers making up `percentile` percent of the
    /// cache.
    pub fn calculate_target_count(&self, delegate: &dyn LruDelegate, percentile: u32) -> usize {
        let count = delegate.sequence_number_count();
        (f64::from(percentile) / 100.0 * count as f64).floor() as usize
    }

    /// The `n`th lowest sequence number across targets and orphaned
    /// documents.
    pub fn nth_sequence_number(&self, delegate: &dyn LruDelegate, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return ListenSequence::INVALID;
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        for sequence_number in delegate.target_sequence_numbers() {
            buffer.add_element(sequence_number);
        }
        for sequence_number in delegate.orphaned_document_sequence_numbers() {
            buffer.add_element(sequence_number);
        }
        buffer.max_value()
    }

    pub fn remove_targets(
        &self,
        delegate: &mut dyn LruDelegate,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        delegate.remove_targets(upper_bound, active_target_ids)
    }

    pub fn remove_orphaned_documents(
        &self,
        delegate: &mut dyn LruDelegate,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        delegate.remove_orphaned_documents(upper_bound)
    }

    pub fn collect(
        &self,
        delegate: &mut dyn LruDelegate,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            log::debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::DID_NOT_RUN);
        }

        let cache_size = delegate.cache_size();
        let threshold = self.params.cache_size_collection_threshold();
        if cache_size < threshold {
            log::debug!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {threshold}"
            );
            return Ok(LruResults::DID_NOT_RUN);
        }
        Ok(self.run_garbage_collection(delegate, active_target_ids))
    }

    fn run_garbage_collection(
        &self,
        delegate: &mut dyn LruDelegate,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> LruResults {
        let start = Instant::now();
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(delegate, self.params.percentile_to_collect());
        let maximum = self.params.maximum_sequence_numbers_to_collect();
        if sequence_numbers_to_collect > maximum {
            log::debug!(
                "Capping sequence numbers to collect down to the maximum of {maximum} from {sequence_numbers_to_collect}"
            );
            sequence_numbers_to_collect = maximum;
        }
        let counted_targets = Instant::now();

        let upper_bound = self.nth_sequence_number(delegate, sequence_numbers_to_collect);
        let found_upper_bound = Instant::now();

        let targets_removed = self.remove_targets(delegate, upper_bound, active_target_ids);
        let removed_targets = Instant::now();

        let documents_removed = self.remove_orphaned_documents(delegate, upper_bound);
        let removed_documents = Instant::now();

        log::debug!(
            "LRU Garbage Collection\n\tCounted targets in {:?}\n\tDetermined least recently used {} in {:?}\n\tRemoved {} targets in {:?}\n\tRemoved {} documents in {:?}\nTotal Duration: {:?}",
            counted_targets - start,
            sequence_numbers_to_collect,
            found_upper_bound - counted_targets,
            targets_removed,
            removed_targets - found_upper_bound,
            documents_removed,
            removed_documents - removed_targets,
            removed_documents - start,
        );

        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        }
    }
}

/// Runs garbage collection one minute after start and every five minutes
/// afterwards until stopped.
#[derive(Debug)]
pub struct LruScheduler {
    params: LruParams,
    task: Option<JoinHandle<()>>,
}

impl LruScheduler {
    pub fn new(params: LruParams) -> Self {
        Self { params, task: None }
    }

    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }

    /// Starts the schedule. `collect` performs one collection; its errors
    /// are logged and the schedule continues.
    pub fn start<F, Fut>(&mut self, collect: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<LruResults>> + Send + 'static,
    {
        if self.params.is_disabled() || self.task.is_some() {
            return;
        }
        self.task = Some(runtime::spawn(async move {
            let mut delay = INITIAL_GC_DELAY;
            loop {
                log::debug!("Garbage collection scheduled in {delay:?}");
                runtime::sleep(delay).await;
                match collect().await {
                    Ok(results) => log::debug!("Garbage collection finished: {results:?}"),
                    Err(err) if err.is_primary_lease_lost() => {
                        log::debug!("Skipping garbage collection: {err}")
                    }
                    Err(err) => log::warn!("Garbage collection failed: {err}"),
                }
                delay = REGULAR_GC_DELAY;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LruScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::local::{
        MemoryPersistence, Persistence, TargetData, TargetPurpose, TransactionMode,
    };
    use crate::firestore::model::{DocumentKeySet, Timestamp};
    use crate::test_support::{doc, key, query, set_mutation, version};

    fn lru_persistence() -> Arc<dyn Persistence> {
        Arc::new(MemoryPersistence::with_lru_gc(LruParams::DEFAULT))
    }

    fn add_target(persistence: &Arc<dyn Persistence>, path: &str, docs: &[&str]) -> TargetData {
        persistence
            .run_transaction("add target", TransactionMode::ReadWrite, |txn| {
                let target_id = txn.target_cache().allocate_target_id();
                let data = TargetData::new(
                    query(path).to_target(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                txn.target_cache().add_target_data(data.clone())?;
                let keys: DocumentKeySet = docs.iter().map(|path| key(path)).collect();
                for path in docs {
                    txn.remote_document_cache()
                        .add_entry(doc(path, 1, &[]).into(), version(1))?;
                }
                txn.add_matching_keys(&keys, target_id);
                Ok(data)
            })
            .unwrap()
    }

    fn release(persistence: &Arc<dyn Persistence>, data: &TargetData) {
        persistence
            .run_transaction("release", TransactionMode::ReadWrite, |txn| {
                let keys = txn.target_cache().get_matching_keys_for_target_id(data.target_id);
                txn.remove_matching_keys(&keys, data.target_id);
                txn.remove_target(data)
            })
            .unwrap();
    }

    fn collect_with(
        persistence: &Arc<dyn Persistence>,
        f: impl FnOnce(&mut dyn LruDelegate) -> FirestoreResult<LruResults>,
    ) -> LruResults {
        persistence
            .run_transaction("collect", TransactionMode::ReadWritePrimary, |txn| {
                let delegate = txn.lru_delegate().expect("lru enabled");
                f(delegate)
            })
            .unwrap()
    }

    #[test]
    fn rolling_buffer_keeps_smallest_values() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        for value in [50, 10, 40, 20, 30, 5] {
            buffer.add_element(value);
        }
        assert_eq!(buffer.max_value(), 20);
        assert_eq!(RollingSequenceNumberBuffer::new(3).max_value(), ListenSequence::INVALID);
    }

    #[test]
    fn nth_sequence_number_spans_targets_and_documents() {
        let persistence = lru_persistence();
        for index in 0..5 {
            add_target(&persistence, &format!("coll{index}"), &[]);
        }
        let gc = LruGarbageCollector::new(LruParams::DEFAULT);
        let results = collect_with(&persistence, |delegate| {
            assert_eq!(gc.calculate_target_count(delegate, 50), 2);
            assert_eq!(gc.nth_sequence_number(delegate, 0), ListenSequence::INVALID);
            assert_eq!(gc.nth_sequence_number(delegate, 2), 2);
            Ok(LruResults::DID_NOT_RUN)
        });
        assert!(!results.did_run);
    }

    #[test]
    fn skips_collection_below_threshold_or_when_disabled() {
        let persistence = lru_persistence();
        add_target(&persistence, "rooms", &["rooms/a"]);
        let results = collect_with(&persistence, |delegate| {
            LruGarbageCollector::new(LruParams::DEFAULT).collect(delegate, &BTreeSet::new())
        });
        assert_eq!(results, LruResults::DID_NOT_RUN);

        let results = collect_with(&persistence, |delegate| {
            LruGarbageCollector::new(LruParams::DISABLED).collect(delegate, &BTreeSet::new())
        });
        assert_eq!(results, LruResults::DID_NOT_RUN);
    }

    #[test]
    fn never_removes_active_targets_or_mutated_documents() {
        let persistence = lru_persistence();
        let released = add_target(&persistence, "old", &["old/a", "old/b"]);
        let active = add_target(&persistence, "active", &["active/a"]);
        release(&persistence, &released);

        // A pending write keeps old/b alive.
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                txn.mutation_queue(&User::unauthenticated()).add_mutation_batch(
                    Timestamp::from_micros(1),
                    Vec::new(),
                    vec![set_mutation("old/b", &[])],
                )?;
                Ok(())
            })
            .unwrap();
        // Make everything eligible.
        for _ in 0..5 {
            persistence
                .run_transaction("tick", TransactionMode::ReadOnly, |_| Ok(()))
                .unwrap();
        }

        let params = LruParams::unvalidated(0, 100, 1000);
        let active_ids: BTreeSet<TargetId> = [active.target_id].into_iter().collect();
        let results = collect_with(&persistence, |delegate| {
            LruGarbageCollector::new(params).collect(delegate, &active_ids)
        });
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    txn.remote_document_cache().keys(),
                    txn.target_cache().get_target_data(&active.target).is_some(),
                ))
            })
            .unwrap();
        assert_eq!(
            remaining.0,
            [key("active/a"), key("old/b")].into_iter().collect::<DocumentKeySet>()
        );
        assert!(remaining.1);
    }
}
