use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Cache size threshold that turns LRU collection off.
pub const COLLECTION_DISABLED: i64 = -1;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;

/// Tuning knobs for the LRU garbage collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LruParams {
    cache_size_collection_threshold: i64,
    percentile_to_collect: u32,
    maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const DEFAULT: LruParams = LruParams {
        cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
        percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
        maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
    };

    pub const DISABLED: LruParams = LruParams {
        cache_size_collection_threshold: COLLECTION_DISABLED,
        percentile_to_collect: 0,
        maximum_sequence_numbers_to_collect: 0,
    };

    pub fn new(
        cache_size_collection_threshold: i64,
        percentile_to_collect: u32,
        maximum_sequence_numbers_to_collect: usize,
    ) -> FirestoreResult<Self> {
        validate_cache_size(cache_size_collection_threshold)?;
        if percentile_to_collect > 100 {
            return Err(invalid_argument(
                "percentile_to_collect must be between 0 and 100",
            ));
        }
        Ok(Self {
            cache_size_collection_threshold,
            percentile_to_collect,
            maximum_sequence_numbers_to_collect,
        })
    }

    /// Skips validation so tests can collect regardless of cache size.
    #[cfg(test)]
    pub(crate) fn unvalidated(
        cache_size_collection_threshold: i64,
        percentile_to_collect: u32,
        maximum_sequence_numbers_to_collect: usize,
    ) -> Self {
        Self {
            cache_size_collection_threshold,
            percentile_to_collect,
            maximum_sequence_numbers_to_collect,
        }
    }

    /// Default parameters with a different cache size threshold.
    pub fn with_cache_size(cache_size: i64) -> FirestoreResult<Self> {
        Self::new(
            cache_size,
            DEFAULT_COLLECTION_PERCENTILE,
            DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        )
    }

    pub fn cache_size_collection_threshold(&self) -> i64 {
        self.cache_size_collection_threshold
    }

    pub fn percentile_to_collect(&self) -> u32 {
        self.percentile_to_collect
    }

    pub fn maximum_sequence_numbers_to_collect(&self) -> usize {
        self.maximum_sequence_numbers_to_collect
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == COLLECTION_DISABLED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How unreferenced documents are removed from the local cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum GarbageCollectionSettings {
    /// Documents are dropped as soon as nothing references them.
    Eager,
    /// Documents are kept until the cache outgrows its threshold.
    Lru(LruParams),
}

impl Default for GarbageCollectionSettings {
    fn default() -> Self {
        GarbageCollectionSettings::Eager
    }
}

/// Settings accepted by the sync engine and its local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEngineSettings {
    max_concurrent_limbo_resolutions: usize,
    garbage_collection: GarbageCollectionSettings,
}

impl SyncEngineSettings {
    /// Creates a new settings object after validating values.
    pub fn new(
        max_concurrent_limbo_resolutions: usize,
        garbage_collection: GarbageCollectionSettings,
    ) -> FirestoreResult<Self> {
        validate_max_concurrent_limbo_resolutions(max_concurrent_limbo_resolutions)?;
        if let GarbageCollectionSettings::Lru(params) = &garbage_collection {
            validate_cache_size(params.cache_size_collection_threshold)?;
        }
        Ok(Self {
            max_concurrent_limbo_resolutions,
            garbage_collection,
        })
    }

    /// Parses settings from their JSON form, applying the same validation as
    /// [`SyncEngineSettings::new`].
    pub fn from_json(json: &str) -> FirestoreResult<Self> {
        let parsed: SyncEngineSettings = serde_json::from_str(json)
            .map_err(|err| invalid_argument(format!("Invalid sync engine settings: {err}")))?;
        Self::new(parsed.max_concurrent_limbo_resolutions, parsed.garbage_collection)
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn garbage_collection(&self) -> GarbageCollectionSettings {
        self.garbage_collection
    }

    pub fn with_garbage_collection(mut self, garbage_collection: GarbageCollectionSettings) -> Self {
        self.garbage_collection = garbage_collection;
        self
    }
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            garbage_collection: GarbageCollectionSettings::default(),
        }
    }
}

fn validate_max_concurrent_limbo_resolutions(value: usize) -> FirestoreResult<()> {
    if value == 0 {
        return Err(invalid_argument(
            "max_concurrent_limbo_resolutions must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_cache_size(value: i64) -> FirestoreResult<()> {
    if value != COLLECTION_DISABLED && value < MINIMUM_CACHE_SIZE_BYTES {
        return Err(invalid_argument(format!(
            "cache size must be set to at least {MINIMUM_CACHE_SIZE_BYTES} bytes"
        )));
    }
    Ok(())
}
