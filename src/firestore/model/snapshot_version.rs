use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of the remote state, as assigned by the backend.
///
/// [`SnapshotVersion::min`] stands for "no authoritative version known".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn from_timestamp(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn max() -> Self {
        Self {
            timestamp: Timestamp::new(253_402_300_799, 999_999_999),
        }
    }

    /// Convenience for tests and fixtures that talk in whole microseconds.
    pub fn from_micros(micros: i64) -> Self {
        Self::from_timestamp(Timestamp::from_micros(micros))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}
