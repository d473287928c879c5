mod bound;
mod filter;
mod firestore_client;
mod listen_sequence;
mod query;
mod target;
mod target_id_generator;
mod types;
mod user;
mod view;
mod view_snapshot;

pub use bound::{Bound, Direction, OrderBy};
pub use filter::{FieldFilter, FilterOperator};
pub use firestore_client::{FirestoreClient, QueryListener};
pub use listen_sequence::ListenSequence;
pub use query::{LimitType, Query};
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use types::{
    BatchId, ListenSequenceNumber, OnlineState, OnlineStateSource, TargetId, BATCH_ID_UNKNOWN,
};
pub use user::User;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, IndexedChange, SyncState, ViewSnapshot,
};
