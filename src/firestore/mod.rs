pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

pub use core::{FirestoreClient, QueryListener};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{GarbageCollectionSettings, LruParams, SyncEngineSettings};
