mod collections;
mod document;
mod document_key;
mod document_set;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod transform_operation;

pub use collections::{
    DocumentKeySet, DocumentMap, DocumentVersionMap, MaybeDocumentMap, NullableMaybeDocumentMap,
};
pub use document::{Document, MaybeDocument, NoDocument, UnknownDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_FIELD_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{
    DeleteMutation, FieldMask, Mutation, MutationResult, PatchMutation, Precondition,
    SetMutation, TransformMutation, VerifyMutation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use transform_operation::{FieldTransform, TransformOperation};
