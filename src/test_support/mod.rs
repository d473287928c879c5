//! Test utilities shared across crate-level unit tests.

pub mod firestore;

pub use firestore::{
    deleted_doc, delete_mutation, doc, key, map, patch_mutation, path, query, set_mutation,
    unknown_doc, version,
};
