use crate::firestore::core::Query;
use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldPath, Mutation, NoDocument, ResourcePath,
    SnapshotVersion, UnknownDocument,
};
use crate::firestore::value::{FirestoreValue, MapValue};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document key")
}

/// Dot separated field path.
pub fn path(field: &str) -> FieldPath {
    FieldPath::from_dot_separated(field).expect("valid field path")
}

pub fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

/// Builds a map value; keys are dot separated paths so nested fields can be
/// written inline.
pub fn map(fields: &[(&str, FirestoreValue)]) -> MapValue {
    let mut value = MapValue::empty();
    for (field, entry) in fields {
        value.set(&path(field), entry.clone());
    }
    value
}

pub fn doc(path: &str, version_micros: i64, fields: &[(&str, FirestoreValue)]) -> Document {
    Document::new(key(path), version(version_micros), map(fields))
}

pub fn deleted_doc(path: &str, version_micros: i64) -> NoDocument {
    NoDocument::new(key(path), version(version_micros))
}

pub fn unknown_doc(path: &str, version_micros: i64) -> UnknownDocument {
    UnknownDocument::new(key(path), version(version_micros))
}

pub fn query(path: &str) -> Query {
    Query::new(ResourcePath::from_string(path).expect("valid resource path"))
}

pub fn set_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    Mutation::set(key(path), map(fields))
}

/// Patch touching exactly the given fields.
pub fn patch_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    let mask = FieldMask::new(fields.iter().map(|(field, _)| self::path(field)));
    Mutation::patch(key(path), map(fields), mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}
