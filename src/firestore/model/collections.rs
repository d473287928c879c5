use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{Document, DocumentKey, MaybeDocument, SnapshotVersion};

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type MaybeDocumentMap = BTreeMap<DocumentKey, MaybeDocument>;
pub type DocumentMap = BTreeMap<DocumentKey, Document>;
pub type DocumentVersionMap = BTreeMap<DocumentKey, SnapshotVersion>;
/// Lookup result where `None` marks a key with no cached entry.
pub type NullableMaybeDocumentMap = BTreeMap<DocumentKey, Option<MaybeDocument>>;
