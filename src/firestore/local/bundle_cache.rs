use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, MaybeDocument, NoDocument, SnapshotVersion,
};

/// Metadata of a loaded bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: u32,
    pub create_time: SnapshotVersion,
}

/// A query saved from a bundle under a name, with the bundle's read time.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

/// A document entry of a bundle. A missing `document` means the document
/// did not exist at `read_time`.
#[derive(Clone, Debug, PartialEq)]
pub struct BundledDocument {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub document: Option<Document>,
    /// Names of the bundle's named queries this document belongs to.
    pub queries: Vec<String>,
}

impl BundledDocument {
    pub fn to_maybe_document(&self) -> MaybeDocument {
        match &self.document {
            Some(doc) => doc.clone().into(),
            None => NoDocument::new(self.key.clone(), self.read_time).into(),
        }
    }
}

/// Decoded bundle, ready to be applied to the local cache.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleContents {
    pub metadata: BundleMetadata,
    pub documents: Vec<BundledDocument>,
    pub named_queries: Vec<NamedQuery>,
}

impl BundleContents {
    /// Keys of the documents saved under `query_name`.
    pub fn documents_for_query(&self, query_name: &str) -> DocumentKeySet {
        self.documents
            .iter()
            .filter(|doc| doc.queries.iter().any(|name| name == query_name))
            .map(|doc| doc.key.clone())
            .collect()
    }
}

/// Outcome of loading a bundle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadBundleProgress {
    pub documents_loaded: usize,
    pub total_documents: usize,
}

pub trait BundleCache: Send {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata>;

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata);

    fn get_named_query(&self, query_name: &str) -> Option<NamedQuery>;

    fn save_named_query(&mut self, query: NamedQuery);
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleCache for MemoryBundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata> {
        self.bundles.get(bundle_id).cloned()
    }

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles.insert(metadata.id.clone(), metadata);
    }

    fn get_named_query(&self, query_name: &str) -> Option<NamedQuery> {
        self.named_queries.get(query_name).cloned()
    }

    fn save_named_query(&mut self, query: NamedQuery) {
        self.named_queries.insert(query.name.clone(), query);
    }
}
