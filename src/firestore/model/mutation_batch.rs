use crate::firestore::core::BatchId;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentVersionMap, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationResult, SnapshotVersion, Timestamp,
};

/// Mutations written together by one local write, applied atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation for `key` to the cached remote state using the
    /// backend's acknowledgment.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        if let Some(doc) = &maybe_doc {
            if doc.key() != key {
                return Err(internal_error(format!(
                    "apply_to_remote_document: key {key} doesn't match document key {}",
                    doc.key()
                )));
            }
        }
        let results = batch_result.mutation_results();
        if results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            )));
        }

        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current.as_ref(), result)?);
            }
        }
        Ok(current)
    }

    /// Layers this batch's base mutations, then its mutations, over `maybe_doc`.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().filter(|m| m.key() == key) {
            current =
                mutation.apply_to_local_view(current.clone(), current.as_ref(), self.local_write_time)?;
        }

        let base_doc = current.clone();
        for mutation in self.mutations.iter().filter(|m| m.key() == key) {
            current =
                mutation.apply_to_local_view(current, base_doc.as_ref(), self.local_write_time)?;
        }
        Ok(current)
    }

    /// Applies the batch to every document of `docs` it touches.
    pub fn apply_to_local_document_set(&self, docs: &mut MaybeDocumentMap) -> FirestoreResult<()> {
        for key in self.keys() {
            let existing = docs.get(&key).cloned();
            match self.apply_to_local_view(&key, existing)? {
                Some(doc) => {
                    docs.insert(key, doc);
                }
                None => {
                    docs.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// The backend's answer to a committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    batch: MutationBatch,
    commit_version: SnapshotVersion,
    mutation_results: Vec<MutationResult>,
    stream_token: Vec<u8>,
    doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    /// Builds a result, precomputing the version each touched document ends up at.
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations().len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations().len(),
                mutation_results.len()
            )));
        }

        let mut doc_versions = DocumentVersionMap::new();
        for (mutation, result) in batch.mutations().iter().zip(&mutation_results) {
            doc_versions.insert(mutation.key().clone(), result.version());
        }

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    pub fn batch(&self) -> &MutationBatch {
        &self.batch
    }

    pub fn commit_version(&self) -> SnapshotVersion {
        self.commit_version
    }

    pub fn mutation_results(&self) -> &[MutationResult] {
        &self.mutation_results
    }

    pub fn stream_token(&self) -> &[u8] {
        &self.stream_token
    }

    pub fn doc_versions(&self) -> &DocumentVersionMap {
        &self.doc_versions
    }
}
