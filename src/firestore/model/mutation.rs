use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, FieldPath, FieldTransform, MaybeDocument, NoDocument, SnapshotVersion,
    Timestamp, UnknownDocument,
};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == matches!(maybe_doc, Some(MaybeDocument::Document(_)))
            }
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
        }
    }
}

/// Set of field paths a patch touches.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Mask covering every leaf of `map`; empty nested maps count as leaves.
    pub fn from_map_value(map: &MapValue) -> Self {
        let mut fields = BTreeSet::new();
        collect_leaf_paths(map, &[], &mut fields);
        Self { fields }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: &[String], acc: &mut BTreeSet<FieldPath>) {
    for (key, value) in map.fields() {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => collect_leaf_paths(child, &segments, acc),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    acc.insert(path);
                }
            }
        }
    }
}

/// Backend outcome for a single mutation of a committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    version: SnapshotVersion,
    transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn transform_results(&self) -> Option<&[FirestoreValue]> {
        self.transform_results.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetMutation {
    pub key: DocumentKey,
    pub value: MapValue,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchMutation {
    pub key: DocumentKey,
    pub data: MapValue,
    pub field_mask: FieldMask,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransformMutation {
    pub key: DocumentKey,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifyMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

/// A single document write.
///
/// Local application (latency compensation) follows this table, where the
/// columns are the prior state of the document:
///
/// | Mutation  | Document(v3)   | NoDocument(v3) | none           |
/// |-----------|----------------|----------------|----------------|
/// | Set       | Document(v3)   | Document(v0)   | Document(v0)   |
/// | Patch     | Document(v3)   | NoDocument(v3) | none           |
/// | Transform | Document(v3)   | NoDocument(v3) | none           |
/// | Delete    | NoDocument(v0) | NoDocument(v0) | NoDocument(v0) |
///
/// Patch and transform only behave this way under their usual `exists`
/// precondition. Remote application stamps the version returned by the
/// backend instead and yields an [`UnknownDocument`] when a precondition
/// cannot be checked against the cached state.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set(SetMutation),
    Patch(PatchMutation),
    Transform(TransformMutation),
    Delete(DeleteMutation),
    Verify(VerifyMutation),
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set(SetMutation {
            key,
            value,
            precondition: Precondition::None,
        })
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch(PatchMutation {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
        })
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform(TransformMutation {
            key,
            field_transforms,
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete(DeleteMutation {
            key,
            precondition: Precondition::None,
        })
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify(VerifyMutation { key, precondition })
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set(m) => &m.key,
            Mutation::Patch(m) => &m.key,
            Mutation::Transform(m) => &m.key,
            Mutation::Delete(m) => &m.key,
            Mutation::Verify(m) => &m.key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set(m) => m.precondition.clone(),
            Mutation::Patch(m) => m.precondition.clone(),
            Mutation::Transform(_) => Precondition::Exists(true),
            Mutation::Delete(m) => m.precondition.clone(),
            Mutation::Verify(m) => m.precondition.clone(),
        }
    }

    /// Applies the mutation to the cached remote state using the backend's
    /// result. Always returns a document, possibly an [`UnknownDocument`].
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> FirestoreResult<MaybeDocument> {
        match self {
            Mutation::Set(m) => Ok(Document::new(m.key.clone(), result.version(), m.value.clone())
                .with_committed_mutations()
                .into()),
            Mutation::Patch(m) => {
                if !m.precondition.is_valid_for(maybe_doc) {
                    return Ok(UnknownDocument::new(m.key.clone(), result.version()).into());
                }
                let data = patch_object(existing_data(maybe_doc), &m.data, &m.field_mask);
                Ok(Document::new(m.key.clone(), result.version(), data)
                    .with_committed_mutations()
                    .into())
            }
            Mutation::Transform(m) => {
                let transform_results = result.transform_results().ok_or_else(|| {
                    internal_error("Transform results missing for TransformMutation")
                })?;
                if transform_results.len() != m.field_transforms.len() {
                    return Err(internal_error(format!(
                        "Server transform result count ({}) should match field transform count ({})",
                        transform_results.len(),
                        m.field_transforms.len()
                    )));
                }
                if !self.precondition().is_valid_for(maybe_doc) {
                    return Ok(UnknownDocument::new(m.key.clone(), result.version()).into());
                }
                let doc = require_document(&m.key, maybe_doc)?;
                let mut data = doc.data().clone();
                for (transform, server_value) in m.field_transforms.iter().zip(transform_results) {
                    let previous = doc.field(transform.field());
                    let value = transform
                        .operation()
                        .apply_to_remote_document(previous, Some(server_value));
                    data.set(transform.field(), value);
                }
                Ok(Document::new(m.key.clone(), result.version(), data)
                    .with_committed_mutations()
                    .into())
            }
            Mutation::Delete(m) => Ok(NoDocument::new(m.key.clone(), result.version())
                .with_committed_mutations()
                .into()),
            Mutation::Verify(_) => Err(internal_error(
                "VerifyMutation should only be used in transactions",
            )),
        }
    }

    /// Applies the mutation on top of `maybe_doc` for the latency-compensated
    /// view. `base_doc` is the state before the batch's own mutations ran and
    /// feeds transforms that need a previous value.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        if let Mutation::Verify(_) = self {
            return Err(internal_error(
                "VerifyMutation should only be used in transactions",
            ));
        }
        if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
            return Ok(maybe_doc);
        }

        let doc = match self {
            Mutation::Set(m) => Document::new(
                m.key.clone(),
                post_mutation_version(maybe_doc.as_ref()),
                m.value.clone(),
            )
            .with_local_mutations()
            .into(),
            Mutation::Patch(m) => {
                let data =
                    patch_object(existing_data(maybe_doc.as_ref()), &m.data, &m.field_mask);
                Document::new(m.key.clone(), post_mutation_version(maybe_doc.as_ref()), data)
                    .with_local_mutations()
                    .into()
            }
            Mutation::Transform(m) => {
                let doc = require_document(&m.key, maybe_doc.as_ref())?;
                let mut data = doc.data().clone();
                for transform in &m.field_transforms {
                    let previous = doc.field(transform.field()).or_else(|| {
                        base_doc
                            .and_then(MaybeDocument::as_document)
                            .and_then(|base| base.field(transform.field()))
                    });
                    let value = transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time);
                    data.set(transform.field(), value);
                }
                Document::new(m.key.clone(), doc.version(), data)
                    .with_local_mutations()
                    .into()
            }
            Mutation::Delete(m) => NoDocument::new(m.key.clone(), SnapshotVersion::min()).into(),
            Mutation::Verify(_) => unreachable!("verify mutations are rejected above"),
        };
        Ok(Some(doc))
    }

    /// Base values a later re-application needs to produce the same result,
    /// or `None` when the mutation is idempotent.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<MapValue> {
        let Mutation::Transform(m) = self else {
            return None;
        };
        let existing = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base: Option<MapValue> = None;
        for transform in &m.field_transforms {
            let current = existing.and_then(|doc| doc.field(transform.field()));
            if let Some(value) = transform.operation().compute_base_value(current) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field(), value);
            }
        }
        base
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn existing_data(maybe_doc: Option<&MaybeDocument>) -> MapValue {
    maybe_doc
        .and_then(MaybeDocument::as_document)
        .map(|doc| doc.data().clone())
        .unwrap_or_default()
}

fn require_document<'a>(
    key: &DocumentKey,
    maybe_doc: Option<&'a MaybeDocument>,
) -> FirestoreResult<&'a Document> {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) if doc.key() == key => Ok(doc),
        Some(MaybeDocument::Document(doc)) => Err(internal_error(format!(
            "Can only apply a mutation to a document with the same key ({} != {})",
            doc.key(),
            key
        ))),
        _ => Err(internal_error(format!("Unknown MaybeDocument type for {key}"))),
    }
}

fn patch_object(mut data: MapValue, patch: &MapValue, mask: &FieldMask) -> MapValue {
    for path in mask.fields() {
        match patch.field(path) {
            Some(value) => data.set(path, value.clone()),
            None => data.delete(path),
        }
    }
    data
}
