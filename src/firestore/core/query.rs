use std::cmp::Ordering;
use std::sync::Arc;

use crate::firestore::core::{Bound, Direction, FieldFilter, FilterOperator, OrderBy, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, FieldPath, IntoFieldPath, ResourcePath,
};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A parsed query: a path or collection group plus filters, explicit
/// ordering, limit and cursors.
///
/// Queries are immutable; the builder methods return modified copies.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for the documents under `path`, or for the single document at
    /// `path` when it has an even number of segments.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Rebuilds the query a target was derived from. Used by clients that only
    /// learn about a target through shared state.
    pub fn from_target(target: &Target) -> Self {
        let mut query = Self::new(target.path().clone());
        query.collection_group = target.collection_group().map(str::to_string);
        query.explicit_order_by = target.order_by().to_vec();
        query.filters = target.filters().to_vec();
        query.limit = target.limit();
        query.start_at = target.start_at().cloned();
        query.end_at = target.end_at().cloned();
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    pub fn with_filter(&self, filter: FieldFilter) -> FirestoreResult<Self> {
        if filter.is_inequality() {
            if let Some(existing) = self.inequality_field() {
                if existing != filter.field() {
                    return Err(invalid_argument(format!(
                        "Invalid query. All where filters with an inequality must be on the same field. But you have inequality filters on '{existing}' and '{}'",
                        filter.field()
                    )));
                }
            }
        }
        let mut query = self.clone();
        query.filters.push(filter);
        Ok(query)
    }

    /// Convenience wrapper building the [`FieldFilter`] in place.
    pub fn filter(
        &self,
        field: impl IntoFieldPath,
        op: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        self.with_filter(FieldFilter::new(field.into_field_path()?, op, value)?)
    }

    pub fn order_by(&self, field: impl IntoFieldPath, direction: Direction) -> FirestoreResult<Self> {
        let mut query = self.clone();
        query
            .explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(query)
    }

    pub fn limit_to_first(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::First;
        query
    }

    /// Keeps the last `limit` documents. Callers must supply an explicit
    /// order-by before the query is listened to.
    pub fn limit_to_last(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::Last;
        query
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// Turns a collection-group query into the equivalent query over one
    /// concrete collection.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.is_inequality())
            .map(FieldFilter::field)
    }

    pub fn first_order_by_field(&self) -> Option<&FieldPath> {
        self.explicit_order_by.first().map(OrderBy::field)
    }

    /// Explicit ordering augmented with the implicit inequality and key
    /// orderings.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        if let (Some(inequality), None) = (self.inequality_field(), self.first_order_by_field()) {
            if inequality.is_key_field() {
                return vec![OrderBy::new(FieldPath::key_field(), Direction::Ascending)];
            }
            return vec![
                OrderBy::new(inequality.clone(), Direction::Ascending),
                OrderBy::new(FieldPath::key_field(), Direction::Ascending),
            ];
        }

        let mut order_by = self.explicit_order_by.clone();
        if !order_by.iter().any(|order| order.field().is_key_field()) {
            let last_direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::key_field(), last_direction));
        }
        order_by
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                order_by,
                self.filters.clone(),
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                // The backend only understands limit-to-first, so flip the
                // ordering and swap the cursors.
                let flipped = order_by.iter().map(OrderBy::flipped).collect();
                let start_at = self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before()));
                let end_at = self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before()));
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    flipped,
                    self.filters.clone(),
                    self.limit,
                    start_at,
                    end_at,
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Whether `doc` belongs in the query's result set.
    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_key(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    /// Whether a document at `key` lies within the query's path or
    /// collection group. Filters are not consulted.
    pub fn matches_key(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_field() || doc.field(order.field()).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start_at) = &self.start_at {
            if !start_at.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end_at) = &self.end_at {
            if end_at.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Comparator sorting documents in result order.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}
