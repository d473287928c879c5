use crate::firestore::core::{Bound, FieldFilter, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

/// What the backend is asked to watch. Derived from a [`Query`] with the
/// implicit ordering already applied, so several queries may share a target.
///
/// [`Query`]: crate::firestore::core::Query
#[derive(Clone, Debug)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    canonical_id: String,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        order_by: Vec<OrderBy>,
        filters: Vec<FieldFilter>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        let mut target = Self {
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
            canonical_id: String::new(),
        };
        target.canonical_id = target.compute_canonical_id();
        target
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
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

    /// Stable identity used to deduplicate targets.
    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    fn compute_canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id == other.canonical_id
    }
}
