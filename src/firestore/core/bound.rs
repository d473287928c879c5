use std::cmp::Ordering;

use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    /// Compares two documents on this ordering alone.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            compare_values(
                left.field(&self.field).unwrap_or(&null),
                right.field(&self.field).unwrap_or(&null),
            )
        };
        self.direction.apply(ordering)
    }

    pub fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// A cursor position along the query's order-by fields.
///
/// `before` tells whether the bound sits just before the documents equal to
/// `position` (`start_at`, `end_before`) or just after them (`start_after`,
/// `end_at`).
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    before: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, before: bool) -> Self {
        Self { position, before }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn before(&self) -> bool {
        self.before
    }

    /// Whether this bound sorts before `doc` under `order_by`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let mut comparison = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            comparison = if order.field().is_key_field() {
                match component.kind() {
                    ValueKind::Reference(reference) => match DocumentKey::from_string(reference) {
                        Ok(bound_key) => bound_key.cmp(doc.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                compare_values(component, doc.field(order.field()).unwrap_or(&null))
            };
            comparison = order.direction().apply(comparison);
            if comparison != Ordering::Equal {
                break;
            }
        }

        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    pub fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(FirestoreValue::canonical_id).collect();
        format!("{}{}", if self.before { "b:" } else { "a:" }, values.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, path};

    #[test]
    fn before_bound_includes_equal_documents() {
        let order = vec![OrderBy::new(path("x"), Direction::Ascending)];
        let equal = doc("c/a", 1, &[("x", FirestoreValue::from_integer(5))]);
        let start_at = Bound::new(vec![FirestoreValue::from_integer(5)], true);
        let start_after = Bound::new(vec![FirestoreValue::from_integer(5)], false);
        assert!(start_at.sorts_before_document(&order, &equal));
        assert!(!start_after.sorts_before_document(&order, &equal));
    }

    #[test]
    fn descending_order_flips_comparison() {
        let order = vec![OrderBy::new(path("x"), Direction::Descending)];
        let low = doc("c/a", 1, &[("x", FirestoreValue::from_integer(1))]);
        let bound = Bound::new(vec![FirestoreValue::from_integer(5)], true);
        assert!(bound.sorts_before_document(&order, &low));
    }
}
