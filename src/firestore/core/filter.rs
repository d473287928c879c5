use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, FieldPath};
use crate::firestore::value::{compare_values, same_type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::ArrayContainsAny | FilterOperator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `field op value` predicate.
///
/// Filters on the document key compare reference values, so `value` must be a
/// reference (or an array of references for `in` and `not-in`).
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && !value.is_array() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{op}' filters."
            )));
        }
        if field.is_key_field() {
            let is_reference = |candidate: &FirestoreValue| {
                matches!(candidate.kind(), ValueKind::Reference(_))
            };
            let valid = match value.as_array() {
                Some(array) if op.takes_array() => array.values().iter().all(is_reference),
                _ => is_reference(&value),
            };
            if !valid || matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                return Err(invalid_argument(format!(
                    "Invalid query. '{op}' on the document id requires document references."
                )));
            }
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let key_value;
        let other = if self.field.is_key_field() {
            key_value = FirestoreValue::from_reference(doc.key().path().canonical_string());
            Some(&key_value)
        } else {
            doc.field(&self.field)
        };

        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                array.values().iter().any(|value| needles.contains(value))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                other.is_some_and(|other| !candidates.contains(other))
            }
            FilterOperator::NotEqual => other
                .is_some_and(|other| self.op.matches_comparison(compare_values(other, &self.value))),
            _ => other.is_some_and(|other| {
                same_type_order(other, &self.value)
                    && self.op.matches_comparison(compare_values(other, &self.value))
            }),
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, path};

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn filter(field: &str, op: FilterOperator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(path(field), op, value).unwrap()
    }

    #[test]
    fn range_filters_only_match_same_type() {
        let numeric = doc("c/a", 1, &[("x", int(5))]);
        let text = doc("c/b", 1, &[("x", FirestoreValue::from_string("5"))]);
        let gt = filter("x", FilterOperator::GreaterThan, int(0));
        assert!(gt.matches(&numeric));
        assert!(!gt.matches(&text));
    }

    #[test]
    fn not_equal_requires_field_presence() {
        let missing = doc("c/a", 1, &[]);
        let present = doc("c/b", 1, &[("x", FirestoreValue::from_string("y"))]);
        let ne = filter("x", FilterOperator::NotEqual, int(1));
        assert!(!ne.matches(&missing));
        assert!(ne.matches(&present));
    }

    #[test]
    fn array_operators() {
        let tagged = doc(
            "c/a",
            1,
            &[("tags", FirestoreValue::from_array(vec![int(1), int(2)]))],
        );
        assert!(filter("tags", FilterOperator::ArrayContains, int(2)).matches(&tagged));
        assert!(filter(
            "tags",
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![int(9), int(1)])
        )
        .matches(&tagged));

        let scalar = doc("c/b", 1, &[("x", int(3))]);
        let values = FirestoreValue::from_array(vec![int(3), int(4)]);
        assert!(filter("x", FilterOperator::In, values.clone()).matches(&scalar));
        assert!(!filter("x", FilterOperator::NotIn, values).matches(&scalar));
        let with_null = FirestoreValue::from_array(vec![FirestoreValue::null()]);
        assert!(!filter("x", FilterOperator::NotIn, with_null).matches(&scalar));
    }

    #[test]
    fn key_filters_compare_references() {
        let a = doc("c/a", 1, &[]);
        let key_filter = FieldFilter::new(
            FieldPath::key_field(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_reference("c/0"),
        )
        .unwrap();
        assert!(key_filter.matches(&a));
        assert!(FieldFilter::new(FieldPath::key_field(), FilterOperator::Equal, int(1)).is_err());
    }

    #[test]
    fn array_operators_require_arrays() {
        assert!(FieldFilter::new(path("x"), FilterOperator::In, int(1)).is_err());
    }
}
