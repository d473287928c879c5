use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Position of each value type in Firestore's cross-type ordering.
fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Returns true when both values belong to the same ordering class, which is
/// required for range filters to match.
pub fn same_type_order(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    type_order(left) == type_order(right)
}

/// Total ordering over Firestore values, consistent with the backend.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time().cmp(&r.local_write_time())
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (left_value, right_value) in l.values().iter().zip(r.values().iter()) {
                match compare_values(left_value, right_value) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((left_key, left_value), (right_key, right_value)) in
                l.fields().iter().zip(r.fields().iter())
            {
                match left_key
                    .cmp(right_key)
                    .then_with(|| compare_values(left_value, right_value))
                {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    match (integer as f64).partial_cmp(&double) {
        Some(Ordering::Equal) => {
            // The conversion may have rounded; settle ties on the integer side.
            if double >= i64::MAX as f64 {
                Ordering::Less
            } else if double <= i64::MIN as f64 {
                integer.cmp(&i64::MIN)
            } else {
                integer.cmp(&(double as i64))
            }
        }
        Some(other) => other,
        None => Ordering::Equal,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_path = ResourcePath::from_segments(left.split('/').filter(|s| !s.is_empty()));
    let right_path = ResourcePath::from_segments(right.split('/').filter(|s| !s.is_empty()));
    ResourcePath::comparator(&left_path, &right_path)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(2.5),
            FirestoreValue::from_integer(3),
            FirestoreValue::from_timestamp(Timestamp::new(5, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(1, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically() {
        assert_eq!(
            compare_values(&FirestoreValue::from_integer(1), &FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
        assert!(same_type_order(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_double(1.0)
        ));
    }

    #[test]
    fn arrays_compare_element_wise() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
    }
}
