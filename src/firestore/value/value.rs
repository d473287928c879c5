use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Placeholder written into the local view for a pending server timestamp.
///
/// Sorts after every real timestamp and among other placeholders by the time
/// the local write happened.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerTimestampValue {
    local_write_time: Timestamp,
    previous_value: Option<Box<FirestoreValue>>,
}

impl ServerTimestampValue {
    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    /// The value the field held before the transform was applied, if any.
    pub fn previous_value(&self) -> Option<&FirestoreValue> {
        self.previous_value.as_deref()
    }
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous_value: Option<FirestoreValue>) -> Self {
        // Nested placeholders collapse onto the oldest real value.
        let previous_value = match previous_value {
            Some(FirestoreValue {
                kind: ValueKind::ServerTimestamp(inner),
            }) => inner.previous_value,
            other => other.map(Box::new),
        };
        Self {
            kind: ValueKind::ServerTimestamp(ServerTimestampValue {
                local_write_time,
                previous_value,
            }),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Stable textual form used to build canonical target ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::ServerTimestamp(value) => format!(
                "serverTimestamp({},{})",
                value.local_write_time.seconds, value.local_write_time.nanos
            ),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(Self::canonical_id).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }
}

impl PartialEq for FirestoreValue {
    /// Firestore equality: integers never equal doubles, and NaN equals NaN.
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
            (ValueKind::Double(l), ValueKind::Double(r)) => {
                (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
            }
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
            (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => l == r,
            (ValueKind::String(l), ValueKind::String(r)) => l == r,
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
            (ValueKind::Array(l), ValueKind::Array(r)) => l == r,
            (ValueKind::Map(l), ValueKind::Map(r)) => l == r,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn integers_and_doubles_are_distinct() {
        assert_ne!(FirestoreValue::from_integer(1), FirestoreValue::from_double(1.0));
        assert_eq!(
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NAN)
        );
        assert_ne!(FirestoreValue::from_double(0.0), FirestoreValue::from_double(-0.0));
    }

    #[test]
    fn server_timestamp_keeps_original_previous_value() {
        let write_time = Timestamp::new(10, 0);
        let first = FirestoreValue::server_timestamp(write_time, Some(FirestoreValue::from_integer(3)));
        let second = FirestoreValue::server_timestamp(Timestamp::new(11, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp(value) => {
                assert_eq!(value.previous_value(), Some(&FirestoreValue::from_integer(3)));
            }
            _ => panic!("expected server timestamp"),
        }
    }
}
