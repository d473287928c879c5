use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Field data of a document, also used for nested map values.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up the value at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map value found on the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_value_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`; missing intermediate maps are left alone.
    pub fn delete(&mut self, path: &FieldPath) {
        remove_value_at_segments(&mut self.fields, path.segments());
    }
}

fn set_value_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child_fields = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(map)) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_value_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(child_map)) = fields.get(first).map(FirestoreValue::kind) {
        let mut child_fields = child_map.fields.clone();
        remove_value_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(map.field(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.field(&path("a.b")).unwrap().as_map().is_some());
    }

    #[test]
    fn set_overwrites_scalar_parents() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_string("scalar"));
        map.set(&path("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(map.field(&path("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_removes_nested_field_only() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("a.c"), FirestoreValue::from_integer(2));
        map.delete(&path("a.b"));
        assert!(map.field(&path("a.b")).is_none());
        assert_eq!(map.field(&path("a.c")), Some(&FirestoreValue::from_integer(2)));
        map.delete(&path("missing.field"));
        assert_eq!(map.fields().len(), 1);
    }
}
