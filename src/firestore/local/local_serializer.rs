use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, GeoPoint, MaybeDocument, NoDocument, SnapshotVersion, Timestamp,
    UnknownDocument,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";
const TYPE_KEY: &str = "__type__";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

/// Encodes cached documents into the JSON shape used by the REST API
/// (`{"name", "fields", "updateTime"}`) wrapped with the cache metadata.
///
/// The encoded length is what a document costs against the LRU cache size.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSerializer;

impl LocalSerializer {
    pub fn new() -> Self {
        Self
    }

    pub fn encode_maybe_document(&self, maybe_doc: &MaybeDocument) -> JsonValue {
        match maybe_doc {
            MaybeDocument::Document(doc) => json!({
                "document": {
                    "name": doc.key().path().canonical_string(),
                    "fields": encode_map_fields(doc.data()),
                    "updateTime": encode_timestamp(&doc.version().timestamp()),
                },
                "hasCommittedMutations": doc.has_committed_mutations(),
            }),
            MaybeDocument::NoDocument(doc) => json!({
                "noDocument": {
                    "path": doc.key().path().canonical_string(),
                    "readTime": encode_timestamp(&doc.version().timestamp()),
                },
                "hasCommittedMutations": doc.has_committed_mutations(),
            }),
            MaybeDocument::UnknownDocument(doc) => json!({
                "unknownDocument": {
                    "path": doc.key().path().canonical_string(),
                    "version": encode_timestamp(&doc.version().timestamp()),
                },
                "hasCommittedMutations": true,
            }),
        }
    }

    pub fn decode_maybe_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        let committed = value
            .get("hasCommittedMutations")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        if let Some(document) = value.get("document") {
            let key = decode_key(document.get("name"))?;
            let version = decode_version(document.get("updateTime"))?;
            let data = match document.get("fields") {
                Some(fields) => decode_map_fields(fields)?,
                None => MapValue::empty(),
            };
            let doc = Document::new(key, version, data);
            return Ok(if committed {
                doc.with_committed_mutations()
            } else {
                doc
            }
            .into());
        }
        if let Some(no_document) = value.get("noDocument") {
            let key = decode_key(no_document.get("path"))?;
            let version = decode_version(no_document.get("readTime"))?;
            let doc = NoDocument::new(key, version);
            return Ok(if committed {
                doc.with_committed_mutations()
            } else {
                doc
            }
            .into());
        }
        if let Some(unknown) = value.get("unknownDocument") {
            let key = decode_key(unknown.get("path"))?;
            let version = decode_version(unknown.get("version"))?;
            return Ok(UnknownDocument::new(key, version).into());
        }
        Err(data_loss("Unexpected MaybeDocument"))
    }

    /// Size of the encoded document in bytes.
    pub fn document_size(&self, maybe_doc: &MaybeDocument) -> i64 {
        self.encode_maybe_document(maybe_doc).to_string().len() as i64
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else {
                json!({ "doubleValue": double.to_string() })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::ServerTimestamp(server_timestamp) => {
            let mut fields = serde_json::Map::new();
            fields.insert(
                TYPE_KEY.to_string(),
                json!({ "stringValue": SERVER_TIMESTAMP_TYPE }),
            );
            fields.insert(
                LOCAL_WRITE_TIME_KEY.to_string(),
                json!({ "timestampValue": encode_timestamp(&server_timestamp.local_write_time()) }),
            );
            if let Some(previous) = server_timestamp.previous_value() {
                fields.insert(PREVIOUS_VALUE_KEY.to_string(), encode_value(previous));
            }
            json!({ "mapValue": { "fields": JsonValue::Object(fields) } })
        }
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_key(value: Option<&JsonValue>) -> FirestoreResult<DocumentKey> {
    let path = value
        .and_then(JsonValue::as_str)
        .ok_or_else(|| data_loss("Cached document is missing its path"))?;
    DocumentKey::from_string(path).map_err(|err| data_loss(format!("Invalid cached key: {err}")))
}

fn decode_version(value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
    let encoded = value
        .and_then(JsonValue::as_str)
        .ok_or_else(|| data_loss("Cached document is missing its version"))?;
    Ok(SnapshotVersion::from_timestamp(parse_timestamp(encoded)?))
}

fn decode_map_fields(value: &JsonValue) -> FirestoreResult<MapValue> {
    let object = value
        .as_object()
        .ok_or_else(|| data_loss("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| data_loss("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| data_loss("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = integer_value
            .as_str()
            .and_then(|value| i64::from_str(value).ok())
            .ok_or_else(|| data_loss("Invalid integerValue"))?;
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number.as_f64(),
            JsonValue::String(value) => value.parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| data_loss("Invalid doubleValue"))?;
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let encoded = timestamp_value
            .as_str()
            .ok_or_else(|| data_loss("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(encoded)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| data_loss("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let bytes = bytes_value
            .as_str()
            .and_then(|value| BytesValue::from_base64(value).ok())
            .ok_or_else(|| data_loss("bytesValue must be base64 string"))?;
        return Ok(FirestoreValue::from_bytes(bytes));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let value = reference_value
            .as_str()
            .ok_or_else(|| data_loss("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point.get("latitude").and_then(JsonValue::as_f64);
        let longitude = geo_point.get("longitude").and_then(JsonValue::as_f64);
        let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
            return Err(data_loss("Invalid geoPointValue"));
        };
        let point = GeoPoint::new(latitude, longitude)
            .map_err(|err| data_loss(format!("Invalid geoPointValue: {err}")))?;
        return Ok(FirestoreValue::from_geo_point(point));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let values = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(values));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = match map_value.get("fields") {
            Some(fields) => decode_map_fields(fields)?,
            None => MapValue::empty(),
        };
        return Ok(decode_server_timestamp(&map)?
            .unwrap_or_else(|| FirestoreValue::from_map_value(map)));
    }

    Err(data_loss("Unknown Firestore value type"))
}

fn decode_server_timestamp(map: &MapValue) -> FirestoreResult<Option<FirestoreValue>> {
    let is_server_timestamp = map
        .fields()
        .get(TYPE_KEY)
        .is_some_and(|value| matches!(value.kind(), ValueKind::String(kind) if kind == SERVER_TIMESTAMP_TYPE));
    if !is_server_timestamp {
        return Ok(None);
    }
    let Some(ValueKind::Timestamp(local_write_time)) =
        map.fields().get(LOCAL_WRITE_TIME_KEY).map(FirestoreValue::kind)
    else {
        return Err(data_loss("Server timestamp is missing its local write time"));
    };
    let previous = map.fields().get(PREVIOUS_VALUE_KEY).cloned();
    Ok(Some(FirestoreValue::server_timestamp(*local_write_time, previous)))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| data_loss(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deleted_doc, doc};

    #[test]
    fn restores_cached_documents() {
        let serializer = LocalSerializer::new();
        let original: MaybeDocument = doc(
            "rooms/eros",
            1_500_000,
            &[
                ("name", FirestoreValue::from_string("Eros")),
                ("count", FirestoreValue::from_integer(3)),
                (
                    "pending",
                    FirestoreValue::server_timestamp(Timestamp::new(5, 0), None),
                ),
            ],
        )
        .with_committed_mutations()
        .into();
        let encoded = serializer.encode_maybe_document(&original);
        assert_eq!(serializer.decode_maybe_document(&encoded).unwrap(), original);

        let deleted: MaybeDocument = deleted_doc("rooms/gone", 7).into();
        let encoded = serializer.encode_maybe_document(&deleted);
        assert_eq!(serializer.decode_maybe_document(&encoded).unwrap(), deleted);
    }

    #[test]
    fn size_grows_with_content() {
        let serializer = LocalSerializer::new();
        let small: MaybeDocument = doc("c/a", 1, &[]).into();
        let large: MaybeDocument = doc(
            "c/a",
            1,
            &[("text", FirestoreValue::from_string("x".repeat(1000)))],
        )
        .into();
        assert!(serializer.document_size(&large) > serializer.document_size(&small) + 1000);
    }

    #[test]
    fn rejects_unknown_shapes() {
        let err = LocalSerializer::new()
            .decode_maybe_document(&json!({ "other": {} }))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
