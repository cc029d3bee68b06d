//! Conversion between Automerge objects and JSON values
//!
//! Block attributes, dataframe descriptors and queue entries are stored as
//! nested Automerge maps and lists. These helpers read a subtree into a
//! `serde_json::Value` and write a value back as fresh objects.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, Prop, ReadDoc, ScalarValue, Value};
use serde_json::{Map, Number, Value as Json};

use crate::error::SyncResult;

fn scalar_to_json(scalar: &ScalarValue) -> Json {
    match scalar {
        ScalarValue::Str(s) => Json::String(s.to_string()),
        ScalarValue::Int(n) => Json::from(*n),
        ScalarValue::Uint(n) => Json::from(*n),
        ScalarValue::F64(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        ScalarValue::Boolean(b) => Json::Bool(*b),
        ScalarValue::Timestamp(t) => Json::from(*t),
        ScalarValue::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        ScalarValue::Null => Json::Null,
        _ => Json::Null,
    }
}

fn json_to_scalar(value: &Json) -> ScalarValue {
    match value {
        Json::Bool(b) => ScalarValue::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => ScalarValue::from(s.as_str()),
        Json::Null | Json::Array(_) | Json::Object(_) => ScalarValue::Null,
    }
}

/// Read the value stored under `prop`, recursing into nested objects
pub(crate) fn read_json<P: Into<Prop>>(
    doc: &AutoCommit,
    obj: &ObjId,
    prop: P,
) -> SyncResult<Option<Json>> {
    let value = match doc.get(obj, prop)? {
        None => None,
        Some((Value::Scalar(scalar), _)) => Some(scalar_to_json(scalar.as_ref())),
        Some((Value::Object(ObjType::List), id)) => Some(list_to_json(doc, &id)?),
        Some((Value::Object(ObjType::Text), id)) => Some(Json::String(doc.text(&id)?)),
        Some((Value::Object(_), id)) => Some(map_to_json(doc, &id)?),
    };
    Ok(value)
}

/// Read a whole map object as a JSON object
pub(crate) fn map_to_json(doc: &AutoCommit, obj: &ObjId) -> SyncResult<Json> {
    let mut out = Map::new();
    for key in doc.keys(obj) {
        if let Some(value) = read_json(doc, obj, key.as_str())? {
            out.insert(key, value);
        }
    }
    Ok(Json::Object(out))
}

/// Read a whole list object as a JSON array
pub(crate) fn list_to_json(doc: &AutoCommit, obj: &ObjId) -> SyncResult<Json> {
    let len = doc.length(obj);
    let mut out = Vec::with_capacity(len);
    for index in 0..len {
        out.push(read_json(doc, obj, index)?.unwrap_or(Json::Null));
    }
    Ok(Json::Array(out))
}

/// Write `value` under `key` in a map, creating nested objects as needed
pub(crate) fn put_json(
    doc: &mut AutoCommit,
    obj: &ObjId,
    key: &str,
    value: &Json,
) -> SyncResult<()> {
    match value {
        Json::Array(items) => {
            let list = doc.put_object(obj, key, ObjType::List)?;
            for (index, item) in items.iter().enumerate() {
                insert_json(doc, &list, index, item)?;
            }
        }
        Json::Object(map) => {
            let child = doc.put_object(obj, key, ObjType::Map)?;
            for (k, v) in map {
                put_json(doc, &child, k, v)?;
            }
        }
        scalar => doc.put(obj, key, json_to_scalar(scalar))?,
    }
    Ok(())
}

/// Insert `value` at `index` in a list, creating nested objects as needed
pub(crate) fn insert_json(
    doc: &mut AutoCommit,
    list: &ObjId,
    index: usize,
    value: &Json,
) -> SyncResult<()> {
    match value {
        Json::Array(items) => {
            let child = doc.insert_object(list, index, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_json(doc, &child, i, item)?;
            }
        }
        Json::Object(map) => {
            let child = doc.insert_object(list, index, ObjType::Map)?;
            for (k, v) in map {
                put_json(doc, &child, k, v)?;
            }
        }
        scalar => doc.insert(list, index, json_to_scalar(scalar))?,
    }
    Ok(())
}
