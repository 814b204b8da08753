use bson::oid::ObjectId;
use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;

use crate::Document;

/// A dynamically typed value found in a source document or destination
/// payload. Mirrors spec.md §3's "Document" data model: the source value
/// type is open, so we model it as a tagged enum rather than committing to
/// one concrete Rust type, the way a generic `bson::Bson`/`serde_json::Value`
/// would erase the distinction between e.g. an object id and a plain string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value the way a trigger/FindOne primary-key lookup needs
    /// it for logging and as a destination identifier (spec.md §4.6: "keeping
    /// a string identifier for deletes").
    pub fn to_identifier_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::ObjectId(id) => id.to_hex(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<bson::Bson> for Value {
    fn from(bson: bson::Bson) -> Self {
        match bson {
            bson::Bson::Double(f) => Value::Float(f),
            bson::Bson::String(s) => Value::String(s),
            bson::Bson::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            bson::Bson::Document(doc) => Value::Document(Document::from(doc)),
            bson::Bson::Boolean(b) => Value::Bool(b),
            bson::Bson::Null => Value::Null,
            bson::Bson::Int32(i) => Value::Int(i as i64),
            bson::Bson::Int64(i) => Value::Int(i),
            bson::Bson::ObjectId(id) => Value::ObjectId(id),
            bson::Bson::DateTime(dt) => Value::DateTime(dt.to_chrono()),
            bson::Bson::Binary(bin) => Value::Binary(bin.bytes),
            bson::Bson::Decimal128(d) => Value::String(d.to_string()),
            other => Value::String(other.to_string()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Binary(bytes) => serde_json::Value::String(hex::encode(bytes)),
            Value::ObjectId(id) => serde_json::Value::String(id.to_hex()),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            },
            Value::Document(doc) => serde_json::Value::from(doc),
        }
    }
}

impl From<Value> for bson::Bson {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => bson::Bson::Null,
            Value::Bool(b) => bson::Bson::Boolean(b),
            Value::Int(i) => bson::Bson::Int64(i),
            Value::Float(f) => bson::Bson::Double(f),
            Value::String(s) => bson::Bson::String(s),
            Value::DateTime(dt) => bson::Bson::DateTime(bson::DateTime::from_chrono(dt)),
            Value::Binary(bytes) => bson::Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes,
            }),
            Value::ObjectId(id) => bson::Bson::ObjectId(id),
            Value::Array(items) => bson::Bson::Array(items.into_iter().map(bson::Bson::from).collect()),
            Value::Document(doc) => bson::Bson::Document(bson::Document::from(doc)),
        }
    }
}

impl From<serde_json::Value> for Value {
    /// The destination only ever speaks plain JSON, so a value read back
    /// from it (e.g. the change-stream pipeline's `GetDocument` lookup,
    /// spec.md §4.5) can't distinguish an object id or a byte string from a
    /// plain string; those round-trip as `Value::String`.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            },
            serde_json::Value::Object(map) => Value::Document(Document::from(
                serde_json::Value::Object(map),
            )),
        }
    }
}
