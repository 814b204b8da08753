use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    value::Value,
    Pk,
};

/// An unordered mapping from string keys to dynamically typed values
/// (spec.md §3). Backed by a `BTreeMap` so iteration order is deterministic,
/// which matters for idempotence checks (R1) and for stable log output.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Document(pub BTreeMap<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The document's primary-key value, rendered the way the destination
    /// and trigger identifiers expect it (spec.md §4.6).
    pub fn pk_identifier(&self, pk: &Pk) -> Option<String> {
        self.get(pk.as_str()).map(Value::to_identifier_string)
    }
}

impl From<serde_json::Value> for Document {
    /// Decodes a destination-read JSON object (`GetDocument`, spec.md §4.5)
    /// back into our dynamic [`Document`]. A non-object value has no keys to
    /// speak of and decodes to an empty document.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
            _ => Self::new(),
        }
    }
}

impl From<bson::Document> for Document {
    fn from(doc: bson::Document) -> Self {
        Self(
            doc.into_iter()
                .map(|(key, value)| (key, Value::from(value)))
                .collect(),
        )
    }
}

impl From<Document> for bson::Document {
    fn from(doc: Document) -> Self {
        doc.0
            .into_iter()
            .map(|(key, value)| (key, bson::Bson::from(value)))
            .collect()
    }
}

impl From<Document> for serde_json::Value {
    fn from(doc: Document) -> Self {
        serde_json::Value::Object(
            doc.0
                .into_iter()
                .map(|(key, value)| (key, serde_json::Value::from(value)))
                .collect(),
        )
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
