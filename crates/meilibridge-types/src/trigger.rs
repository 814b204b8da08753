use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

/// The operation an HTTP trigger request asks the destination to perform
/// (spec.md §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOp {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

/// The `document` half of a trigger request: which field identifies the row
/// and what value identifies this particular row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDocument {
    pub primary_key: String,
    pub primary_value: serde_json::Value,
}

/// The wire body posted to `POST /{bridge}/{index_uid}` (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub index_uid: String,
    #[serde(rename = "type")]
    pub r#type: TriggerOp,
    pub document: TriggerDocument,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerValidationError {
    #[error("index_uid is empty")]
    IndexUidEmpty,
    #[error("document primary_key is empty")]
    PrimaryKeyEmpty,
    #[error("document primary_value is empty")]
    PrimaryValueEmpty,
}

impl TriggerRequest {
    /// All fields non-empty and `type` is one of the allowed ops (the last
    /// is enforced by `TriggerOp` itself having no catch-all variant, so an
    /// unrecognized `type` string fails to deserialize before `validate`
    /// ever runs).
    pub fn validate(&self) -> Result<(), TriggerValidationError> {
        if self.index_uid.is_empty() {
            return Err(TriggerValidationError::IndexUidEmpty);
        }
        if self.document.primary_key.is_empty() {
            return Err(TriggerValidationError::PrimaryKeyEmpty);
        }
        if self.document.primary_value.is_null() {
            return Err(TriggerValidationError::PrimaryValueEmpty);
        }
        Ok(())
    }
}
