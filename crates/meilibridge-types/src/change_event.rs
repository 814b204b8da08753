use crate::{
    Document,
    Value,
};

/// A single MongoDB change-stream event, already narrowed to the shape the
/// change-stream pipeline dispatches on (spec.md §3, invariant E1). Decoding
/// an event whose `operationType` is anything other than insert/update/
/// delete/replace yields `None` at the call site rather than a variant here,
/// since there is nothing for a worker to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert {
        id: Value,
        full_document: Document,
    },
    Update {
        id: Value,
        updated_fields: Document,
        removed_fields: Vec<String>,
    },
    Delete {
        id: Value,
    },
    Replace {
        id: Value,
        full_document: Document,
    },
}

impl ChangeEvent {
    /// The document id every event kind carries, used to key cached
    /// documents and build destination identifiers.
    pub fn id(&self) -> &Value {
        match self {
            ChangeEvent::Insert { id, .. }
            | ChangeEvent::Update { id, .. }
            | ChangeEvent::Delete { id }
            | ChangeEvent::Replace { id, .. } => id,
        }
    }
}
