//! The destination side of a bridge: the search-service adapter contract
//! (spec.md §4.2) plus the one production implementation, [`MeiliDestination`].
//!
//! Every mutating call returns an opaque [`TaskHandle`] that the caller must
//! resolve with [`DestinationAdapter::wait_for_task`] before treating a batch
//! as durable — the async task model is the whole point of this crate.

mod meili;

use async_trait::async_trait;
pub use meili::MeiliDestination;
use meilibridge_config::IndexSettings;
use meilibridge_types::{
    Document,
    Pk,
    TaskHandle,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("meilisearch is unhealthy")]
    Unhealthy,

    #[error("index `{0}` not found")]
    IndexNotFound(String),

    #[error("meilisearch request failed: {0}")]
    Request(#[from] meilisearch_sdk::errors::Error),

    #[error("failed to encode index settings: {0}")]
    SettingsEncoding(#[from] serde_json::Error),

    #[error("task {uid} on index {index_uid} failed: {message}")]
    TaskFailed {
        uid: u32,
        index_uid: String,
        message: String,
    },

    #[error("task {0} was canceled")]
    TaskCanceled(u32),

    #[error("task {0} resolved to an unknown status")]
    TaskUnknown(u32),
}

/// Per-index document counts, the minimal shape the bulk pipeline's
/// continue-mode short-circuit needs (spec.md §4.4 step 3, I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub number_of_documents: i64,
    pub is_indexing: bool,
}

/// Instance-wide stats, keyed by index uid (mirrors the original's
/// `Stats().Indexes` map).
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub indexes: std::collections::BTreeMap<String, IndexStats>,
}

/// The contract every search-service destination implements (spec.md §4.2).
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    async fn index_exists(&self, uid: &str) -> bool;

    async fn create_index(&self, uid: &str, pk: &Pk) -> Result<TaskHandle, DestinationError>;

    async fn delete_index(&self, uid: &str) -> Result<TaskHandle, DestinationError>;

    async fn update_index_settings(
        &self,
        uid: &str,
        settings: &IndexSettings,
    ) -> Result<(), DestinationError>;

    async fn add_documents(
        &self,
        uid: &str,
        docs: Vec<Document>,
    ) -> Result<TaskHandle, DestinationError>;

    async fn update_documents(
        &self,
        uid: &str,
        docs: Vec<Document>,
        pk: Option<&Pk>,
    ) -> Result<TaskHandle, DestinationError>;

    async fn get_document(&self, uid: &str, id: &str) -> Result<Document, DestinationError>;

    async fn delete_document(&self, uid: &str, id: &str) -> Result<TaskHandle, DestinationError>;

    async fn wait_for_task(&self, task: TaskHandle) -> Result<(), DestinationError>;

    /// Degrades to `None` rather than propagating an error: a read-only
    /// reporting call need not fail the caller (mirrors the original's
    /// `Stats()` behavior).
    async fn stats(&self) -> Option<Stats>;

    async fn index_stats(&self, uid: &str) -> Option<IndexStats>;

    async fn version(&self) -> Option<String>;

    async fn close(&self) -> Result<(), DestinationError>;

    /// The recreate-index protocol (spec.md §4.2): delete if present, then
    /// create, then apply settings if any. Used by bulk mode whenever it is
    /// not running in `--continue`.
    async fn recreate(
        &self,
        uid: &str,
        pk: &Pk,
        settings: Option<&IndexSettings>,
    ) -> Result<(), DestinationError> {
        if self.index_exists(uid).await {
            let task = self.delete_index(uid).await?;
            self.wait_for_task(task).await?;
        }

        let task = self.create_index(uid, pk).await?;
        self.wait_for_task(task).await?;

        if let Some(settings) = settings {
            self.update_index_settings(uid, settings).await?;
        }

        Ok(())
    }
}
