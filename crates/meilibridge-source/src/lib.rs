//! The source side of a bridge: a document-store adapter over MongoDB
//! change streams (spec.md §4.1), plus the shared adapter contract a
//! relational engine would implement for bulk-only use.
#![feature(coroutines)]

mod mongo;
mod relational;

use async_trait::async_trait;
use futures::stream::BoxStream;
pub use mongo::MongoSource;
pub use relational::RelationalSource;
use meilibridge_types::{
    ChangeEvent,
    Document,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connection(#[from] mongodb::error::Error),

    #[error("document not found")]
    NotFound,

    #[error("collection `{0}` was not registered with AddCollection")]
    CollectionNotRegistered(String),

    #[error("the {0} relational engine has no adapter implementation in this workspace")]
    RelationalEngineNotImplemented(&'static str),
}

/// One page of a [`SourceAdapter::find_limit`] scan.
pub type Page = Vec<Document>;

/// A paged, restartable-by-(page,limit) scan over a collection (spec.md §3
/// "Cursor"). `next` returns `None` once the cursor is exhausted.
#[async_trait]
pub trait Cursor: Send {
    async fn next(&mut self) -> Result<Option<Page>, SourceError>;
}

/// The contract every document-store source implements (spec.md §4.1).
/// Collection registration is idempotent and lazy; concurrent registration
/// must be safe, since bulk and change-stream workers for different
/// collections share one adapter instance per bridge.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn add_collection(&self, name: &str);

    /// An estimated count; callers treat it as a progress upper bound, never
    /// a correctness invariant (spec.md §4.1).
    async fn count(&self, name: &str) -> Result<i64, SourceError>;

    async fn find_one(&self, filter: Document, name: &str) -> Result<Document, SourceError>;

    async fn find_limit(&self, limit: i64, name: &str) -> Result<Box<dyn Cursor>, SourceError>;

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, ChangeEvent>, SourceError>;

    async fn close(&self) -> Result<(), SourceError>;
}
