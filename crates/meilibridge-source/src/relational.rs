use async_trait::async_trait;
use futures::stream::BoxStream;
use meilibridge_types::{
    ChangeEvent,
    Document,
};

use crate::{
    Cursor,
    Page,
    SourceAdapter,
    SourceError,
};

/// The relational engine's adapter (spec.md §1, §4.1): a named sketch of the
/// `Count`/`FindOne`/`FindLimit` contract a MySQL or Postgres source would
/// implement for bulk-only use. No concrete SQL client backs it in this
/// workspace, so every call fails with [`SourceError::RelationalEngineNotImplemented`];
/// `watch` is unreachable in practice since [`meilibridge_config::Engine::supports_change_stream`]
/// keeps relational bridges out of the change-stream pipeline.
pub struct RelationalSource {
    engine: &'static str,
}

impl RelationalSource {
    pub fn new(engine: &'static str) -> Self {
        Self { engine }
    }

    fn unimplemented(&self) -> SourceError {
        SourceError::RelationalEngineNotImplemented(self.engine)
    }
}

#[async_trait]
impl SourceAdapter for RelationalSource {
    async fn add_collection(&self, _name: &str) {}

    async fn count(&self, _name: &str) -> Result<i64, SourceError> {
        Err(self.unimplemented())
    }

    async fn find_one(&self, _filter: Document, _name: &str) -> Result<Document, SourceError> {
        Err(self.unimplemented())
    }

    async fn find_limit(&self, _limit: i64, _name: &str) -> Result<Box<dyn Cursor>, SourceError> {
        Err(self.unimplemented())
    }

    async fn watch(&self, _name: &str) -> Result<BoxStream<'static, ChangeEvent>, SourceError> {
        Err(self.unimplemented())
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_call_reports_unimplemented() {
        let source = RelationalSource::new("mysql");
        assert!(matches!(
            source.count("t").await,
            Err(SourceError::RelationalEngineNotImplemented("mysql"))
        ));
    }
}
