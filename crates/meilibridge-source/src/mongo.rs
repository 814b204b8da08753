use std::collections::HashMap;

use async_trait::async_trait;
use futures::{
    stream::BoxStream,
    StreamExt,
};
use futures_async_stream::stream;
use meilibridge_types::{
    ChangeEvent,
    Document,
    Value,
};
use mongodb::{
    bson,
    options::{
        ClientOptions,
        FindOptions,
    },
    Client,
    Collection,
    Database,
};
use tokio::sync::RwLock;

use crate::{
    Cursor,
    Page,
    SourceAdapter,
    SourceError,
};

/// The MongoDB document-store adapter (spec.md §4.1), grounded on the
/// original's single-connection `Mongo` executor: one client, one database,
/// a lazily populated collection cache guarded by a single lock shared by
/// every worker of the bridge.
pub struct MongoSource {
    db: Database,
    collections: RwLock<HashMap<String, Collection<bson::Document>>>,
}

impl MongoSource {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, SourceError> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;
        client
            .database(database)
            .run_command(bson::doc! { "ping": 1 })
            .await?;
        Ok(Self {
            db: client.database(database),
            collections: RwLock::new(HashMap::new()),
        })
    }

    async fn collection(&self, name: &str) -> Collection<bson::Document> {
        if let Some(col) = self.collections.read().await.get(name) {
            return col.clone();
        }
        let mut collections = self.collections.write().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| self.db.collection(name))
            .clone()
    }
}

#[async_trait]
impl SourceAdapter for MongoSource {
    async fn add_collection(&self, name: &str) {
        let _ = self.collection(name).await;
    }

    async fn count(&self, name: &str) -> Result<i64, SourceError> {
        let count = self.collection(name).await.estimated_document_count().await?;
        Ok(count as i64)
    }

    async fn find_one(&self, filter: Document, name: &str) -> Result<Document, SourceError> {
        let filter = bson::Document::from(filter);
        let doc = self
            .collection(name)
            .await
            .find_one(filter)
            .await?
            .ok_or(SourceError::NotFound)?;
        Ok(Document::from(doc))
    }

    async fn find_limit(&self, limit: i64, name: &str) -> Result<Box<dyn Cursor>, SourceError> {
        let col = self.collection(name).await;
        let count = col.estimated_document_count().await? as i64;
        let pages = count.div_ceil(limit.max(1));
        Ok(Box::new(MongoCursor {
            col,
            limit,
            page: 0,
            pages,
        }))
    }

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, ChangeEvent>, SourceError> {
        let col = self.collection(name).await;
        let pipeline = change_stream_pipeline();
        let change_stream = col.watch().pipeline(pipeline).await?;
        Ok(Box::pin(decode_events(change_stream)))
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Per-event decode errors are logged and skipped; the stream itself never
/// ends because of them (spec.md §4.1 failures).
#[stream(boxed, item = ChangeEvent)]
async fn decode_events(mut change_stream: mongodb::change_stream::ChangeStream<bson::Document>) {
    while let Some(next) = change_stream.next().await {
        match next {
            Ok(event) => {
                if let Some(change_event) = decode_change_event(event) {
                    yield change_event;
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "change stream decode error");
            },
        }
    }
}

/// `$project` narrows the change stream to the four fields the pipeline
/// dispatches on (spec.md §4.1). The original hoists `documentKey._id` to
/// `documentKey` with an `$addFields` stage purely so its hand-rolled decode
/// struct can read it as a scalar; the driver's typed `ChangeStreamEvent`
/// already exposes `document_key` as a document, so `decode_change_event`
/// reads `_id` out of it directly instead of renaming it on the wire.
fn change_stream_pipeline() -> Vec<bson::Document> {
    vec![bson::doc! {
        "$project": {
            "operationType": 1,
            "documentKey": 1,
            "fullDocument": 1,
            "updateDescription": 1,
        }
    }]
}

fn decode_change_event(event: mongodb::change_stream::event::ChangeStreamEvent<bson::Document>) -> Option<ChangeEvent> {
    let id = event.document_key.and_then(|key| key.get("_id").cloned()).map(Value::from)?;

    match event.operation_type {
        mongodb::change_stream::event::OperationType::Insert => Some(ChangeEvent::Insert {
            id,
            full_document: event.full_document.map(Document::from).unwrap_or_default(),
        }),
        mongodb::change_stream::event::OperationType::Update => {
            let update = event.update_description?;
            Some(ChangeEvent::Update {
                id,
                updated_fields: Document::from(update.updated_fields),
                removed_fields: update.removed_fields,
            })
        },
        mongodb::change_stream::event::OperationType::Delete => Some(ChangeEvent::Delete { id }),
        mongodb::change_stream::event::OperationType::Replace => Some(ChangeEvent::Replace {
            id,
            full_document: event.full_document.map(Document::from).unwrap_or_default(),
        }),
        _ => None,
    }
}

struct MongoCursor {
    col: Collection<bson::Document>,
    limit: i64,
    page: i64,
    pages: i64,
}

#[async_trait]
impl Cursor for MongoCursor {
    async fn next(&mut self) -> Result<Option<Page>, SourceError> {
        if self.page >= self.pages {
            return Ok(None);
        }
        let skip = (self.page * self.limit) as u64;
        let opts = FindOptions::builder().skip(skip).limit(self.limit).build();
        let mut cursor = self.col.find(bson::doc! {}).with_options(opts).await?;
        let mut page = Vec::new();
        while let Some(doc) = cursor.next().await {
            page.push(Document::from(doc?));
        }
        self.page += 1;
        Ok(Some(page))
    }
}
