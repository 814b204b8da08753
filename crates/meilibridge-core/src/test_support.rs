//! In-memory fakes for [`SourceAdapter`]/[`DestinationAdapter`], used by
//! this crate's own integration-style tests (spec.md §8 end-to-end
//! scenarios) instead of a live Mongo/Meilisearch, which are out of scope
//! per spec.md §1.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Mutex,
    },
};

use async_trait::async_trait;
use futures::stream::{
    self,
    BoxStream,
};
use meilibridge_config::IndexSettings;
use meilibridge_dest::{
    DestinationAdapter,
    DestinationError,
    IndexStats,
    Stats,
};
use meilibridge_source::{
    Cursor,
    Page,
    SourceAdapter,
    SourceError,
};
use meilibridge_types::{
    ChangeEvent,
    Document,
    Pk,
    TaskHandle,
};

/// A fake document-store collection, addressable by name, with no paging
/// consistency guarantees beyond what spec.md §4.1/§9 already allows.
#[derive(Default)]
pub struct FakeSource {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or replaces) a collection's documents directly, bypassing
    /// `add_collection`'s lazy-registration semantics (tests don't need
    /// that path exercised every time).
    pub fn seed(&self, name: &str, docs: Vec<Document>) {
        self.collections.lock().unwrap().insert(name.to_string(), docs);
    }

    pub fn insert_one(&self, name: &str, doc: Document) {
        self.collections.lock().unwrap().entry(name.to_string()).or_default().push(doc);
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    async fn add_collection(&self, name: &str) {
        self.collections.lock().unwrap().entry(name.to_string()).or_default();
    }

    async fn count(&self, name: &str) -> Result<i64, SourceError> {
        Ok(self.collections.lock().unwrap().get(name).map_or(0, Vec::len) as i64)
    }

    async fn find_one(&self, filter: Document, name: &str) -> Result<Document, SourceError> {
        let collections = self.collections.lock().unwrap();
        let docs = collections.get(name).ok_or(SourceError::NotFound)?;
        let (key, value) = filter.0.iter().next().ok_or(SourceError::NotFound)?;
        docs.iter()
            .find(|doc| doc.get(key) == Some(value))
            .cloned()
            .ok_or(SourceError::NotFound)
    }

    async fn find_limit(&self, limit: i64, name: &str) -> Result<Box<dyn Cursor>, SourceError> {
        let docs = self.collections.lock().unwrap().get(name).cloned().unwrap_or_default();
        Ok(Box::new(FakeCursor {
            docs,
            limit: limit.max(1) as usize,
            offset: 0,
        }))
    }

    async fn watch(&self, _name: &str) -> Result<BoxStream<'static, ChangeEvent>, SourceError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

struct FakeCursor {
    docs: Vec<Document>,
    limit: usize,
    offset: usize,
}

#[async_trait]
impl Cursor for FakeCursor {
    async fn next(&mut self) -> Result<Option<Page>, SourceError> {
        if self.offset >= self.docs.len() {
            return Ok(None);
        }
        let end = (self.offset + self.limit).min(self.docs.len());
        let page = self.docs[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(page))
    }
}

/// A fake Meilisearch: every mutation resolves immediately (no async task
/// delay to simulate), keyed by the caller-supplied primary key so tests
/// can assert on exact upsert semantics.
#[derive(Default)]
pub struct FakeDest {
    indexes: Mutex<HashMap<String, FakeIndex>>,
    next_task: AtomicU32,
}

#[derive(Default)]
struct FakeIndex {
    pk: String,
    docs: BTreeMap<String, Document>,
}

impl FakeDest {
    pub fn new() -> Self {
        Self::default()
    }

    fn task(&self) -> TaskHandle {
        TaskHandle { uid: self.next_task.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn doc_count(&self, uid: &str) -> usize {
        self.indexes.lock().unwrap().get(uid).map_or(0, |i| i.docs.len())
    }

    pub fn get(&self, uid: &str, id: &str) -> Option<Document> {
        self.indexes.lock().unwrap().get(uid)?.docs.get(id).cloned()
    }
}

#[async_trait]
impl DestinationAdapter for FakeDest {
    async fn index_exists(&self, uid: &str) -> bool {
        self.indexes.lock().unwrap().contains_key(uid)
    }

    async fn create_index(&self, uid: &str, pk: &Pk) -> Result<TaskHandle, DestinationError> {
        self.indexes.lock().unwrap().insert(
            uid.to_string(),
            FakeIndex { pk: pk.as_str().to_string(), docs: BTreeMap::new() },
        );
        Ok(self.task())
    }

    async fn delete_index(&self, uid: &str) -> Result<TaskHandle, DestinationError> {
        self.indexes.lock().unwrap().remove(uid);
        Ok(self.task())
    }

    async fn update_index_settings(
        &self,
        _uid: &str,
        _settings: &IndexSettings,
    ) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn add_documents(&self, uid: &str, docs: Vec<Document>) -> Result<TaskHandle, DestinationError> {
        self.upsert(uid, docs)?;
        Ok(self.task())
    }

    async fn update_documents(
        &self,
        uid: &str,
        docs: Vec<Document>,
        _pk: Option<&Pk>,
    ) -> Result<TaskHandle, DestinationError> {
        self.upsert(uid, docs)?;
        Ok(self.task())
    }

    async fn get_document(&self, uid: &str, id: &str) -> Result<Document, DestinationError> {
        self.get(uid, id).ok_or_else(|| DestinationError::IndexNotFound(uid.to_string()))
    }

    async fn delete_document(&self, uid: &str, id: &str) -> Result<TaskHandle, DestinationError> {
        if let Some(index) = self.indexes.lock().unwrap().get_mut(uid) {
            index.docs.remove(id);
        }
        Ok(self.task())
    }

    async fn wait_for_task(&self, _task: TaskHandle) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn stats(&self) -> Option<Stats> {
        None
    }

    async fn index_stats(&self, uid: &str) -> Option<IndexStats> {
        let indexes = self.indexes.lock().unwrap();
        let index = indexes.get(uid)?;
        Some(IndexStats { number_of_documents: index.docs.len() as i64, is_indexing: false })
    }

    async fn version(&self) -> Option<String> {
        Some("fake".to_string())
    }

    async fn close(&self) -> Result<(), DestinationError> {
        Ok(())
    }
}

impl FakeDest {
    fn upsert(&self, uid: &str, docs: Vec<Document>) -> Result<(), DestinationError> {
        let mut indexes = self.indexes.lock().unwrap();
        let index = indexes.get_mut(uid).ok_or_else(|| DestinationError::IndexNotFound(uid.to_string()))?;
        let pk = Pk::from(index.pk.clone());
        for doc in docs {
            let Some(id) = doc.pk_identifier(&pk) else { continue };
            index.docs.insert(id, doc);
        }
        Ok(())
    }
}
