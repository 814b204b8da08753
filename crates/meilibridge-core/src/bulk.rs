//! The bulk pipeline (spec.md §4.4): one worker per (collection, index)
//! pair, scanning pages of up to 100 documents and upserting each page
//! before moving on. Workers run independently; there is no ordering
//! between them (spec.md §5).

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use meilibridge_config::IndexConfig;
use meilibridge_dest::DestinationAdapter;
use meilibridge_source::SourceAdapter;
use meilibridge_types::CollectionRef;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// `FindLimit(bulkLimit, readName)` uses a 100-document page (spec.md
/// §4.4 step 4).
pub const BULK_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct BulkStat {
    pub collection: String,
    pub index: String,
    pub indexed: i64,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub enum BulkEvent {
    Progress(BulkStat),
    /// The first error in any worker is fatal for the whole bulk run
    /// (spec.md §7 "Bulk: first error halts the worker... terminates the
    /// process").
    Error {
        collection: String,
        index: String,
        message: String,
    },
}

/// Runs one bulk pass across every (collection, index) pair in
/// `index_map`, fanning a worker out per pair and forwarding progress/error
/// events on `events`. Returns once every worker has finished (or one has
/// failed).
pub async fn run_bulk(
    source: Arc<dyn SourceAdapter>,
    dest: Arc<dyn DestinationAdapter>,
    index_map: &BTreeMap<CollectionRef, IndexConfig>,
    continue_mode: bool,
    cancel: CancellationToken,
    events: mpsc::Sender<BulkEvent>,
) {
    let mut workers = Vec::with_capacity(index_map.len());
    for (collection_ref, index_config) in index_map.clone() {
        let source = source.clone();
        let dest = dest.clone();
        let cancel = cancel.clone();
        let events = events.clone();
        workers.push(tokio::spawn(async move {
            bulk_worker(source, dest, collection_ref, index_config, continue_mode, cancel, events)
                .await;
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
}

async fn bulk_worker(
    source: Arc<dyn SourceAdapter>,
    dest: Arc<dyn DestinationAdapter>,
    collection_ref: CollectionRef,
    index_config: IndexConfig,
    continue_mode: bool,
    cancel: CancellationToken,
    events: mpsc::Sender<BulkEvent>,
) {
    let read_name = collection_ref.read_name().to_string();
    let uid = &index_config.index_name;
    source.add_collection(&read_name).await;

    let count = match source.count(&read_name).await {
        Ok(count) => count,
        Err(err) => {
            let _ = events
                .send(BulkEvent::Error {
                    collection: read_name,
                    index: uid.clone(),
                    message: err.to_string(),
                })
                .await;
            return;
        },
    };

    if !continue_mode {
        if let Err(err) = dest
            .recreate(uid, &index_config.primary_key, index_config.settings.as_ref())
            .await
        {
            let _ = events
                .send(BulkEvent::Error {
                    collection: read_name,
                    index: uid.clone(),
                    message: err.to_string(),
                })
                .await;
            return;
        }
    } else {
        if !dest.index_exists(uid).await {
            let _ = events
                .send(BulkEvent::Error {
                    collection: read_name,
                    index: uid.clone(),
                    message: format!("index {uid} does not exist for resync"),
                })
                .await;
            return;
        }

        // I3: the continue short-circuit. A weak equivalence per spec.md
        // §9 Open Question (a) -- deletions between runs can produce a
        // false positive match, which we accept as documented.
        if let Some(stats) = dest.index_stats(uid).await {
            if stats.number_of_documents == count {
                tracing::info!(index = %uid, "index already synced");
                return;
            }
        }
    }

    let mut cursor = match source.find_limit(BULK_LIMIT, &read_name).await {
        Ok(cursor) => cursor,
        Err(err) => {
            let _ = events
                .send(BulkEvent::Error {
                    collection: read_name,
                    index: uid.clone(),
                    message: err.to_string(),
                })
                .await;
            return;
        },
    };

    let mut indexed = 0i64;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let page = match cursor.next().await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(err) => {
                let _ = events
                    .send(BulkEvent::Error {
                        collection: read_name,
                        index: uid.clone(),
                        message: err.to_string(),
                    })
                    .await;
                return;
            },
        };

        if page.is_empty() {
            continue;
        }

        let batch = index_config.projection.apply_batch(page);
        let batch_len = batch.len() as i64;

        let task = match dest.update_documents(uid, batch, Some(&index_config.primary_key)).await {
            Ok(task) => task,
            Err(err) => {
                let _ = events
                    .send(BulkEvent::Error {
                        collection: read_name,
                        index: uid.clone(),
                        message: err.to_string(),
                    })
                    .await;
                return;
            },
        };

        if let Err(err) = dest.wait_for_task(task).await {
            let _ = events
                .send(BulkEvent::Error {
                    collection: read_name,
                    index: uid.clone(),
                    message: err.to_string(),
                })
                .await;
            return;
        }

        indexed += batch_len;
        let _ = events
            .send(BulkEvent::Progress(BulkStat {
                collection: read_name.clone(),
                index: uid.clone(),
                indexed,
                total: count,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use meilibridge_dest::DestinationAdapter;
    use meilibridge_types::{
        CollectionRef,
        Document,
        Pk,
        Projection,
        Value,
    };

    use super::*;
    use crate::test_support::{
        FakeDest,
        FakeSource,
    };

    fn doc(id: &str, name: &str) -> Document {
        let mut d = Document::new();
        d.insert("_id", Value::String(id.to_string()));
        d.insert("name", Value::String(name.to_string()));
        d
    }

    fn index_map(
        collection: &str,
        uid: &str,
        mapping: Option<BTreeMap<String, String>>,
    ) -> BTreeMap<CollectionRef, IndexConfig> {
        btreemap! {
            CollectionRef::parse(collection) => IndexConfig {
                index_name: uid.to_string(),
                primary_key: Pk::from("_id"),
                projection: mapping.map(Projection::new).unwrap_or_else(Projection::identity),
                settings: None,
            },
        }
    }

    async fn drain(mut rx: mpsc::Receiver<BulkEvent>) -> Vec<BulkEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn bulk_fresh_run_indexes_every_document_with_projected_keys() {
        let source = Arc::new(FakeSource::new());
        source.seed(
            "widgets",
            vec![doc("1", "a"), doc("2", "b"), doc("3", "c"), doc("4", "d")],
        );
        let dest = Arc::new(FakeDest::new());

        let mapping = btreemap! {
            "_id".to_string() => "".to_string(),
            "name".to_string() => "first_name".to_string(),
        };
        let index_map = index_map("widgets", "widgets_idx", Some(mapping));

        let (tx, rx) = mpsc::channel(16);
        run_bulk(source, dest.clone(), &index_map, false, CancellationToken::new(), tx).await;
        let events = drain(rx).await;

        assert!(events.iter().all(|e| matches!(e, BulkEvent::Progress(_))), "{events:?}");
        assert_eq!(dest.doc_count("widgets_idx"), 4);
        let got = dest.get("widgets_idx", "1").unwrap();
        assert!(got.get("name").is_none());
        assert_eq!(got.get("first_name"), Some(&Value::String("a".to_string())));
    }

    #[tokio::test]
    async fn bulk_continue_mode_adds_new_rows_without_disturbing_existing_ones() {
        let source = Arc::new(FakeSource::new());
        source.seed("widgets", vec![doc("1", "a"), doc("2", "b")]);
        let dest = Arc::new(FakeDest::new());

        let index_map = index_map("widgets", "widgets_idx", None);

        let (tx, rx) = mpsc::channel(16);
        run_bulk(source.clone(), dest.clone(), &index_map, false, CancellationToken::new(), tx).await;
        drain(rx).await;
        assert_eq!(dest.doc_count("widgets_idx"), 2);

        source.insert_one("widgets", doc("3", "c"));
        source.insert_one("widgets", doc("4", "d"));

        let (tx, rx) = mpsc::channel(16);
        run_bulk(source, dest.clone(), &index_map, true, CancellationToken::new(), tx).await;
        drain(rx).await;

        assert_eq!(dest.doc_count("widgets_idx"), 4);
        assert_eq!(dest.get("widgets_idx", "1"), Some(doc("1", "a")));
        assert_eq!(dest.get("widgets_idx", "2"), Some(doc("2", "b")));
    }

    #[tokio::test]
    async fn continue_mode_short_circuits_when_counts_already_match() {
        // I3: a matching doc count skips the pass entirely (no progress events).
        let source = Arc::new(FakeSource::new());
        source.seed("widgets", vec![doc("1", "a")]);
        let dest = Arc::new(FakeDest::new());
        dest.create_index("widgets_idx", &Pk::from("_id")).await.unwrap();
        dest.update_documents("widgets_idx", vec![doc("1", "a")], None).await.unwrap();

        let index_map = index_map("widgets", "widgets_idx", None);
        let (tx, rx) = mpsc::channel(16);
        run_bulk(source, dest.clone(), &index_map, true, CancellationToken::new(), tx).await;
        let events = drain(rx).await;

        assert!(events.is_empty(), "expected no writes once counts match, got {events:?}");
    }

    #[tokio::test]
    async fn empty_collection_still_recreates_the_index_with_no_document_writes() {
        // B2: an empty source collection still gets a (re)created index, but
        // no update_documents call happens since there are no pages to send.
        let source = Arc::new(FakeSource::new());
        source.seed("widgets", vec![]);
        let dest = Arc::new(FakeDest::new());

        let index_map = index_map("widgets", "widgets_idx", None);
        let (tx, rx) = mpsc::channel(16);
        run_bulk(source, dest.clone(), &index_map, false, CancellationToken::new(), tx).await;
        let events = drain(rx).await;

        assert!(events.is_empty());
        assert!(dest.doc_count("widgets_idx") == 0);
    }
}
