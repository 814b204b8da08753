//! The change-stream pipeline (spec.md §4.5): one worker per (collection,
//! index) pair, subscribed to the source's change stream and dispatching
//! each event by kind. Handlers are fanned out without a bound, per
//! spec.md §9's design note — a per-index semaphore is a possible future
//! refinement, not required here.

use std::sync::Arc;

use meilibridge_config::IndexConfig;
use meilibridge_dest::DestinationAdapter;
use meilibridge_source::SourceAdapter;
use meilibridge_types::{
    ChangeEvent,
    CollectionRef,
    Document,
    Value,
};
use tokio_util::sync::CancellationToken;

/// Runs the change-stream worker for one (collection, index) pair until
/// `cancel` fires or the subscription ends. Per-event errors are logged and
/// the stream continues; a subscription error terminates the worker
/// (spec.md §4.5, §7).
pub async fn run_change_stream(
    source: Arc<dyn SourceAdapter>,
    dest: Arc<dyn DestinationAdapter>,
    collection_ref: CollectionRef,
    index_config: IndexConfig,
    cancel: CancellationToken,
) {
    let watch_name = collection_ref.watch_name().to_string();
    let read_name = collection_ref.read_name().to_string();
    let has_view = collection_ref.has_view();
    let uid = index_config.index_name.clone();

    if has_view {
        source.add_collection(&read_name).await;
    }
    source.add_collection(&watch_name).await;

    if !dest.index_exists(&uid).await {
        if let Err(err) = dest.recreate(&uid, &index_config.primary_key, index_config.settings.as_ref()).await {
            tracing::error!(index = %uid, error = %err, "failed to recreate index before watching");
            return;
        }
    }

    let mut stream = match source.watch(&watch_name).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(collection = %watch_name, error = %err, "failed to subscribe to change stream");
            return;
        },
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream_next(&mut stream) => {
                let Some(event) = next else { return };
                let source = source.clone();
                let dest = dest.clone();
                let read_name = read_name.clone();
                let uid = uid.clone();
                let index_config = index_config.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        dispatch(source, dest, &read_name, has_view, &uid, &index_config, event).await
                    {
                        tracing::error!(index = %uid, error = %err, "change event handling failed");
                    }
                });
            },
        }
    }
}

async fn stream_next(
    stream: &mut futures::stream::BoxStream<'static, ChangeEvent>,
) -> Option<ChangeEvent> {
    use futures::StreamExt;
    stream.next().await
}

async fn dispatch(
    source: Arc<dyn SourceAdapter>,
    dest: Arc<dyn DestinationAdapter>,
    read_name: &str,
    has_view: bool,
    uid: &str,
    index_config: &IndexConfig,
    event: ChangeEvent,
) -> anyhow::Result<()> {
    match event {
        ChangeEvent::Insert { id, full_document } => {
            let doc = if has_view {
                source.find_one(id_filter(&id), read_name).await?
            } else {
                full_document
            };
            let doc = index_config.projection.apply(doc);
            let task = dest.add_documents(uid, vec![doc]).await?;
            dest.wait_for_task(task).await?;
        },
        ChangeEvent::Update {
            id,
            updated_fields,
            removed_fields,
        } => {
            let identifier = id.to_identifier_string();
            let mut doc = match dest.get_document(uid, &identifier).await {
                Ok(doc) => doc,
                // Not yet indexed: fall back to a full refetch-and-add
                // (spec.md §4.5 update row, "If missing... fall back").
                Err(_) => {
                    let fetched = source.find_one(id_filter(&id), read_name).await?;
                    let projected = index_config.projection.apply(fetched);
                    let task = dest.add_documents(uid, vec![projected]).await?;
                    dest.wait_for_task(task).await?;
                    return Ok(());
                },
            };

            for (key, value) in updated_fields {
                if doc.contains_key(&key) {
                    doc.insert(key, value);
                }
            }
            for field in removed_fields {
                if doc.contains_key(&field) {
                    doc.remove(&field);
                }
            }

            let task = dest
                .update_documents(uid, vec![doc], Some(&index_config.primary_key))
                .await?;
            dest.wait_for_task(task).await?;
        },
        ChangeEvent::Replace { id, full_document } => {
            let doc = if has_view {
                source.find_one(id_filter(&id), read_name).await?
            } else {
                full_document
            };
            let doc = index_config.projection.apply(doc);
            let task = dest
                .update_documents(uid, vec![doc], Some(&index_config.primary_key))
                .await?;
            dest.wait_for_task(task).await?;
        },
        ChangeEvent::Delete { id } => {
            let task = dest.delete_document(uid, &id.to_identifier_string()).await?;
            dest.wait_for_task(task).await?;
        },
    }
    Ok(())
}

fn id_filter(id: &Value) -> Document {
    let mut doc = Document::new();
    doc.insert("_id", id.clone());
    doc
}
