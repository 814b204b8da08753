//! The trigger pipeline (spec.md §4.6): an HTTP intake that validates and
//! enqueues point-update requests, and one queue worker per bridge that
//! drains them against the source/destination adapters.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{
        Path,
        State,
    },
    http::{
        HeaderMap,
        StatusCode,
    },
    response::IntoResponse,
    routing::{
        get,
        post,
    },
    Router,
};
use meilibridge_config::IndexConfig;
use meilibridge_dest::DestinationAdapter;
use meilibridge_source::SourceAdapter;
use meilibridge_types::{
    CollectionRef,
    Document,
    TriggerOp,
    TriggerRequest,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REQUEUE_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
/// Unbuffered per spec.md §4.6/§5: a capacity-1 channel caps intake to
/// worker throughput, so an HTTP handler blocks on handoff rather than the
/// queue growing unboundedly.
const QUEUE_CAPACITY: usize = 1;
/// Resolves spec.md §9 Open Question (b): requeuing is not unbounded. After
/// this many attempts a request is dead-lettered with a fatal-level log
/// instead of retried forever.
const MAX_TRIGGER_ATTEMPTS: u32 = 10;

/// A queued trigger request plus how many times it has already been
/// attempted, so `queue_worker` can enforce [`MAX_TRIGGER_ATTEMPTS`].
struct QueueItem {
    request: TriggerRequest,
    attempts: u32,
}

/// One (bridge, index_uid) registration the trigger HTTP server accepts
/// requests for.
pub struct TriggerRegistration {
    pub bridge: String,
    pub index_uid: String,
    pub collection_ref: CollectionRef,
    pub index_config: IndexConfig,
    pub source: Arc<dyn SourceAdapter>,
    pub dest: Arc<dyn DestinationAdapter>,
}

type TriggerTarget = (CollectionRef, IndexConfig, Arc<dyn SourceAdapter>, Arc<dyn DestinationAdapter>);

struct BridgeContext {
    targets: BTreeMap<String, TriggerTarget>,
    queue_tx: mpsc::Sender<QueueItem>,
}

#[derive(Clone)]
struct AppState {
    bridges: Arc<BTreeMap<String, Arc<BridgeContext>>>,
    token: Option<String>,
}

/// Boots the trigger HTTP listener and per-bridge queue workers, and runs
/// until `cancel` fires, at which point the server drains via graceful
/// shutdown and the queues stop being read from (spec.md §4.6 "Shutdown").
pub async fn run_trigger_server(
    listen: &str,
    token: Option<String>,
    registrations: Vec<TriggerRegistration>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut by_bridge: BTreeMap<String, Vec<TriggerRegistration>> = BTreeMap::new();
    for reg in registrations {
        by_bridge.entry(reg.bridge.clone()).or_default().push(reg);
    }

    let mut router = Router::new().route("/ping", get(ping));
    let mut bridges = BTreeMap::new();

    for (bridge, regs) in by_bridge {
        let mut targets = BTreeMap::new();
        for reg in regs {
            router = router.route(
                &format!("/{}/{}", bridge, reg.index_uid),
                post(handle_trigger),
            );
            targets.insert(reg.index_uid, (reg.collection_ref, reg.index_config, reg.source, reg.dest));
        }

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let ctx = Arc::new(BridgeContext {
            targets,
            queue_tx: queue_tx.clone(),
        });
        tokio::spawn(queue_worker(ctx.clone(), queue_rx, queue_tx, cancel.clone()));
        bridges.insert(bridge, ctx);
    }

    let state = AppState {
        bridges: Arc::new(bridges),
        token,
    };
    let router = router.with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn handle_trigger(
    State(state): State<AppState>,
    Path((bridge, index_uid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(expected) = &state.token {
        let provided = headers.get("x-token-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }

    let request: TriggerRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid body").into_response(),
    };

    if let Err(err) = request.validate() {
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }

    if request.index_uid != index_uid {
        return (StatusCode::BAD_REQUEST, "index_uid does not match path").into_response();
    }

    let Some(bridge_ctx) = state.bridges.get(&bridge) else {
        return (StatusCode::NOT_FOUND, "unknown bridge").into_response();
    };

    if bridge_ctx
        .queue_tx
        .send(QueueItem { request, attempts: 0 })
        .await
        .is_err()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "queue closed").into_response();
    }

    StatusCode::ACCEPTED.into_response()
}

enum ProcessOutcome {
    Done,
    /// Transient error after the index-existence check: requeue after 5s
    /// (spec.md §4.6 "Retry"). Invalid `index_uid` is non-retryable and
    /// reported as [`ProcessOutcome::Done`].
    Requeue,
}

async fn process_item(bridge_ctx: &BridgeContext, request: &TriggerRequest) -> ProcessOutcome {
    let Some((collection_ref, index_config, source, dest)) = bridge_ctx.targets.get(&request.index_uid) else {
        tracing::error!(index_uid = %request.index_uid, "invalid index_uid, dropping trigger request");
        return ProcessOutcome::Done;
    };

    if !dest.index_exists(&index_config.index_name).await {
        if let Err(err) = dest
            .recreate(&index_config.index_name, &index_config.primary_key, index_config.settings.as_ref())
            .await
        {
            tracing::error!(error = %err, "failed to recreate index for trigger");
            return ProcessOutcome::Requeue;
        }
    }

    let (query_value, identifier) = coerce_primary_value(&request.document.primary_value);
    let mut filter = Document::new();
    filter.insert(request.document.primary_key.clone(), query_value);

    let result = match request.r#type {
        TriggerOp::Insert | TriggerOp::Update => {
            match source.find_one(filter, collection_ref.read_name()).await {
                Ok(doc) => {
                    let doc = index_config.projection.apply(doc);
                    match dest
                        .update_documents(&index_config.index_name, vec![doc], Some(&index_config.primary_key))
                        .await
                    {
                        Ok(task) => dest.wait_for_task(task).await,
                        Err(err) => Err(err),
                    }
                },
                Err(err) => {
                    tracing::error!(error = %err, "trigger source lookup failed");
                    return ProcessOutcome::Requeue;
                },
            }
        },
        TriggerOp::Delete => match dest.delete_document(&index_config.index_name, &identifier).await {
            Ok(task) => dest.wait_for_task(task).await,
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(()) => ProcessOutcome::Done,
        Err(err) => {
            tracing::error!(error = %err, "trigger destination operation failed");
            ProcessOutcome::Requeue
        },
    }
}

/// Document-store primary values arrive as hex object-id strings; everything
/// else round-trips as-is. The identifier used for deletes is always kept
/// as a plain string (spec.md §4.6).
fn coerce_primary_value(value: &serde_json::Value) -> (meilibridge_types::Value, String) {
    use meilibridge_types::Value;

    if let serde_json::Value::String(s) = value {
        if let Ok(oid) = bson::oid::ObjectId::parse_str(s) {
            return (Value::ObjectId(oid), s.clone());
        }
        return (Value::String(s.clone()), s.clone());
    }

    let value = Value::from(value.clone());
    let identifier = value.to_identifier_string();
    (value, identifier)
}

/// The per-bridge queue worker (spec.md §4.6 "Queue worker"): one
/// cooperative consumer that processes items and requeues transient
/// failures after a 5s delay by re-sending into its own channel.
async fn queue_worker(
    bridge_ctx: Arc<BridgeContext>,
    mut queue_rx: mpsc::Receiver<QueueItem>,
    queue_tx: mpsc::Sender<QueueItem>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            item = queue_rx.recv() => {
                let Some(item) = item else { return };
                if matches!(process_item(&bridge_ctx, &item.request).await, ProcessOutcome::Requeue) {
                    let attempts = item.attempts + 1;
                    if attempts >= MAX_TRIGGER_ATTEMPTS {
                        tracing::error!(
                            index_uid = %item.request.index_uid,
                            attempts,
                            "trigger request exceeded max attempts, dead-lettering"
                        );
                        continue;
                    }
                    let queue_tx = queue_tx.clone();
                    let request = item.request;
                    tokio::spawn(async move {
                        tokio::time::sleep(REQUEUE_DELAY).await;
                        let _ = queue_tx.send(QueueItem { request, attempts }).await;
                    });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use meilibridge_types::{
        Pk,
        Projection,
        TriggerDocument,
        Value,
    };

    use super::*;
    use crate::test_support::{
        FakeDest,
        FakeSource,
    };

    fn request(op: TriggerOp, index_uid: &str, primary_value: serde_json::Value) -> TriggerRequest {
        TriggerRequest {
            index_uid: index_uid.to_string(),
            r#type: op,
            document: TriggerDocument { primary_key: "_id".to_string(), primary_value },
        }
    }

    fn bridge_ctx(
        index_uid: &str,
        source: Arc<dyn SourceAdapter>,
        dest: Arc<dyn DestinationAdapter>,
    ) -> (Arc<BridgeContext>, mpsc::Receiver<QueueItem>) {
        let index_config = IndexConfig {
            index_name: index_uid.to_string(),
            primary_key: Pk::from("_id"),
            projection: Projection::identity(),
            settings: None,
        };
        let mut targets = BTreeMap::new();
        targets.insert(index_uid.to_string(), (CollectionRef::parse("items"), index_config, source, dest));
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        (Arc::new(BridgeContext { targets, queue_tx }), queue_rx)
    }

    #[test]
    fn coerces_hex_object_id_strings_but_leaves_other_strings_alone() {
        let oid = bson::oid::ObjectId::new();
        let (value, identifier) = coerce_primary_value(&serde_json::json!(oid.to_hex()));
        assert_eq!(value, Value::ObjectId(oid));
        assert_eq!(identifier, oid.to_hex());

        let (value, identifier) = coerce_primary_value(&serde_json::json!("not-an-oid"));
        assert_eq!(value, Value::String("not-an-oid".to_string()));
        assert_eq!(identifier, "not-an-oid");
    }

    #[tokio::test]
    async fn insert_trigger_upserts_the_looked_up_document() {
        let source = Arc::new(FakeSource::new());
        let mut doc = Document::new();
        doc.insert("_id", Value::String("1".to_string()));
        doc.insert("name", Value::String("a".to_string()));
        source.seed("items", vec![doc]);
        let dest = Arc::new(FakeDest::new());
        dest.create_index("items_idx", &Pk::from("_id")).await.unwrap();

        let (ctx, _queue_rx) = bridge_ctx("items_idx", source, dest.clone());
        let req = request(TriggerOp::Insert, "items_idx", serde_json::json!("1"));
        assert!(matches!(process_item(&ctx, &req).await, ProcessOutcome::Done));
        assert_eq!(dest.doc_count("items_idx"), 1);
    }

    #[tokio::test]
    async fn delete_trigger_removes_the_document() {
        let source: Arc<dyn SourceAdapter> = Arc::new(FakeSource::new());
        let dest = Arc::new(FakeDest::new());
        dest.create_index("items_idx", &Pk::from("_id")).await.unwrap();
        let mut doc = Document::new();
        doc.insert("_id", Value::String("1".to_string()));
        dest.add_documents("items_idx", vec![doc]).await.unwrap();

        let (ctx, _queue_rx) = bridge_ctx("items_idx", source, dest.clone());
        let req = request(TriggerOp::Delete, "items_idx", serde_json::json!("1"));
        assert!(matches!(process_item(&ctx, &req).await, ProcessOutcome::Done));
        assert_eq!(dest.get("items_idx", "1"), None);
    }

    #[tokio::test]
    async fn unknown_index_uid_is_dropped_without_touching_the_destination() {
        let source: Arc<dyn SourceAdapter> = Arc::new(FakeSource::new());
        let dest = Arc::new(FakeDest::new());
        let (ctx, _queue_rx) = bridge_ctx("items_idx", source, dest.clone());

        let req = request(TriggerOp::Delete, "other_idx", serde_json::json!("1"));
        assert!(matches!(process_item(&ctx, &req).await, ProcessOutcome::Done));
        assert!(!dest.index_exists("other_idx").await);
    }

    #[tokio::test]
    async fn valid_trigger_request_is_accepted_and_enqueued() {
        let source: Arc<dyn SourceAdapter> = Arc::new(FakeSource::new());
        let dest: Arc<dyn DestinationAdapter> = Arc::new(FakeDest::new());
        let (ctx, mut queue_rx) = bridge_ctx("items_idx", source, dest);

        let mut bridges = BTreeMap::new();
        bridges.insert("shop".to_string(), ctx);
        let state = AppState { bridges: Arc::new(bridges), token: Some("secret".to_string()) };

        let mut headers = HeaderMap::new();
        headers.insert("x-token-key", HeaderValue::from_static("secret"));
        let body = Bytes::from(
            serde_json::to_vec(&request(TriggerOp::Insert, "items_idx", serde_json::json!("1"))).unwrap(),
        );

        let response = handle_trigger(
            State(state),
            Path(("shop".to_string(), "items_idx".to_string())),
            headers,
            body,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(queue_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn trigger_request_with_wrong_token_is_rejected_without_enqueueing() {
        // Scenario 6: an invalid token yields 401 and no side effect.
        let source: Arc<dyn SourceAdapter> = Arc::new(FakeSource::new());
        let dest: Arc<dyn DestinationAdapter> = Arc::new(FakeDest::new());
        let (ctx, mut queue_rx) = bridge_ctx("items_idx", source, dest);

        let mut bridges = BTreeMap::new();
        bridges.insert("shop".to_string(), ctx);
        let state = AppState { bridges: Arc::new(bridges), token: Some("secret".to_string()) };

        let mut headers = HeaderMap::new();
        headers.insert("x-token-key", HeaderValue::from_static("wrong"));
        let body = Bytes::from(
            serde_json::to_vec(&request(TriggerOp::Insert, "items_idx", serde_json::json!("1"))).unwrap(),
        );

        let response = handle_trigger(
            State(state),
            Path(("shop".to_string(), "items_idx".to_string())),
            headers,
            body,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue_rx.try_recv().is_err());
    }
}
