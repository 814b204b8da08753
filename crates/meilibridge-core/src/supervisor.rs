//! The bridge supervisor (spec.md §4, §4.7): connects a [`Syncer`] per
//! configured bridge, registers source adapters into the process-wide
//! [`EngineRegistry`], and drives whichever of bulk/realtime/trigger mode
//! the caller asked for, rendering bulk progress the way the original did.

use std::sync::Arc;

use indicatif::{
    MultiProgress,
    ProgressBar,
    ProgressStyle,
};
use meilibridge_config::{
    Bridge,
    Config,
    Database,
    Engine,
};
use meilibridge_dest::MeiliDestination;
use meilibridge_source::{
    MongoSource,
    RelationalSource,
    SourceAdapter,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bulk::BulkEvent,
    engine_registry::EngineRegistry,
    syncer::Syncer,
    trigger::{
        self,
        TriggerRegistration,
    },
};

/// Builds the MongoDB connection URI the driver expects from a bridge's
/// connection fields (spec.md §6).
fn mongo_uri(database: &Database) -> String {
    let mut uri = String::from("mongodb://");
    if let Some(user) = &database.user {
        uri.push_str(user);
        if let Some(password) = &database.password {
            uri.push(':');
            uri.push_str(password);
        }
        uri.push('@');
    }
    uri.push_str(&format!("{}:{}", database.host, database.port));
    uri.push('/');
    if !database.custom_params.is_empty() {
        let params: Vec<String> = database
            .custom_params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        uri.push('?');
        uri.push_str(&params.join("&"));
    }
    uri
}

/// Connects every adapter a bridge needs, registers the source adapter in
/// `registry` keyed by its engine, and returns a [`Syncer`] ready to run any
/// sync mode. Relational engines get [`RelationalSource`], a named sketch
/// with no concrete SQL client (spec.md §1).
pub async fn build_syncer(
    bridge: &Bridge,
    registry: &EngineRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<Syncer> {
    let source: Arc<dyn SourceAdapter> = match bridge.database.engine {
        Engine::Mongo => {
            let uri = mongo_uri(&bridge.database);
            let mongo = Arc::new(MongoSource::connect(&uri, &bridge.database.database).await?);
            registry.insert(bridge.database.engine, mongo.clone()).await;
            mongo
        },
        Engine::Mysql => {
            let relational = Arc::new(RelationalSource::new("mysql"));
            registry.insert(bridge.database.engine, relational.clone()).await;
            relational
        },
        Engine::Postgres => {
            let relational = Arc::new(RelationalSource::new("postgres"));
            registry.insert(bridge.database.engine, relational.clone()).await;
            relational
        },
    };

    let dest = Arc::new(
        MeiliDestination::connect(
            &bridge.meilisearch_api_url,
            bridge.meilisearch_api_key.as_deref(),
            cancel,
        )
        .await?,
    );

    Ok(Syncer {
        bridge_name: bridge.name.clone(),
        source,
        dest,
        index_map: bridge.index_map.clone(),
        supports_change_stream: bridge.database.engine.supports_change_stream(),
    })
}

async fn build_syncers(config: &Config, registry: &EngineRegistry, cancel: CancellationToken) -> anyhow::Result<Vec<Syncer>> {
    let mut syncers = Vec::with_capacity(config.bridges.len());
    for bridge in &config.bridges {
        syncers.push(build_syncer(bridge, registry, cancel.clone()).await?);
    }
    Ok(syncers)
}

/// `meilibridge sync bulk`: runs one bulk pass per bridge concurrently,
/// rendering a 50-cell progress bar per (collection, index) pair (mirrors
/// the original's `progressBar` helper), then returns. With `auto`, repeats
/// every `general.auto_bulk_interval` seconds until `cancel` fires.
pub async fn run_bulk_sync(
    config: &Config,
    continue_mode: bool,
    auto: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let registry = EngineRegistry::new();
    let syncers = build_syncers(config, &registry, cancel.clone()).await?;

    loop {
        run_bulk_once(&syncers, continue_mode, cancel.clone()).await?;

        if !auto || cancel.is_cancelled() {
            break;
        }

        let interval = std::time::Duration::from_secs(config.general.auto_bulk_interval_secs as u64);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = cancel.cancelled() => break,
        }
    }
    registry.clear().await;
    Ok(())
}

/// Runs one bulk pass to completion. The first worker error is logged and
/// then surfaced as `Err`, so the caller terminates the process with a
/// non-zero exit code rather than continuing silently (spec.md §4.7 "on
/// error logs and exits the process", §7 "terminates the process", mirroring
/// the original's `statCh` consumer calling `log.Fatal` on the first error).
async fn run_bulk_once(syncers: &[Syncer], continue_mode: bool, cancel: CancellationToken) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{msg}")
        .expect("static progress-bar template is valid");

    let reporter = tokio::spawn(async move {
        let mut bars = std::collections::HashMap::new();
        let mut first_error = None;
        while let Some(event) = rx.recv().await {
            match event {
                BulkEvent::Progress(stat) => {
                    let bar = bars
                        .entry((stat.collection.clone(), stat.index.clone()))
                        .or_insert_with(|| {
                            let bar = multi.add(ProgressBar::new(stat.total.max(1) as u64));
                            bar.set_style(style.clone());
                            bar
                        });
                    bar.set_message(render_progress_bar(stat.indexed, stat.total, &stat.collection, &stat.index));
                },
                BulkEvent::Error { collection, index, message } => {
                    tracing::error!(collection = %collection, index = %index, error = %message, "bulk worker failed");
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!(
                            "bulk sync failed for {collection} -> {index}: {message}"
                        ));
                    }
                },
            }
        }
        for bar in bars.into_values() {
            bar.finish();
        }
        first_error
    });

    let mut workers = Vec::with_capacity(syncers.len());
    for syncer in syncers {
        let cancel = cancel.clone();
        let events = tx.clone();
        workers.push(syncer.run_bulk(continue_mode, cancel, events));
    }
    futures::future::join_all(workers).await;

    drop(tx);
    if let Some(err) = reporter.await? {
        return Err(err);
    }
    Ok(())
}

/// Renders the same 50-cell ASCII bar as the original's `progressBar`
/// helper: `{percent}% [{bar}] ({indexed}/{total}) {collection} -> {index}`.
fn render_progress_bar(indexed: i64, total: i64, collection: &str, index: &str) -> String {
    const BAR_LENGTH: usize = 50;
    let percentage = if total > 0 { indexed as f64 / total as f64 * 100.0 } else { 0.0 };
    let filled = ((BAR_LENGTH as f64) * percentage / 100.0) as usize;
    let filled = filled.min(BAR_LENGTH);
    let bar = "=".repeat(filled) + &" ".repeat(BAR_LENGTH - filled);
    format!("{percentage:.0}% [{bar}] ({indexed}/{total}) {collection} -> {index}")
}

/// `meilibridge sync start`: runs the change-stream pipeline for every
/// bridge concurrently until `cancel` fires.
pub async fn run_sync(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let registry = EngineRegistry::new();
    let syncers = build_syncers(config, &registry, cancel.clone()).await?;

    let mut workers = Vec::with_capacity(syncers.len());
    for syncer in syncers {
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move { syncer.run_change_stream(cancel).await }));
    }
    for worker in workers {
        let _ = worker.await;
    }

    registry.clear().await;
    Ok(())
}

/// `meilibridge sync trigger`: boots the HTTP trigger server for every
/// bridge that configures one, sharing a single listener and `EngineRegistry`.
pub async fn run_trigger_sync(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let Some(trigger_cfg) = &config.general.trigger_sync else {
        anyhow::bail!("general.trigger_sync is not configured");
    };

    let registry = EngineRegistry::new();
    let syncers = build_syncers(config, &registry, cancel.clone()).await?;

    let registrations: Vec<TriggerRegistration> =
        syncers.iter().flat_map(Syncer::trigger_registrations).collect();

    trigger::run_trigger_server(&trigger_cfg.listen, trigger_cfg.token.clone(), registrations, cancel).await?;

    registry.clear().await;
    Ok(())
}
