//! The per-bridge sync abstraction (spec.md §9 design note): a document
//! store participates in bulk, change-stream, and trigger modes; a
//! relational source is bulk-only and never joins change capture, per
//! [`meilibridge_config::Engine::supports_change_stream`].

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

use crate::{
    bulk::{
        self,
        BulkEvent,
    },
    change_stream,
    trigger::TriggerRegistration,
};

/// One configured bridge's connected adapters, ready to drive any of the
/// three sync modes spec.md §4 describes.
pub struct Syncer {
    pub bridge_name: String,
    pub source: Arc<dyn SourceAdapter>,
    pub dest: Arc<dyn DestinationAdapter>,
    pub index_map: BTreeMap<CollectionRef, IndexConfig>,
    pub supports_change_stream: bool,
}

impl Syncer {
    /// Runs one bulk pass across every configured (collection, index) pair.
    pub async fn run_bulk(
        &self,
        continue_mode: bool,
        cancel: CancellationToken,
        events: mpsc::Sender<BulkEvent>,
    ) {
        bulk::run_bulk(
            self.source.clone(),
            self.dest.clone(),
            &self.index_map,
            continue_mode,
            cancel,
            events,
        )
        .await;
    }

    /// Launches one change-stream worker per (collection, index) pair and
    /// waits for all of them. A no-op for engines that don't support change
    /// capture (spec.md §1).
    pub async fn run_change_stream(&self, cancel: CancellationToken) {
        if !self.supports_change_stream {
            tracing::info!(bridge = %self.bridge_name, "engine does not support change capture, skipping");
            return;
        }

        let mut workers = Vec::with_capacity(self.index_map.len());
        for (collection_ref, index_config) in self.index_map.clone() {
            let source = self.source.clone();
            let dest = self.dest.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(change_stream::run_change_stream(
                source,
                dest,
                collection_ref,
                index_config,
                cancel,
            )));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// One [`TriggerRegistration`] per (collection, index) pair. Trigger
    /// point-updates only need `FindOne`/upsert, which the relational sketch
    /// exposes too, so registrations aren't gated the way change capture is.
    pub fn trigger_registrations(&self) -> Vec<TriggerRegistration> {
        self.index_map
            .iter()
            .map(|(collection_ref, index_config)| TriggerRegistration {
                bridge: self.bridge_name.clone(),
                index_uid: index_config.index_name.clone(),
                collection_ref: collection_ref.clone(),
                index_config: index_config.clone(),
                source: self.source.clone(),
                dest: self.dest.clone(),
            })
            .collect()
    }
}
