use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use meilibridge_config::IndexSettings;
use meilibridge_types::{
    Document,
    Pk,
    TaskHandle,
    TaskStatus,
};
use meilisearch_sdk::{
    client::Client,
    task_info::TaskInfo,
    tasks::Task,
};
use tokio::time::sleep;

use crate::{
    DestinationAdapter,
    DestinationError,
    IndexStats,
    Stats,
};

const WAIT_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The Meilisearch destination adapter (spec.md §4.2), grounded on the
/// original's `meilisearch` wrapper: one client, a cached health flag
/// refreshed by a background prober, and a recursive `WaitForTask` poll
/// loop built on the same 5s interval throughout (task polling, health
/// probing, connect retry, trigger requeue).
pub struct MeiliDestination {
    client: Client,
    healthy: Arc<AtomicBool>,
    _prober: tokio::task::JoinHandle<()>,
}

impl MeiliDestination {
    /// Connects and blocks until the destination reports healthy,
    /// retrying every 5s (spec.md §4.2 "Initial connect retries every 5s
    /// until healthy or context canceled").
    pub async fn connect(
        api_url: &str,
        api_key: Option<&str>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<Self, DestinationError> {
        let client = Client::new(api_url, api_key)?;

        loop {
            if client.health().await.is_ok() {
                break;
            }
            tracing::error!("meilisearch is unhealthy, trying to reconnect...");
            tokio::select! {
                _ = sleep(WAIT_INTERVAL) => {},
                _ = cancel.cancelled() => return Err(DestinationError::Unhealthy),
            }
        }

        let healthy = Arc::new(AtomicBool::new(true));
        let prober = tokio::spawn(health_prober(client.clone(), healthy.clone(), cancel));

        Ok(Self {
            client,
            healthy,
            _prober: prober,
        })
    }

    fn check_healthy(&self) -> Result<(), DestinationError> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(DestinationError::Unhealthy)
        }
    }

    fn index(&self, uid: &str) -> meilisearch_sdk::indexes::Index {
        self.client.index(uid)
    }

    async fn resolve_task(&self, info: TaskInfo) -> Result<TaskHandle, DestinationError> {
        Ok(TaskHandle { uid: info.task_uid })
    }
}

#[async_trait]
impl DestinationAdapter for MeiliDestination {
    async fn index_exists(&self, uid: &str) -> bool {
        self.client.get_index(uid).await.is_ok()
    }

    async fn create_index(&self, uid: &str, pk: &Pk) -> Result<TaskHandle, DestinationError> {
        self.check_healthy()?;
        let info = self.client.create_index(uid, Some(pk.as_str())).await?;
        self.resolve_task(info).await
    }

    async fn delete_index(&self, uid: &str) -> Result<TaskHandle, DestinationError> {
        self.check_healthy()?;
        let info = self.index(uid).delete_index().await?;
        self.resolve_task(info).await
    }

    async fn update_index_settings(
        &self,
        uid: &str,
        settings: &IndexSettings,
    ) -> Result<(), DestinationError> {
        self.check_healthy()?;
        let index = self
            .client
            .get_index(uid)
            .await
            .map_err(|_| DestinationError::IndexNotFound(uid.to_string()))?;

        // §4.2 settings update: reset, wait, then encode+apply, wait.
        let reset = index.reset_settings().await?;
        self.wait_for_task(self.resolve_task(reset).await?).await?;

        let encoded = serde_json::to_value(settings)?.to_string();
        let sdk_settings: meilisearch_sdk::settings::Settings =
            serde_json::from_str(&encoded)?;

        let apply = index.set_settings(&sdk_settings).await?;
        self.wait_for_task(self.resolve_task(apply).await?).await
    }

    async fn add_documents(
        &self,
        uid: &str,
        docs: Vec<Document>,
    ) -> Result<TaskHandle, DestinationError> {
        self.check_healthy()?;
        let payload: Vec<serde_json::Value> = docs.into_iter().map(Document::into).collect();
        let info = self.index(uid).add_documents(&payload, None).await?;
        self.resolve_task(info).await
    }

    async fn update_documents(
        &self,
        uid: &str,
        docs: Vec<Document>,
        pk: Option<&Pk>,
    ) -> Result<TaskHandle, DestinationError> {
        self.check_healthy()?;
        let payload: Vec<serde_json::Value> = docs.into_iter().map(Document::into).collect();
        let info = self
            .index(uid)
            .add_or_update(&payload, pk.map(Pk::as_str))
            .await?;
        self.resolve_task(info).await
    }

    async fn get_document(&self, uid: &str, id: &str) -> Result<Document, DestinationError> {
        self.check_healthy()?;
        let value: serde_json::Value = self.index(uid).get_document(id).await?;
        Ok(Document::from(value))
    }

    async fn delete_document(&self, uid: &str, id: &str) -> Result<TaskHandle, DestinationError> {
        self.check_healthy()?;
        let info = self.index(uid).delete_document(id).await?;
        self.resolve_task(info).await
    }

    /// Recursive poll loop per spec.md §4.2: `enqueued`/`processing`
    /// re-enter the wait, resolving only on a terminal status.
    async fn wait_for_task(&self, task: TaskHandle) -> Result<(), DestinationError> {
        let resolved = self
            .client
            .wait_for_task(task.uid, Some(WAIT_INTERVAL), None)
            .await?;
        match task_status(&resolved) {
            TaskStatus::Succeeded => Ok(()),
            TaskStatus::Enqueued | TaskStatus::Processing => {
                Box::pin(self.wait_for_task(task)).await
            },
            TaskStatus::Canceled => Err(DestinationError::TaskCanceled(task.uid)),
            TaskStatus::Failed(message) => Err(DestinationError::TaskFailed {
                uid: task.uid,
                index_uid: index_uid_of(&resolved),
                message,
            }),
            TaskStatus::Unknown => Err(DestinationError::TaskUnknown(task.uid)),
        }
    }

    async fn stats(&self) -> Option<Stats> {
        if !self.healthy.load(Ordering::Relaxed) {
            tracing::warn!("meilisearch is unhealthy");
            return None;
        }
        let stats = self.client.get_stats().await.ok()?;
        Some(Stats {
            indexes: stats
                .indexes
                .into_iter()
                .map(|(uid, stat)| {
                    (
                        uid,
                        IndexStats {
                            number_of_documents: stat.number_of_documents as i64,
                            is_indexing: stat.is_indexing,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn index_stats(&self, uid: &str) -> Option<IndexStats> {
        if !self.healthy.load(Ordering::Relaxed) {
            return None;
        }
        let stats = self.index(uid).get_stats().await.ok()?;
        Some(IndexStats {
            number_of_documents: stats.number_of_documents as i64,
            is_indexing: stats.is_indexing,
        })
    }

    async fn version(&self) -> Option<String> {
        if !self.healthy.load(Ordering::Relaxed) {
            tracing::warn!("meilisearch is unhealthy");
            return None;
        }
        self.client.get_version().await.ok().map(|v| v.pkg_version)
    }

    async fn close(&self) -> Result<(), DestinationError> {
        self._prober.abort();
        Ok(())
    }
}

async fn health_prober(
    client: Client,
    healthy: Arc<AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = sleep(HEALTH_POLL_INTERVAL) => {
                healthy.store(client.health().await.is_ok(), Ordering::Relaxed);
            },
            _ = cancel.cancelled() => return,
        }
    }
}

fn task_status(task: &Task) -> TaskStatus {
    match task {
        Task::Enqueued { .. } => TaskStatus::Enqueued,
        Task::Processing { .. } => TaskStatus::Processing,
        Task::Succeeded { .. } => TaskStatus::Succeeded,
        Task::Failed { content } => TaskStatus::Failed(content.error.error_message.clone()),
    }
}

fn index_uid_of(task: &Task) -> String {
    match task {
        Task::Enqueued { content } => content.index_uid.clone().unwrap_or_default(),
        Task::Processing { content } => content.index_uid.clone().unwrap_or_default(),
        Task::Succeeded { content } => content.index_uid.clone(),
        Task::Failed { content } => content.index_uid.clone().unwrap_or_default(),
    }
}
