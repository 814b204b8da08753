//! Process-wide mapping from engine kind to a long-lived adapter instance
//! (spec.md §4.8). Threaded as an `Arc<EngineRegistry>` rather than a
//! package-level global — see DESIGN.md for the Open Question this resolves.

use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

use meilibridge_config::Engine;
use tokio::sync::RwLock;

/// Thread-safe map from [`Engine`] to a type-erased adapter instance.
/// Readers request by generic type via [`EngineRegistry::get`], matching
/// the original's `database.GetEngine[T](kind)` call shape.
#[derive(Default)]
pub struct EngineRegistry {
    inner: RwLock<HashMap<Engine, Arc<dyn Any + Send + Sync>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the adapter instance for `engine`. Called once during
    /// bridge bootstrap; overwriting an existing entry is allowed since
    /// multiple bridges sharing an engine kind register the same instance.
    pub async fn insert<T: Any + Send + Sync>(&self, engine: Engine, adapter: Arc<T>) {
        self.inner.write().await.insert(engine, adapter);
    }

    /// Fetches the adapter registered for `engine`, downcast to `T`.
    /// Returns `None` if nothing was registered, or if it was registered
    /// under a different concrete type.
    pub async fn get<T: Any + Send + Sync>(&self, engine: Engine) -> Option<Arc<T>> {
        let guard = self.inner.read().await;
        let entry = guard.get(&engine)?;
        entry.clone().downcast::<T>().ok()
    }

    /// Closes every registered adapter's connection. Lifecycle: created
    /// during bridge bootstrap, closed at process exit (spec.md §4.8).
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}
