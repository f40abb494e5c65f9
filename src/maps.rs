//! User-visible shared maps
//!
//! `GlobalMap`, per-channel `GlobalChannelMap` and the `ConfigurationMap`,
//! layered over a [`MapBackend`](crate::cluster::MapBackend) as
//! write-through caches. Reads are synchronous from the in-process cache;
//! writes update the cache immediately and replicate to the backend in the
//! background, last-write-wins. The configuration map re-reads the backend
//! periodically so edits made on other nodes propagate.

use crate::cluster::{CONFIGURATION_SCOPE, GLOBAL_SCOPE, MapBackend, channel_scope};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One scope of the shared map, cached in process
pub struct SharedMap {
    scope: String,
    backend: Arc<dyn MapBackend>,
    cache: DashMap<String, Value>,
}

impl SharedMap {
    pub fn new(scope: impl Into<String>, backend: Arc<dyn MapBackend>) -> Self {
        Self {
            scope: scope.into(),
            backend,
            cache: DashMap::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Synchronous read from the write-through cache
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|v| v.clone())
    }

    /// Write to the cache now, replicate to the backend in the background
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.cache.insert(key.clone(), value.clone());

        let backend = self.backend.clone();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            let serialized = value.to_string();
            if let Err(e) = backend.set(&scope, &key, &serialized).await {
                warn!(scope = %scope, key = %key, error = %e, "map replication failed");
            }
        });
    }

    pub fn remove(&self, key: &str) {
        self.cache.remove(key);
        let backend = self.backend.clone();
        let scope = self.scope.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = backend.delete(&scope, &key).await {
                warn!(scope = %scope, key = %key, error = %e, "map delete replication failed");
            }
        });
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Replace the cache with the backend's current contents
    pub async fn refresh(&self) -> crate::error::Result<()> {
        let stored = self.backend.get_all(&self.scope).await?;
        self.cache.clear();
        for (key, raw) in stored {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            self.cache.insert(key, value);
        }
        Ok(())
    }
}

/// Registry of the engine-wide shared maps
pub struct GlobalMaps {
    backend: Arc<dyn MapBackend>,
    global: Arc<SharedMap>,
    configuration: Arc<SharedMap>,
    channels: DashMap<String, Arc<SharedMap>>,
}

impl GlobalMaps {
    pub fn new(backend: Arc<dyn MapBackend>) -> Self {
        Self {
            global: Arc::new(SharedMap::new(GLOBAL_SCOPE, backend.clone())),
            configuration: Arc::new(SharedMap::new(CONFIGURATION_SCOPE, backend.clone())),
            channels: DashMap::new(),
            backend,
        }
    }

    pub fn global(&self) -> Arc<SharedMap> {
        self.global.clone()
    }

    pub fn configuration(&self) -> Arc<SharedMap> {
        self.configuration.clone()
    }

    pub fn global_channel_map(&self, channel_id: &str) -> Arc<SharedMap> {
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(SharedMap::new(channel_scope(channel_id), self.backend.clone()))
            })
            .clone()
    }

    /// Warm the global and configuration caches from the backend
    pub async fn load(&self) -> crate::error::Result<()> {
        self.global.refresh().await?;
        self.configuration.refresh().await?;
        Ok(())
    }

    /// Periodically re-read the configuration map so changes made by other
    /// nodes become visible without a restart
    pub fn spawn_configuration_refresh(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let configuration = self.configuration.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(e) = configuration.refresh().await {
                    warn!(error = %e, "configuration map refresh failed");
                } else {
                    debug!("configuration map refreshed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryMapBackend;
    use serde_json::json;

    #[tokio::test]
    async fn writes_are_visible_immediately_and_replicated() {
        let backend = Arc::new(InMemoryMapBackend::new());
        let maps = GlobalMaps::new(backend.clone());

        let global = maps.global();
        global.put("siteId", json!("HOSP-A"));
        assert_eq!(global.get("siteId"), Some(json!("HOSP-A")));

        // background replication lands in the backend
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = backend.get(GLOBAL_SCOPE, "siteId").await.unwrap();
        assert_eq!(stored, Some("\"HOSP-A\"".to_string()));
    }

    #[tokio::test]
    async fn channel_maps_are_scoped() {
        let backend = Arc::new(InMemoryMapBackend::new());
        let maps = GlobalMaps::new(backend);
        maps.global_channel_map("c1").put("k", json!(1));
        maps.global_channel_map("c2").put("k", json!(2));
        assert_eq!(maps.global_channel_map("c1").get("k"), Some(json!(1)));
        assert_eq!(maps.global_channel_map("c2").get("k"), Some(json!(2)));
    }

    #[tokio::test]
    async fn refresh_pulls_backend_changes() {
        let backend = Arc::new(InMemoryMapBackend::new());
        let maps = GlobalMaps::new(backend.clone());

        // another node writes directly to the backend
        backend
            .set(CONFIGURATION_SCOPE, "timeout", "\"30\"")
            .await
            .unwrap();
        assert_eq!(maps.configuration().get("timeout"), None);

        maps.configuration().refresh().await.unwrap();
        assert_eq!(maps.configuration().get("timeout"), Some(json!("30")));
    }
}
