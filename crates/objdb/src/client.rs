//! Store handle returned by the plugin registry.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::StoreAdapter;
use crate::config::{ObjdbConfig, WatchConfig};
use crate::error::Result;
use crate::lock::DistributedLock;
use crate::retry::RetryPolicy;
use crate::service::ServiceRegistry;
use crate::store::ObjStore;
use crate::types::{ServiceInfo, WatchServiceEvent};

/// Entry point to one cluster store: objects, locks and services.
///
/// Cheap to clone; clones share the backend connection and the set of
/// registered services.
#[derive(Clone)]
pub struct ObjdbClient {
    adapter: Arc<dyn StoreAdapter>,
    objects: ObjStore,
    services: ServiceRegistry,
    watch: WatchConfig,
}

impl std::fmt::Debug for ObjdbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjdbClient")
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

impl ObjdbClient {
    /// Client over an initialised adapter.
    pub fn new(adapter: Arc<dyn StoreAdapter>, config: &ObjdbConfig) -> Self {
        Self {
            objects: ObjStore::new(adapter.clone(), RetryPolicy::from(&config.retry)),
            services: ServiceRegistry::new(adapter.clone(), config.watch.clone()),
            watch: config.watch.clone(),
            adapter,
        }
    }

    /// Underlying adapter.
    pub fn adapter(&self) -> Arc<dyn StoreAdapter> {
        self.adapter.clone()
    }

    /// Backend name.
    pub fn backend_name(&self) -> &str {
        self.adapter.name()
    }

    /// Object store facade.
    pub fn objects(&self) -> &ObjStore {
        &self.objects
    }

    /// Service registry.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub async fn get_obj<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.objects.get_obj(key).await
    }

    pub async fn set_obj<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.objects.set_obj(key, value).await
    }

    pub async fn del_obj(&self, key: &str) -> Result<()> {
        self.objects.del_obj(key).await
    }

    pub async fn list_dir(&self, prefix: &str) -> Result<Vec<String>> {
        self.objects.list_dir(prefix).await
    }

    pub async fn list_dir_values(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        self.objects.list_dir_values(prefix).await
    }

    /// New lock object for `name`, claimed as `holder_id`. Nothing happens
    /// on the backend until it is acquired.
    pub fn new_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> DistributedLock {
        DistributedLock::new(
            self.adapter.clone(),
            name,
            holder_id,
            ttl,
            self.watch.clone(),
        )
    }

    pub async fn register_service(&self, info: ServiceInfo) -> Result<()> {
        self.services.register_service(info).await
    }

    pub async fn deregister_service(&self, info: &ServiceInfo) -> Result<()> {
        self.services.deregister_service(info).await
    }

    pub async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>> {
        self.services.get_service(service_name).await
    }

    pub async fn watch_service(
        &self,
        service_name: &str,
        events: mpsc::Sender<WatchServiceEvent>,
        stop: CancellationToken,
    ) -> Result<()> {
        self.services.watch_service(service_name, events, stop).await
    }
}
