//! Plugin registry: maps backend names to plugins and hands out clients.
//!
//! The registry is an explicit object built once at process start and
//! passed to whoever needs a store handle. It is the only place that
//! selects a backend by name; it also remembers the first backend it
//! initialised and refuses to initialise a different one afterwards.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::adapter::StoreAdapter;
use crate::backend::{ConsulPlugin, EtcdPlugin};
use crate::client::ObjdbClient;
use crate::config::{ObjdbConfig, DEFAULT_STORE_URL};
use crate::error::{ObjdbError, Result};

/// Factory for one backend's adapter.
#[async_trait]
pub trait StorePlugin: Send + Sync {
    /// Backend name, as used in store URLs.
    fn name(&self) -> &str;

    /// Endpoint used when none is given.
    fn default_endpoint(&self) -> &str;

    /// Connects to the backend. Fails if the cluster cannot be reached;
    /// there is no lazy retry at this point.
    async fn init(&self, endpoints: &[String], config: &ObjdbConfig)
        -> Result<Arc<dyn StoreAdapter>>;
}

/// Parsed `<plugin>://<host>:<port>` store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrl {
    pub plugin: String,
    pub host: String,
    pub port: u16,
}

impl StoreUrl {
    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.plugin, self.host, self.port)
    }
}

/// Parses a store URL such as `etcd://127.0.0.1:2379` or
/// `consul://10.0.0.5:8500`.
pub fn parse_store_url(url: &str) -> Result<StoreUrl> {
    let (plugin, rest) = url
        .split_once("://")
        .ok_or_else(|| ObjdbError::invalid_url(url, "expected <plugin>://<host>:<port>"))?;
    if plugin.is_empty() {
        return Err(ObjdbError::invalid_url(url, "missing plugin name"));
    }
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| ObjdbError::invalid_url(url, "missing port"))?;
    if host.is_empty() || host.contains('/') {
        return Err(ObjdbError::invalid_url(url, "invalid host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ObjdbError::invalid_url(url, format!("invalid port '{}'", port)))?;

    Ok(StoreUrl {
        plugin: plugin.to_string(),
        host: host.to_string(),
        port,
    })
}

/// Registry of store plugins.
pub struct PluginRegistry {
    plugins: Mutex<HashMap<String, Arc<dyn StorePlugin>>>,
    selected: Mutex<Option<String>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            selected: Mutex::new(None),
        }
    }

    /// Registry with the etcd and Consul plugins registered.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_plugin(Arc::new(EtcdPlugin));
        registry.register_plugin(Arc::new(ConsulPlugin));
        registry
    }

    /// Registers a plugin under its own name. The last registration for a
    /// name wins.
    pub fn register_plugin(&self, plugin: Arc<dyn StorePlugin>) {
        let name = plugin.name().to_string();
        info!(plugin = %name, "Registered objdb plugin");
        self.plugins.lock().insert(name, plugin);
    }

    /// Looks up a plugin by name.
    pub fn get_plugin(&self, name: &str) -> Result<Arc<dyn StorePlugin>> {
        self.plugins
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ObjdbError::UnknownPlugin {
                name: name.to_string(),
            })
    }

    /// Names of all registered plugins, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Backend this registry has initialised, if any.
    pub fn selected(&self) -> Option<String> {
        self.selected.lock().clone()
    }

    /// Initialises the named backend against `endpoints` (the plugin's
    /// default endpoint when empty) and returns a client over it.
    #[instrument(skip(self, config))]
    pub async fn init_client(
        &self,
        plugin_name: &str,
        endpoints: &[String],
        config: &ObjdbConfig,
    ) -> Result<ObjdbClient> {
        let plugin = self.get_plugin(plugin_name)?;
        self.check_selection(plugin_name)?;

        let endpoints = if endpoints.is_empty() {
            vec![plugin.default_endpoint().to_string()]
        } else {
            endpoints.to_vec()
        };

        let adapter = plugin.init(&endpoints, config).await?;
        self.select(plugin_name)?;
        info!(plugin = plugin_name, ?endpoints, "Connected to cluster store");
        Ok(ObjdbClient::new(adapter, config))
    }

    /// Creates a client from a store URL. An empty URL selects the default
    /// backend at its default address.
    pub async fn new_client(&self, url: &str, config: &ObjdbConfig) -> Result<ObjdbClient> {
        let url = if url.is_empty() { DEFAULT_STORE_URL } else { url };
        let parsed = parse_store_url(url)?;
        self.init_client(&parsed.plugin, &[parsed.endpoint()], config)
            .await
    }

    fn check_selection(&self, plugin_name: &str) -> Result<()> {
        match self.selected.lock().as_deref() {
            Some(current) if current != plugin_name => {
                Err(backend_mismatch(current, plugin_name))
            }
            _ => Ok(()),
        }
    }

    fn select(&self, plugin_name: &str) -> Result<()> {
        let mut selected = self.selected.lock();
        if let Some(current) = selected.as_deref() {
            if current != plugin_name {
                return Err(backend_mismatch(current, plugin_name));
            }
        }
        *selected = Some(plugin_name.to_string());
        Ok(())
    }
}

fn backend_mismatch(current: &str, requested: &str) -> ObjdbError {
    ObjdbError::Config(format!(
        "backend '{}' already selected, cannot switch to '{}'",
        current, requested
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryPlugin;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_valid_urls() {
        assert_eq!(
            parse_store_url("etcd://127.0.0.1:2379").unwrap(),
            StoreUrl {
                plugin: "etcd".to_string(),
                host: "127.0.0.1".to_string(),
                port: 2379,
            }
        );
        let consul = parse_store_url("consul://localhost:8500").unwrap();
        assert_eq!(consul.plugin, "consul");
        assert_eq!(consul.endpoint(), "localhost:8500");
        assert_eq!(consul.to_string(), "consul://localhost:8500");
    }

    #[test]
    fn test_parse_invalid_urls() {
        for url in [
            "invalid",
            "etcd:/localhost:2379",
            "etcd://localhost",
            "etcd://:2379",
            "etcd://localhost:port",
            "://localhost:2379",
        ] {
            let err = parse_store_url(url).unwrap_err();
            assert!(err.is_fatal(), "{} should be rejected", url);
        }
    }

    #[test]
    fn test_builtin_plugins() {
        let registry = PluginRegistry::with_builtin();
        assert_eq!(registry.plugin_names(), vec!["consul", "etcd"]);
        assert!(registry.get_plugin("etcd").is_ok());
        assert!(matches!(
            registry.get_plugin("zookeeper"),
            Err(ObjdbError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn test_register_last_writer_wins() {
        let registry = PluginRegistry::new();
        let first = MemoryPlugin::new();
        let second = MemoryPlugin::new();
        registry.register_plugin(Arc::new(first));
        registry.register_plugin(Arc::new(second));
        assert_eq!(registry.plugin_names(), vec!["memory"]);
    }

    #[tokio::test]
    async fn test_unknown_plugin_url() {
        let registry = PluginRegistry::with_builtin();
        let result = registry
            .new_client("invalid://127.0.0.1:2379", &ObjdbConfig::default())
            .await;
        assert!(matches!(result, Err(ObjdbError::UnknownPlugin { .. })));
        assert_eq!(registry.selected(), None);
    }

    #[tokio::test]
    async fn test_one_backend_per_registry() {
        let registry = PluginRegistry::with_builtin();
        registry.register_plugin(Arc::new(MemoryPlugin::new()));
        let config = ObjdbConfig::default();

        registry
            .new_client("memory://local:1", &config)
            .await
            .unwrap();
        registry.init_client("memory", &[], &config).await.unwrap();
        assert_eq!(registry.selected().as_deref(), Some("memory"));

        let err = registry
            .init_client("consul", &[], &config)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
