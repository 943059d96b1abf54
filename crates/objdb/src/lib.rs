//! Cluster store coordination layer.
//!
//! Hides etcd and Consul behind one [`StoreAdapter`] and builds on it:
//!
//! - [`PluginRegistry`]: selects and initialises the backend, hands out
//!   [`ObjdbClient`] handles
//! - [`ObjStore`]: JSON objects under `/contiv.io/obj/`
//! - [`DistributedLock`]: lease-based mutual exclusion with event
//!   notification
//! - [`ServiceRegistry`]: TTL-refreshed service registrations and watches
//!
//! ```no_run
//! use contiv_objdb::{ObjdbConfig, PluginRegistry};
//! use std::time::Duration;
//!
//! # async fn run() -> contiv_objdb::Result<()> {
//! let config = ObjdbConfig::default();
//! let client = PluginRegistry::with_builtin()
//!     .new_client("etcd://127.0.0.1:2379", &config)
//!     .await?;
//!
//! client.set_obj("nets/blue", &serde_json::json!({"vlan": 100})).await?;
//!
//! let lock = client.new_lock("netmaster/leader", "10.0.0.1", Duration::from_secs(10));
//! let mut events = lock.subscribe();
//! lock.acquire(Duration::ZERO).await?;
//! # let _ = events.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod plugin;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

pub use adapter::StoreAdapter;
pub use backend::{ConsulPlugin, EtcdPlugin, MemoryPlugin, MemoryStore};
pub use client::ObjdbClient;
pub use config::ObjdbConfig;
pub use error::{ObjdbError, Result};
pub use lock::DistributedLock;
pub use plugin::{parse_store_url, PluginRegistry, StorePlugin, StoreUrl};
pub use retry::RetryPolicy;
pub use service::ServiceRegistry;
pub use store::ObjStore;
pub use types::{
    KvEvent, KvEventKind, KvPair, LockEvent, LockState, ServiceInfo, SessionId, WatchCursor,
    WatchEventType, WatchServiceEvent,
};
