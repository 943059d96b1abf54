//! Backend adapters: etcd, Consul and an in-process store.

pub mod consul;
pub mod etcd;
pub mod memory;

pub use consul::{ConsulPlugin, ConsulStore, CONSUL_PLUGIN};
pub use etcd::{EtcdPlugin, EtcdStore, ETCD_PLUGIN};
pub use memory::{MemoryPlugin, MemoryStats, MemoryStore, MEMORY_PLUGIN};
