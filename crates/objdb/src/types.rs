//! Core types shared by the backends, the lock and the service registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::keys;

/// Backend-issued session (Consul session ID, etcd lease ID in decimal).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a backend session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One key as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Full key, always starting with `/`.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Session the key is bound to, if any.
    pub session: Option<SessionId>,
    /// Backend index of the last modification.
    pub mod_index: u64,
}

impl KvPair {
    /// Value as UTF-8, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    /// Key created or updated.
    Put,
    /// Key deleted or expired.
    Delete,
}

/// One index-ordered change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    /// New value (empty for deletes).
    pub value: Vec<u8>,
    /// Value before the change, when the backend or cursor knows it.
    pub prev_value: Option<Vec<u8>>,
    /// Session bound to the key after the change.
    pub session: Option<SessionId>,
    /// Backend index at which the change happened.
    pub index: u64,
}

/// Resume point of a long-poll watch, plus the last observed pair per key.
///
/// The cursor lets backends without a native event log (Consul blocking
/// queries, or etcd after a compaction) derive the same event stream by
/// diffing a fresh listing against what the watcher already saw.
#[derive(Debug, Clone, Default)]
pub struct WatchCursor {
    index: u64,
    known: BTreeMap<String, KvPair>,
}

impl WatchCursor {
    /// Cursor seeded from a listing taken at `index`.
    pub fn from_snapshot(pairs: Vec<KvPair>, index: u64) -> Self {
        let known = pairs.into_iter().map(|p| (p.key.clone(), p)).collect();
        Self { index, known }
    }

    /// Last index the watcher has seen.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Moves the resume point forward; never backwards.
    pub fn advance(&mut self, index: u64) {
        self.index = self.index.max(index);
    }

    /// Last observed pair for `key`.
    pub fn get(&self, key: &str) -> Option<&KvPair> {
        self.known.get(key)
    }

    /// Number of keys currently known.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True if no keys are known.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Applies one event and fills in `prev_value` from the cache when the
    /// backend did not supply it.
    pub fn apply(&mut self, event: &mut KvEvent) {
        match event.kind {
            KvEventKind::Put => {
                let prev = self.known.insert(
                    event.key.clone(),
                    KvPair {
                        key: event.key.clone(),
                        value: event.value.clone(),
                        session: event.session.clone(),
                        mod_index: event.index,
                    },
                );
                if event.prev_value.is_none() {
                    event.prev_value = prev.map(|p| p.value);
                }
            }
            KvEventKind::Delete => {
                let prev = self.known.remove(&event.key);
                if event.prev_value.is_none() {
                    event.prev_value = prev.map(|p| p.value);
                }
            }
        }
        self.advance(event.index);
    }

    /// Replaces the known state with a fresh listing taken at `index` and
    /// returns the changes between the two, ordered by index. `index`
    /// becomes the resume point even if it is lower than the current one.
    pub fn resync(&mut self, pairs: Vec<KvPair>, index: u64) -> Vec<KvEvent> {
        let mut fresh: BTreeMap<String, KvPair> =
            pairs.into_iter().map(|p| (p.key.clone(), p)).collect();
        let mut events = Vec::new();

        for (key, old) in &self.known {
            if !fresh.contains_key(key) {
                events.push(KvEvent {
                    kind: KvEventKind::Delete,
                    key: key.clone(),
                    value: Vec::new(),
                    prev_value: Some(old.value.clone()),
                    session: None,
                    index,
                });
            }
        }
        for (key, new) in &fresh {
            let changed = match self.known.get(key) {
                None => true,
                Some(old) => {
                    old.mod_index != new.mod_index
                        || old.value != new.value
                        || old.session != new.session
                }
            };
            if changed {
                events.push(KvEvent {
                    kind: KvEventKind::Put,
                    key: key.clone(),
                    value: new.value.clone(),
                    prev_value: self.known.get(key).map(|p| p.value.clone()),
                    session: new.session.clone(),
                    index: new.mod_index,
                });
            }
        }
        events.sort_by_key(|e| e.index);

        std::mem::swap(&mut self.known, &mut fresh);
        self.index = index;
        events
    }
}

/// Identity and liveness settings of one service instance.
///
/// Field names on the wire match what existing cluster members write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInfo {
    pub service_name: String,
    /// Registration TTL in seconds.
    #[serde(rename = "TTL")]
    pub ttl: u64,
    pub host_addr: String,
    pub port: u16,
    #[serde(default)]
    pub hostname: String,
}

impl ServiceInfo {
    /// Creates a service description with an empty hostname.
    pub fn new(
        service_name: impl Into<String>,
        host_addr: impl Into<String>,
        port: u16,
        ttl: u64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            ttl,
            host_addr: host_addr.into(),
            port,
            hostname: String::new(),
        }
    }

    /// Sets the hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Store key of this instance.
    pub fn key(&self) -> String {
        keys::service_key(&self.service_name, &self.host_addr, self.port)
    }

    /// TTL as a duration.
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// Kind of service watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Add,
    Del,
    Error,
}

/// Notification delivered to a service watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchServiceEvent {
    pub event_type: WatchEventType,
    /// The instance concerned. For `Error` events only `service_name` is set.
    pub service_info: ServiceInfo,
}

/// Notification delivered to a lock subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    Released,
    AcquireTimeout,
    AcquireError,
    RefreshError,
    Lost,
}

/// Client-side state of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Created, or live but not holding the key.
    Idle,
    /// Session created, waiting to claim the key.
    Acquiring,
    /// Holding the key.
    Acquired,
    /// Released by the caller or by the acquire timeout. Terminal.
    Released,
    /// Background tasks stopped without backend cleanup. Terminal.
    Killed,
}

impl LockState {
    /// True for `Released` and `Killed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, LockState::Released | LockState::Killed)
    }
}
