//! In-process store implementing the full adapter contract.
//!
//! Keeps a revisioned key map, TTL sessions that delete their keys on
//! expiry, and a bounded change history for watches. Expired sessions are
//! reaped lazily on every call and by sleeping watchers, so no background
//! task is needed. Used by tests and by single-node setups.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::adapter::StoreAdapter;
use crate::config::ObjdbConfig;
use crate::error::{ObjdbError, Result};
use crate::plugin::StorePlugin;
use crate::types::{KvEvent, KvEventKind, KvPair, SessionId, WatchCursor};

/// Backend name of the in-memory store.
pub const MEMORY_PLUGIN: &str = "memory";

/// Number of changes kept for watchers before older ones are dropped.
const HISTORY_LIMIT: usize = 1024;

/// Operation counters, for asserting on side effects in tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub sessions_created: u64,
    pub renew_session_calls: u64,
    pub destroy_session_calls: u64,
    pub acquire_key_calls: u64,
    pub release_key_calls: u64,
}

#[derive(Debug)]
struct SessionEntry {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    index: u64,
    entries: BTreeMap<String, KvPair>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: u64,
    history: VecDeque<KvEvent>,
    /// Highest index dropped from `history`.
    compacted: u64,
    stats: MemoryStats,
}

impl MemoryState {
    fn record(&mut self, mut event: KvEvent) {
        event.index = self.index;
        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.index;
            }
        }
    }

    fn set(&mut self, key: &str, value: &[u8], session: Option<SessionId>) {
        self.index += 1;
        let pair = KvPair {
            key: key.to_string(),
            value: value.to_vec(),
            session: session.clone(),
            mod_index: self.index,
        };
        let prev = self.entries.insert(key.to_string(), pair);
        self.record(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_string(),
            value: value.to_vec(),
            prev_value: prev.map(|p| p.value),
            session,
            index: 0,
        });
    }

    fn remove(&mut self, key: &str) {
        if let Some(prev) = self.entries.remove(key) {
            self.index += 1;
            self.record(KvEvent {
                kind: KvEventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                prev_value: Some(prev.value),
                session: None,
                index: 0,
            });
        }
    }

    fn drop_session(&mut self, session: &SessionId) -> bool {
        if self.sessions.remove(session).is_none() {
            return false;
        }
        let bound: Vec<String> = self
            .entries
            .values()
            .filter(|p| p.session.as_ref() == Some(session))
            .map(|p| p.key.clone())
            .collect();
        for key in bound {
            self.remove(&key);
        }
        true
    }

    fn reap(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            debug!(session = %id, "Memory session expired");
            self.drop_session(&id);
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.expires_at).min()
    }

    fn ensure_session(&self, session: &SessionId) -> Result<()> {
        if self.sessions.contains_key(session) {
            Ok(())
        } else {
            Err(ObjdbError::session_expired(session.as_str()))
        }
    }

    fn list(&self, prefix: &str) -> Vec<KvPair> {
        self.entries
            .values()
            .filter(|p| p.key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn events_since(&self, prefix: &str, cursor: &mut WatchCursor) -> Vec<KvEvent> {
        if cursor.index() < self.compacted {
            return cursor.resync(self.list(prefix), self.index);
        }
        let from = cursor.index();
        let mut events = Vec::new();
        for event in self
            .history
            .iter()
            .filter(|e| e.index > from && e.key.starts_with(prefix))
        {
            let mut event = event.clone();
            cursor.apply(&mut event);
            events.push(event);
        }
        cursor.advance(self.index);
        events
    }
}

/// Shared in-memory cluster store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    changed: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            changed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every subsequent call fail with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let mut state = self.state.lock();
        state.reap(Instant::now());
        state.sessions.len()
    }

    /// Expires a session immediately, as if its TTL had lapsed.
    pub fn expire_session(&self, session: &SessionId) {
        let dropped = self.state.lock().drop_session(session);
        if dropped {
            self.changed.notify_waiters();
        }
    }

    /// Drops the whole change history, forcing watchers to resync.
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.compacted = state.index;
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ObjdbError::unavailable(MEMORY_PLUGIN, "store marked unavailable"))
        }
    }

    /// Runs `f` under the state lock after reaping expired sessions, waking
    /// watchers if anything changed.
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        self.check_available()?;
        let mut state = self.state.lock();
        let before = state.index;
        state.reap(Instant::now());
        let result = f(&mut state);
        let changed = state.index != before;
        drop(state);
        if changed {
            self.changed.notify_waiters();
        }
        result
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &str {
        MEMORY_PLUGIN
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        self.with_state(|state| {
            state
                .entries
                .get(key)
                .cloned()
                .ok_or_else(|| ObjdbError::not_found(key))
        })
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_state(|state| {
            state.set(key, value, None);
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_state(|state| {
            state.remove(key);
            Ok(())
        })
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64)> {
        self.with_state(|state| Ok((state.list(prefix), state.index)))
    }

    async fn watch(
        &self,
        prefix: &str,
        cursor: &mut WatchCursor,
        wait: Duration,
    ) -> Result<Vec<KvEvent>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            let (events, next_expiry) = self.with_state(|state| {
                Ok((state.events_since(prefix, cursor), state.next_expiry()))
            })?;
            if !events.is_empty() || Instant::now() >= deadline {
                return Ok(events);
            }
            let wake = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        self.with_state(|state| {
            state.next_session += 1;
            state.stats.sessions_created += 1;
            let id = SessionId::new(format!("memory-{}", state.next_session));
            state.sessions.insert(
                id.clone(),
                SessionEntry {
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(id)
        })
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        self.with_state(|state| {
            state.stats.renew_session_calls += 1;
            match state.sessions.get_mut(session) {
                Some(entry) => {
                    entry.expires_at = Instant::now() + entry.ttl;
                    Ok(())
                }
                None => Err(ObjdbError::session_expired(session.as_str())),
            }
        })
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        self.with_state(|state| {
            state.stats.destroy_session_calls += 1;
            state.drop_session(session);
            Ok(())
        })
    }

    async fn acquire_key(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        self.with_state(|state| {
            state.stats.acquire_key_calls += 1;
            state.ensure_session(session)?;
            let claimable = match state.entries.get(key) {
                None => true,
                Some(pair) => pair.session.is_none() || pair.session.as_ref() == Some(session),
            };
            if claimable {
                state.set(key, value, Some(session.clone()));
            }
            Ok(claimable)
        })
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<()> {
        self.with_state(|state| {
            state.stats.release_key_calls += 1;
            let held = state
                .entries
                .get(key)
                .is_some_and(|p| p.session.as_ref() == Some(session));
            if held {
                state.remove(key);
            }
            Ok(())
        })
    }

    async fn put_with_session(&self, key: &str, value: &[u8], session: &SessionId) -> Result<()> {
        self.with_state(|state| {
            state.ensure_session(session)?;
            state.set(key, value, Some(session.clone()));
            Ok(())
        })
    }
}

/// Plugin handing out one shared [`MemoryStore`] to every client, so that
/// several clients in one process see the same cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlugin {
    store: Arc<MemoryStore>,
}

impl MemoryPlugin {
    /// Plugin over a fresh store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin over an existing store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// The shared store.
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl StorePlugin for MemoryPlugin {
    fn name(&self) -> &str {
        MEMORY_PLUGIN
    }

    fn default_endpoint(&self) -> &str {
        "memory"
    }

    async fn init(
        &self,
        _endpoints: &[String],
        _config: &ObjdbConfig,
    ) -> Result<Arc<dyn StoreAdapter>> {
        self.store.check_available()?;
        Ok(self.store.clone())
    }
}
