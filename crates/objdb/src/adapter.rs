//! Backend adapter contract.
//!
//! One implementation exists per cluster store. Everything above this trait
//! (object store facade, locks, service registry) is backend-agnostic; the
//! only place that looks at a backend name is the plugin registry.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{KvEvent, KvPair, SessionId, WatchCursor};

/// Capability set every cluster store backend provides.
///
/// Implementations must be safe for concurrent use: one adapter is shared by
/// every lock, registration and watch in the process.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Reads one key. Fails with `NotFound` when the key is absent or has no
    /// value.
    async fn get(&self, key: &str) -> Result<KvPair>;

    /// Writes one key with no session attached.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deletes one key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists every key starting with `prefix`, in key order, together with
    /// the backend index the listing reflects.
    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64)>;

    /// Long-polls for changes under `prefix` past `cursor.index()`.
    ///
    /// Returns the index-ordered changes and advances the cursor, or returns
    /// an empty list once `wait` elapses without a change.
    async fn watch(
        &self,
        prefix: &str,
        cursor: &mut WatchCursor,
        wait: Duration,
    ) -> Result<Vec<KvEvent>>;

    /// Creates a session with delete-on-expire behaviour.
    async fn create_session(&self, ttl: Duration) -> Result<SessionId>;

    /// Renews a session once. Fails with `SessionExpired` when the backend
    /// no longer knows the session.
    async fn renew_session(&self, session: &SessionId) -> Result<()>;

    /// Destroys a session; keys bound to it are deleted by the backend.
    async fn destroy_session(&self, session: &SessionId) -> Result<()>;

    /// Cadence at which sessions of the given TTL should be renewed.
    fn renew_interval(&self, ttl: Duration) -> Duration {
        (ttl / 3).max(Duration::from_millis(100))
    }

    /// Atomically claims `key` for `session`. Succeeds only if the key is
    /// unclaimed or already claimed by the same session.
    async fn acquire_key(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool>;

    /// Gives up a claim taken with [`acquire_key`](Self::acquire_key). No-op
    /// when the key is held by another session or absent.
    async fn release_key(&self, key: &str, session: &SessionId) -> Result<()>;

    /// Unconditionally writes `key` bound to `session`, so it disappears
    /// when the session expires.
    async fn put_with_session(&self, key: &str, value: &[u8], session: &SessionId) -> Result<()>;
}
