//! Distributed lock over backend sessions.
//!
//! Mutual exclusion rests on the adapter's atomic claim-if-unclaimed
//! primitive. The client side only decides when to attempt a claim and how
//! to react to what the watch reports. A live lock runs up to three tasks:
//! session renewal, watch-and-acquire, and an optional acquire timeout.
//! All of them stop on a shared cancellation token that `release` and
//! `kill` may cancel any number of times.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::StoreAdapter;
use crate::config::WatchConfig;
use crate::error::{ObjdbError, Result};
use crate::keys;
use crate::types::{KvEvent, KvPair, LockEvent, LockState, SessionId, WatchCursor};

/// Capacity of a lock's event queue.
const EVENT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug)]
struct LockInner {
    state: LockState,
    session: Option<SessionId>,
    started: bool,
}

/// What the watch loop should do after looking at the key.
enum Next {
    /// Block on the watch until the key changes.
    Watch,
    /// Something transient failed; try again after the backoff.
    Backoff,
}

struct LockShared {
    name: String,
    key: String,
    holder_id: String,
    ttl: Duration,
    adapter: Arc<dyn StoreAdapter>,
    watch: WatchConfig,
    inner: Mutex<LockInner>,
    events: broadcast::Sender<LockEvent>,
    first_rx: Mutex<Option<broadcast::Receiver<LockEvent>>>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

/// A named lock contended for by holders across the cluster.
///
/// Handles are cheap to clone and share one state. Dropping the last
/// handle stops the background tasks without touching the backend key,
/// like [`kill`](Self::kill).
#[derive(Clone)]
pub struct DistributedLock {
    shared: Arc<LockShared>,
    _guard: Arc<DropGuard>,
}

impl DistributedLock {
    /// Creates a lock object. No backend I/O happens until
    /// [`acquire`](Self::acquire).
    pub fn new(
        adapter: Arc<dyn StoreAdapter>,
        name: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
        watch: WatchConfig,
    ) -> Self {
        let name = name.into();
        let (events, first_rx) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let guard = stop.clone().drop_guard();

        let shared = LockShared {
            key: keys::lock_key(&name),
            name,
            holder_id: holder_id.into(),
            ttl,
            adapter,
            watch,
            inner: Mutex::new(LockInner {
                state: LockState::Idle,
                session: None,
                started: false,
            }),
            events,
            first_rx: Mutex::new(Some(first_rx)),
            stop,
            tasks: TaskTracker::new(),
        };
        Self {
            shared: Arc::new(shared),
            _guard: Arc::new(guard),
        }
    }

    /// Starts contending for the lock.
    ///
    /// Creates a session and returns once it exists; the claim itself
    /// happens in the background and is reported as [`LockEvent::Acquired`].
    /// With a non-zero `timeout`, a lock still not held after that long
    /// emits [`LockEvent::AcquireTimeout`] and releases itself. A zero
    /// timeout waits forever.
    #[instrument(skip(self), fields(lock = %self.shared.name, holder = %self.shared.holder_id))]
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.lock();
            if inner.state.is_terminal() {
                return Err(ObjdbError::LockReleased {
                    name: shared.name.clone(),
                });
            }
            if inner.started {
                return Err(ObjdbError::LockActive {
                    name: shared.name.clone(),
                });
            }
            inner.started = true;
            inner.state = LockState::Acquiring;
        }

        let session = match shared.adapter.create_session(shared.ttl).await {
            Ok(session) => session,
            Err(e) => {
                error!(lock = %shared.name, error = %e, "Failed to create lock session");
                {
                    let mut inner = shared.inner.lock();
                    if !inner.state.is_terminal() {
                        inner.state = LockState::Idle;
                        inner.started = false;
                    }
                }
                shared.emit(LockEvent::AcquireError);
                return Err(e);
            }
        };

        let released = {
            let mut inner = shared.inner.lock();
            if inner.state.is_terminal() {
                true
            } else {
                inner.session = Some(session.clone());
                false
            }
        };
        if released {
            shared.discard_session(&session).await;
            return Err(ObjdbError::LockReleased {
                name: shared.name.clone(),
            });
        }
        debug!(lock = %shared.name, session = %session, "Lock session created");

        shared.tasks.spawn(renew_loop(shared.clone()));
        shared.tasks.spawn(watch_loop(shared.clone()));
        if !timeout.is_zero() {
            shared.tasks.spawn(timeout_task(shared.clone(), timeout));
        }
        Ok(())
    }

    /// Stops contending and gives up the lock if held. Safe to call any
    /// number of times, from any task; only the first call has effect.
    pub async fn release(&self) {
        self.shared.release().await;
    }

    /// Stops the background tasks without releasing the backend key, which
    /// is then reclaimed when the session TTL lapses. Meant for fault
    /// injection.
    pub fn kill(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = LockState::Killed;
        }
        warn!(lock = %shared.name, holder = %shared.holder_id, "Killing lock without release");
        shared.stop.cancel();
        shared.tasks.close();
    }

    /// Receiver of this lock's events. The first subscriber also gets the
    /// events emitted before it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.shared
            .first_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.shared.events.subscribe())
    }

    /// True while this holder owns the lock.
    pub fn is_acquired(&self) -> bool {
        self.shared.inner.lock().state == LockState::Acquired
    }

    /// Current client-side state.
    pub fn state(&self) -> LockState {
        self.shared.inner.lock().state
    }

    /// True once the stop signal has fired.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Waits for every background task to finish after `release` or `kill`.
    pub async fn wait_stopped(&self) {
        self.shared.stop.cancelled().await;
        self.shared.tasks.wait().await;
    }

    /// Current holder as stored in the backend, or an empty string when
    /// the lock is free or the read fails. Diagnostic only.
    pub async fn get_holder(&self) -> String {
        match self.shared.adapter.get(&self.shared.key).await {
            Ok(pair) if pair.session.is_some() => pair.value_str(),
            Ok(_) => String::new(),
            Err(e) => {
                if !e.is_not_found() {
                    debug!(lock = %self.shared.name, error = %e, "Failed to read lock holder");
                }
                String::new()
            }
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Backend key of the lock.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Holder ID this handle claims the lock with.
    pub fn holder_id(&self) -> &str {
        &self.shared.holder_id
    }

    /// Session TTL.
    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Current session, if live.
    pub fn session(&self) -> Option<SessionId> {
        self.shared.inner.lock().session.clone()
    }
}

impl LockShared {
    fn emit(&self, event: LockEvent) {
        debug!(lock = %self.name, ?event, "Lock event");
        // No receivers only means nobody listens.
        let _ = self.events.send(event);
    }

    fn current_session(&self) -> Option<SessionId> {
        let inner = self.inner.lock();
        if inner.state.is_terminal() {
            None
        } else {
            inner.session.clone()
        }
    }

    /// Runs `fut` unless the stop signal fires first.
    async fn until_stopped<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.stop.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Sleeps for `delay`; false if stopped meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        self.until_stopped(tokio::time::sleep(delay)).await.is_some()
    }

    async fn discard_session(&self, session: &SessionId) {
        if let Err(e) = self.adapter.destroy_session(session).await {
            debug!(lock = %self.name, session = %session, error = %e, "Failed to destroy session");
        }
    }

    async fn release(&self) {
        let (was_acquired, session) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let was_acquired = inner.state == LockState::Acquired;
            inner.state = LockState::Released;
            (was_acquired, inner.session.take())
        };
        self.stop.cancel();
        self.tasks.close();

        if was_acquired {
            info!(lock = %self.name, holder = %self.holder_id, "Released distributed lock");
            self.emit(LockEvent::Released);
            if let Some(session) = &session {
                if let Err(e) = self.adapter.release_key(&self.key, session).await {
                    warn!(
                        lock = %self.name,
                        error = %e,
                        "Failed to release lock key, leaving it to the session TTL"
                    );
                }
            }
        } else {
            debug!(lock = %self.name, "Lock stopped before it was acquired");
        }
        if let Some(session) = session {
            self.discard_session(&session).await;
        }
    }

    fn mark_acquired(&self, session: &SessionId) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal()
                || inner.state == LockState::Acquired
                || inner.session.as_ref() != Some(session)
            {
                return;
            }
            inner.state = LockState::Acquired;
        }
        info!(
            lock = %self.name,
            holder = %self.holder_id,
            session = %session,
            "Acquired distributed lock"
        );
        self.emit(LockEvent::Acquired);
    }

    fn mark_lost(&self, current: Option<&KvPair>) {
        {
            let mut inner = self.inner.lock();
            if inner.state != LockState::Acquired {
                return;
            }
            inner.state = LockState::Idle;
        }
        let holder = current.map(KvPair::value_str).unwrap_or_default();
        warn!(lock = %self.name, holder = %self.holder_id, new_holder = %holder, "Lost distributed lock");
        self.emit(LockEvent::Lost);
    }

    /// Decides what to do given the key's current value.
    async fn evaluate(&self, current: Option<KvPair>) -> Option<Next> {
        let session = self.current_session()?;
        let held = current.as_ref().filter(|p| p.session.is_some());

        match held {
            Some(pair)
                if pair.session.as_ref() == Some(&session)
                    && pair.value == self.holder_id.as_bytes() =>
            {
                self.mark_acquired(&session);
                Some(Next::Watch)
            }
            Some(pair) => {
                self.mark_lost(Some(pair));
                Some(Next::Watch)
            }
            None => {
                self.mark_lost(None);
                let claim = self
                    .adapter
                    .acquire_key(&self.key, self.holder_id.as_bytes(), &session);
                match self.until_stopped(claim).await? {
                    Ok(true) => {
                        self.mark_acquired(&session);
                        Some(Next::Watch)
                    }
                    Ok(false) => {
                        debug!(lock = %self.name, "Lost acquire race, watching");
                        Some(Next::Watch)
                    }
                    Err(e) => {
                        debug!(lock = %self.name, error = %e, "Acquire attempt failed");
                        Some(Next::Backoff)
                    }
                }
            }
        }
    }
}

/// Keeps the lock's session alive, replacing it if the backend drops it.
async fn renew_loop(shared: Arc<LockShared>) {
    let interval = shared.adapter.renew_interval(shared.ttl);
    loop {
        if !shared.pause(interval).await {
            return;
        }
        let Some(session) = shared.current_session() else {
            return;
        };
        let Some(result) = shared
            .until_stopped(shared.adapter.renew_session(&session))
            .await
        else {
            return;
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                debug!(lock = %shared.name, error = %e, "Session renewal failed, retrying");
            }
            Err(e) => {
                warn!(lock = %shared.name, session = %session, error = %e, "Lock session lost, recreating");
                match shared.adapter.create_session(shared.ttl).await {
                    Ok(fresh) => {
                        let replaced = {
                            let mut inner = shared.inner.lock();
                            if inner.state.is_terminal() {
                                false
                            } else {
                                inner.session = Some(fresh.clone());
                                true
                            }
                        };
                        if !replaced {
                            shared.discard_session(&fresh).await;
                            return;
                        }
                        debug!(lock = %shared.name, session = %fresh, "Lock session recreated");
                    }
                    Err(e) => {
                        error!(lock = %shared.name, error = %e, "Failed to recreate lock session");
                        shared.emit(LockEvent::RefreshError);
                    }
                }
            }
        }
    }
}

/// Whether a watch result calls for another look at `key`. Backends watch
/// by prefix, so changes under sibling names like `<key>/x` or `<key>b` also
/// wake the watch. An empty batch is a poll timeout and is always rechecked.
fn touches_key(changes: &[KvEvent], key: &str) -> bool {
    changes.is_empty() || changes.iter().any(|c| c.key == key)
}

/// Watches the lock key and claims it whenever it is free.
async fn watch_loop(shared: Arc<LockShared>) {
    let wait = shared.watch.wait();
    let backoff = shared.watch.error_backoff();
    let mut cursor: Option<WatchCursor> = None;
    let mut recheck = true;

    loop {
        if cursor.is_none() {
            match shared.until_stopped(shared.adapter.list(&shared.key)).await {
                None => return,
                Some(Ok((pairs, index))) => cursor = Some(WatchCursor::from_snapshot(pairs, index)),
                Some(Err(e)) => {
                    debug!(lock = %shared.name, error = %e, "Failed to read lock key");
                    if !shared.pause(backoff).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(cursor) = cursor.as_mut() else {
            continue;
        };

        if recheck {
            let current = cursor.get(&shared.key).cloned();
            match shared.evaluate(current).await {
                None => return,
                Some(Next::Backoff) => {
                    if !shared.pause(backoff).await {
                        return;
                    }
                    continue;
                }
                Some(Next::Watch) => {}
            }
        }
        recheck = true;

        match shared
            .until_stopped(shared.adapter.watch(&shared.key, cursor, wait))
            .await
        {
            None => return,
            Some(Ok(changes)) => recheck = touches_key(&changes, &shared.key),
            Some(Err(e)) => {
                if e.is_retryable() {
                    debug!(lock = %shared.name, error = %e, "Lock watch failed, retrying");
                } else {
                    warn!(lock = %shared.name, error = %e, "Lock watch failed, retrying");
                }
                if !shared.pause(backoff).await {
                    return;
                }
            }
        }
    }
}

/// Gives up if the lock is not held within `timeout`.
async fn timeout_task(shared: Arc<LockShared>, timeout: Duration) {
    if !shared.pause(timeout).await {
        return;
    }
    {
        let inner = shared.inner.lock();
        if inner.state.is_terminal() || inner.state == LockState::Acquired {
            return;
        }
    }
    info!(lock = %shared.name, ?timeout, "Timed out acquiring lock");
    shared.emit(LockEvent::AcquireTimeout);
    shared.release().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;

    fn watch_config() -> WatchConfig {
        WatchConfig {
            wait_secs: 1,
            error_backoff_ms: 20,
        }
    }

    fn change(key: &str) -> KvEvent {
        KvEvent {
            kind: crate::types::KvEventKind::Put,
            key: key.to_string(),
            value: b"x".to_vec(),
            prev_value: None,
            session: None,
            index: 1,
        }
    }

    #[test]
    fn test_sibling_changes_skip_recheck() {
        let key = keys::lock_key("a");
        let siblings = vec![change(&keys::lock_key("ab")), change(&keys::lock_key("a/x"))];
        assert!(!touches_key(&siblings, &key));

        let mut mixed = siblings;
        mixed.push(change(&key));
        assert!(touches_key(&mixed, &key));
        assert!(touches_key(&[], &key));
    }

    fn new_lock(store: &Arc<MemoryStore>, holder: &str) -> DistributedLock {
        DistributedLock::new(
            store.clone(),
            "test/lock",
            holder,
            Duration::from_secs(10),
            watch_config(),
        )
    }

    #[test]
    fn test_new_lock_is_idle() {
        let store = Arc::new(MemoryStore::new());
        let lock = new_lock(&store, "h1");
        assert_eq!(lock.state(), LockState::Idle);
        assert_eq!(lock.key(), "/contiv.io/lock/test/lock");
        assert!(!lock.is_acquired());
        assert!(!lock.is_stopped());
        assert_eq!(store.stats().sessions_created, 0);
    }

    #[tokio::test]
    async fn test_acquire_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let lock = new_lock(&store, "h1");
        lock.acquire(Duration::ZERO).await.unwrap();
        assert!(matches!(
            lock.acquire(Duration::ZERO).await,
            Err(ObjdbError::LockActive { .. })
        ));
        lock.release().await;
        assert!(matches!(
            lock.acquire(Duration::ZERO).await,
            Err(ObjdbError::LockReleased { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_failure_emits_acquire_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let lock = new_lock(&store, "h1");
        let mut events = lock.subscribe();

        assert!(lock.acquire(Duration::ZERO).await.is_err());
        assert_eq!(events.try_recv().unwrap(), LockEvent::AcquireError);
        assert_eq!(lock.state(), LockState::Idle);

        store.set_available(true);
        lock.acquire(Duration::ZERO).await.unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn test_release_before_acquire_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let lock = new_lock(&store, "h1");
        lock.release().await;
        assert_eq!(lock.state(), LockState::Released);
        assert!(lock.is_stopped());
        lock.wait_stopped().await;
        assert_eq!(store.stats().destroy_session_calls, 0);
    }

    #[tokio::test]
    async fn test_drop_stops_tasks() {
        let store = Arc::new(MemoryStore::new());
        let lock = new_lock(&store, "h1");
        let observer = lock.shared.clone();
        lock.acquire(Duration::ZERO).await.unwrap();
        drop(lock);
        assert!(observer.stop.is_cancelled());
    }
}
