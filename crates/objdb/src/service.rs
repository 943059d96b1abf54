//! Service registry: heartbeat-refreshed registrations and watch-based
//! discovery.
//!
//! Each registration writes its key bound to a backend session and keeps
//! both alive from a refresh task running every TTL/3. A crashed or
//! partitioned host stops refreshing and its key disappears with the
//! session. Watchers get an `Add` for every instance present when they
//! start, then `Add`/`Del` as instances come and go.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::StoreAdapter;
use crate::config::WatchConfig;
use crate::error::{ObjdbError, Result};
use crate::keys;
use crate::types::{
    KvEvent, KvEventKind, ServiceInfo, SessionId, WatchCursor, WatchEventType, WatchServiceEvent,
};

/// Capacity of the queue between a watch's long-poll and dispatch tasks.
const WATCH_QUEUE_CAPACITY: usize = 64;

/// Shortest refresh period, for very small TTLs.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

struct Registration {
    info: ServiceInfo,
    session: Arc<Mutex<SessionId>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct RegistryInner {
    adapter: Arc<dyn StoreAdapter>,
    watch: WatchConfig,
    registrations: Mutex<HashMap<String, Registration>>,
    // Serialises register/deregister of one key across await points.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Registers local service instances and watches remote ones.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

/// Period between refreshes of a registration with the given TTL.
pub fn refresh_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_REFRESH_INTERVAL)
}

fn decode(value: &[u8]) -> Result<ServiceInfo> {
    Ok(serde_json::from_slice(value)?)
}

fn error_event(service_name: &str) -> WatchServiceEvent {
    WatchServiceEvent {
        event_type: WatchEventType::Error,
        service_info: ServiceInfo::new(service_name, "", 0, 0),
    }
}

impl ServiceRegistry {
    /// Registry over `adapter`.
    pub fn new(adapter: Arc<dyn StoreAdapter>, watch: WatchConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                adapter,
                watch,
                registrations: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Registers `info` and keeps it alive until deregistered.
    ///
    /// Registering a key this process already registered replaces the
    /// previous registration, reusing its session.
    #[instrument(skip(self, info), fields(service = %info.key()))]
    pub async fn register_service(&self, info: ServiceInfo) -> Result<()> {
        if info.ttl == 0 {
            return Err(ObjdbError::Config(format!(
                "service '{}' needs a non-zero TTL",
                info.service_name
            )));
        }
        let key = info.key();
        let value = serde_json::to_vec(&info)?;
        let ttl = info.ttl_duration();
        let adapter = &self.inner.adapter;
        let key_lock = self.key_lock(&key);
        let _serialised = key_lock.lock().await;

        let previous = self.inner.registrations.lock().remove(&key);
        let reused = match previous {
            Some(prev) => {
                prev.stop.cancel();
                if let Err(e) = prev.task.await {
                    debug!(service = %key, error = %e, "Previous refresh task ended abnormally");
                }
                let session = prev.session.lock().clone();
                if prev.info.ttl == info.ttl {
                    Some(session)
                } else {
                    if let Err(e) = adapter.destroy_session(&session).await {
                        debug!(service = %key, error = %e, "Failed to destroy previous session");
                    }
                    None
                }
            }
            None => None,
        };

        let session = match reused {
            Some(session) => match adapter.put_with_session(&key, &value, &session).await {
                Ok(()) => session,
                Err(ObjdbError::SessionExpired { .. }) => {
                    self.write_with_new_session(&key, &value, ttl).await?
                }
                Err(e) => return Err(e),
            },
            None => self.write_with_new_session(&key, &value, ttl).await?,
        };

        let session = Arc::new(Mutex::new(session));
        let stop = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            adapter.clone(),
            key.clone(),
            value,
            ttl,
            session.clone(),
            stop.clone(),
            self.inner.watch.error_backoff(),
        ));

        info!(service = %key, ttl = info.ttl, "Registered service");
        let displaced = self.inner.registrations.lock().insert(
            key.clone(),
            Registration {
                info,
                session,
                stop,
                task,
            },
        );
        if let Some(displaced) = displaced {
            warn!(service = %key, "Displaced a concurrent registration");
            displaced.stop.cancel();
        }
        Ok(())
    }

    async fn write_with_new_session(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<SessionId> {
        let adapter = &self.inner.adapter;
        let session = adapter.create_session(ttl).await?;
        if let Err(e) = adapter.put_with_session(key, value, &session).await {
            if let Err(destroy_err) = adapter.destroy_session(&session).await {
                debug!(service = %key, error = %destroy_err, "Failed to destroy unused session");
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Stops refreshing `info` and deletes its key. Fails for instances this
    /// process did not register.
    #[instrument(skip(self, info), fields(service = %info.key()))]
    pub async fn deregister_service(&self, info: &ServiceInfo) -> Result<()> {
        let key = info.key();
        let key_lock = self.key_lock(&key);
        let _serialised = key_lock.lock().await;
        let registration = self
            .inner
            .registrations
            .lock()
            .remove(&key)
            .ok_or_else(|| ObjdbError::ServiceNotRegistered { key: key.clone() })?;

        registration.stop.cancel();
        if let Err(e) = registration.task.await {
            debug!(service = %key, error = %e, "Refresh task ended abnormally");
        }

        let adapter = &self.inner.adapter;
        let deleted = adapter.delete(&key).await;
        let session = registration.session.lock().clone();
        if let Err(e) = adapter.destroy_session(&session).await {
            warn!(service = %key, error = %e, "Failed to destroy service session");
        }
        match &deleted {
            Ok(()) => info!(service = %key, "Deregistered service"),
            Err(e) => warn!(service = %key, error = %e, "Failed to delete service key"),
        }
        deleted
    }

    /// Every registered instance of `service_name`. Empty when none exist.
    pub async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>> {
        let (pairs, _) = self
            .inner
            .adapter
            .list(&keys::service_dir(service_name))
            .await?;
        pairs.iter().map(|p| decode(&p.value)).collect()
    }

    /// Keys this process currently registers and refreshes.
    pub fn registered_services(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.registrations.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registrations this process currently refreshes.
    pub fn registered_infos(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self
            .inner
            .registrations
            .lock()
            .values()
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by_key(|i| i.key());
        infos
    }

    /// Streams instance changes of `service_name` into `events` until `stop`
    /// fires or the receiver goes away.
    ///
    /// Sends an `Add` for every current instance (an `Error` for entries
    /// that do not decode) before returning, then hands over to a long-poll
    /// task and a dispatch task.
    pub async fn watch_service(
        &self,
        service_name: &str,
        events: mpsc::Sender<WatchServiceEvent>,
        stop: CancellationToken,
    ) -> Result<()> {
        let dir = keys::service_dir(service_name);
        let (pairs, index) = self.inner.adapter.list(&dir).await?;

        let mut cache = HashMap::new();
        for pair in &pairs {
            let event = match decode(&pair.value) {
                Ok(info) => {
                    cache.insert(pair.key.clone(), info.clone());
                    WatchServiceEvent {
                        event_type: WatchEventType::Add,
                        service_info: info,
                    }
                }
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "Undecodable service entry");
                    error_event(service_name)
                }
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
        debug!(service = %service_name, instances = cache.len(), index, "Service watch started");

        let watch_stop = stop.child_token();
        let (raw_tx, raw_rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        tokio::spawn(poll_loop(
            self.inner.adapter.clone(),
            dir,
            WatchCursor::from_snapshot(pairs, index),
            self.inner.watch.clone(),
            raw_tx,
            watch_stop.clone(),
        ));
        tokio::spawn(dispatch_loop(
            service_name.to_string(),
            cache,
            raw_rx,
            events,
            watch_stop,
        ));
        Ok(())
    }
}

/// Renews the session and rewrites the key every TTL/3.
async fn refresh_loop(
    adapter: Arc<dyn StoreAdapter>,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    session: Arc<Mutex<SessionId>>,
    stop: CancellationToken,
    error_backoff: Duration,
) {
    let interval = refresh_interval(ttl);
    let retry_delay = error_backoff.min(interval);
    let mut delay = interval;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let current = session.lock().clone();
        let refresh = async {
            adapter.renew_session(&current).await?;
            adapter.put_with_session(&key, &value, &current).await
        };
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = refresh => result,
        };

        delay = match result {
            Ok(()) => interval,
            Err(e) if e.is_retryable() => {
                debug!(service = %key, error = %e, "Service refresh failed, retrying");
                retry_delay
            }
            Err(e) => {
                warn!(service = %key, error = %e, "Service session lost, re-registering");
                match adapter.create_session(ttl).await {
                    Ok(fresh) => {
                        if stop.is_cancelled() {
                            if let Err(e) = adapter.destroy_session(&fresh).await {
                                debug!(service = %key, error = %e, "Failed to destroy session");
                            }
                            return;
                        }
                        *session.lock() = fresh.clone();
                        match adapter.put_with_session(&key, &value, &fresh).await {
                            Ok(()) => interval,
                            Err(e) => {
                                error!(service = %key, error = %e, "Failed to rewrite service key");
                                retry_delay
                            }
                        }
                    }
                    Err(e) => {
                        error!(service = %key, error = %e, "Failed to create service session");
                        retry_delay
                    }
                }
            }
        };
    }
}

/// Long-polls the service directory and forwards raw changes.
async fn poll_loop(
    adapter: Arc<dyn StoreAdapter>,
    dir: String,
    mut cursor: WatchCursor,
    watch: WatchConfig,
    raw_tx: mpsc::Sender<Result<KvEvent>>,
    stop: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = adapter.watch(&dir, &mut cursor, watch.wait()) => result,
        };
        match result {
            Ok(changes) => {
                for change in changes {
                    if raw_tx.send(Ok(change)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!(dir = %dir, error = %e, "Service watch failed, retrying");
                } else {
                    warn!(dir = %dir, error = %e, "Service watch failed");
                    if raw_tx.send(Err(e)).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(watch.error_backoff()) => {}
                }
            }
        }
    }
}

/// Turns raw changes into `Add`/`Del`/`Error` events against a cache of
/// known instances.
async fn dispatch_loop(
    service_name: String,
    mut cache: HashMap<String, ServiceInfo>,
    mut raw_rx: mpsc::Receiver<Result<KvEvent>>,
    events: mpsc::Sender<WatchServiceEvent>,
    stop: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = raw_rx.recv() => received,
        };
        let Some(received) = received else { break };

        let event = match received {
            Ok(change) => match to_service_event(&service_name, &mut cache, change) {
                Some(event) => event,
                None => continue,
            },
            Err(_) => error_event(&service_name),
        };
        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = events.send(event) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    // Also ends the poll task when the receiver went away.
    stop.cancel();
    debug!(service = %service_name, "Service watch stopped");
}

fn to_service_event(
    service_name: &str,
    cache: &mut HashMap<String, ServiceInfo>,
    change: KvEvent,
) -> Option<WatchServiceEvent> {
    match change.kind {
        KvEventKind::Put => {
            if cache.contains_key(&change.key) {
                return None;
            }
            match decode(&change.value) {
                Ok(info) => {
                    cache.insert(change.key, info.clone());
                    Some(WatchServiceEvent {
                        event_type: WatchEventType::Add,
                        service_info: info,
                    })
                }
                Err(e) => {
                    warn!(key = %change.key, error = %e, "Undecodable service entry");
                    Some(error_event(service_name))
                }
            }
        }
        KvEventKind::Delete => {
            let info = cache.remove(&change.key).or_else(|| {
                change
                    .prev_value
                    .as_deref()
                    .and_then(|prev| decode(prev).ok())
            })?;
            Some(WatchServiceEvent {
                event_type: WatchEventType::Del,
                service_info: info,
            })
        }
    }
}
