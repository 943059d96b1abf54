//! etcd v3 backend.
//!
//! Sessions are etcd leases (ID rendered in decimal). Claims use
//! transactions: create-if-absent (`version == 0`), or compare-and-swap on
//! `mod_revision` when the key exists without a lease or under our own
//! lease. Watches open a prefix watch from `cursor.index() + 1` and fall
//! back to a listing diff when the revision has been compacted.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, PutOptions, Txn,
    TxnOp, TxnOpResponse, WatchOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::Code;
use tracing::{debug, instrument, warn};

use crate::adapter::StoreAdapter;
use crate::config::ObjdbConfig;
use crate::error::{ObjdbError, Result};
use crate::plugin::StorePlugin;
use crate::types::{KvEvent, KvEventKind, KvPair, SessionId, WatchCursor};

/// Backend name of etcd.
pub const ETCD_PLUGIN: &str = "etcd";

/// Maps an etcd client error onto the objdb taxonomy.
fn classify(err: etcd_client::Error) -> ObjdbError {
    match &err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Cancelled => ObjdbError::unavailable(ETCD_PLUGIN, status.message()),
            _ => ObjdbError::backend(ETCD_PLUGIN, status.message()),
        },
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
            ObjdbError::unavailable(ETCD_PLUGIN, err.to_string())
        }
        _ => ObjdbError::backend(ETCD_PLUGIN, err.to_string()),
    }
}

/// Like [`classify`], but reports a missing lease as an expired session.
fn classify_lease(err: etcd_client::Error, session: &SessionId) -> ObjdbError {
    if let etcd_client::Error::GRpcStatus(status) = &err {
        if status.code() == Code::NotFound || status.message().contains("lease not found") {
            return ObjdbError::session_expired(session.as_str());
        }
    }
    classify(err)
}

fn lease_id(session: &SessionId) -> Result<i64> {
    session
        .as_str()
        .parse::<i64>()
        .map_err(|_| ObjdbError::protocol(format!("invalid etcd lease id '{}'", session)))
}

fn session_of(kv: &KeyValue) -> Option<SessionId> {
    (kv.lease() != 0).then(|| SessionId::new(kv.lease().to_string()))
}

fn to_pair(kv: &KeyValue) -> Result<KvPair> {
    let key = kv
        .key_str()
        .map_err(|e| ObjdbError::protocol(format!("non UTF-8 key: {}", e)))?;
    Ok(KvPair {
        key: key.to_string(),
        value: kv.value().to_vec(),
        session: session_of(kv),
        mod_index: kv.mod_revision().max(0) as u64,
    })
}

fn with_scheme(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Adapter over an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to `endpoints` and verifies the cluster answers within the
    /// connect timeout.
    #[instrument(skip(config))]
    pub async fn connect(endpoints: &[String], config: &ObjdbConfig) -> Result<Self> {
        let endpoints: Vec<String> = endpoints.iter().map(|e| with_scheme(e)).collect();
        let timeout = config.store.connect_timeout();
        let options = ConnectOptions::new().with_connect_timeout(timeout);

        let client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(classify)?;
        let store = Self { client };

        let mut probe = store.client.clone();
        match tokio::time::timeout(timeout, probe.get(crate::keys::ROOT, None)).await {
            Ok(Ok(_)) => Ok(store),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(ObjdbError::unavailable(
                ETCD_PLUGIN,
                format!("no response from {:?} within {:?}", endpoints, timeout),
            )),
        }
    }

    async fn current_holder(&self, key: &str) -> Result<Option<(i64, i64)>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(classify)?;
        Ok(resp.kvs().first().map(|kv| (kv.lease(), kv.mod_revision())))
    }

    async fn resync(&self, prefix: &str, cursor: &mut WatchCursor) -> Result<Vec<KvEvent>> {
        let (pairs, index) = self.list(prefix).await?;
        Ok(cursor.resync(pairs, index))
    }
}

#[async_trait]
impl StoreAdapter for EtcdStore {
    fn name(&self) -> &str {
        ETCD_PLUGIN
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(classify)?;
        match resp.kvs().first() {
            Some(kv) => to_pair(kv),
            None => Err(ObjdbError::not_found(key)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await.map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(classify)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64)> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(classify)?;
        let index = resp.header().map(|h| h.revision()).unwrap_or(0).max(0) as u64;
        let pairs = resp.kvs().iter().map(to_pair).collect::<Result<Vec<_>>>()?;
        Ok((pairs, index))
    }

    async fn watch(
        &self,
        prefix: &str,
        cursor: &mut WatchCursor,
        wait: Duration,
    ) -> Result<Vec<KvEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(cursor.index() as i64 + 1);
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(classify)?;

        let deadline = Instant::now() + wait;
        let result = loop {
            let resp = match tokio::time::timeout_at(deadline, stream.message()).await {
                Err(_) => break Ok(Vec::new()),
                Ok(Err(e)) => break Err(classify(e)),
                Ok(Ok(None)) => {
                    break Err(ObjdbError::unavailable(ETCD_PLUGIN, "watch stream closed"))
                }
                Ok(Ok(Some(resp))) => resp,
            };

            if resp.compact_revision() > 0 {
                debug!(
                    prefix,
                    compact_revision = resp.compact_revision(),
                    "Watch revision compacted, resyncing"
                );
                break self.resync(prefix, cursor).await;
            }
            if resp.canceled() {
                break Err(ObjdbError::unavailable(ETCD_PLUGIN, "watch canceled by server"));
            }
            if resp.events().is_empty() {
                continue;
            }

            let mut events = Vec::with_capacity(resp.events().len());
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let pair = to_pair(kv)?;
                let mut kv_event = KvEvent {
                    kind: match event.event_type() {
                        EventType::Put => KvEventKind::Put,
                        EventType::Delete => KvEventKind::Delete,
                    },
                    key: pair.key,
                    value: pair.value,
                    prev_value: event.prev_kv().map(|p| p.value().to_vec()),
                    session: pair.session,
                    index: pair.mod_index,
                };
                cursor.apply(&mut kv_event);
                events.push(kv_event);
            }
            break Ok(events);
        };

        if let Err(e) = watcher.cancel().await {
            debug!(prefix, error = %e, "Failed to cancel etcd watch");
        }
        result
    }

    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = client.lease_grant(ttl_secs, None).await.map_err(classify)?;
        Ok(SessionId::new(resp.id().to_string()))
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        let id = lease_id(session)?;
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(id)
            .await
            .map_err(|e| classify_lease(e, session))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| classify_lease(e, session))?;
        match stream.message().await.map_err(|e| classify_lease(e, session))? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            Some(_) => Err(ObjdbError::session_expired(session.as_str())),
            None => Err(ObjdbError::unavailable(ETCD_PLUGIN, "keep-alive stream closed")),
        }
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let id = lease_id(session)?;
        let mut client = self.client.clone();
        match client.lease_revoke(id).await {
            Ok(_) => Ok(()),
            Err(e) => match classify_lease(e, session) {
                ObjdbError::SessionExpired { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn acquire_key(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let lease = lease_id(session)?;
        let put = || TxnOp::put(key, value, Some(PutOptions::new().with_lease(lease)));
        let mut client = self.client.clone();

        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([put()])
            .or_else([TxnOp::get(key, None)]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| classify_lease(e, session))?;
        if resp.succeeded() {
            return Ok(true);
        }

        let current = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| (kv.lease(), kv.mod_revision())),
            _ => None,
        });
        match current {
            Some((holder, revision)) if holder == 0 || holder == lease => {
                let txn = Txn::new()
                    .when([Compare::mod_revision(key, CompareOp::Equal, revision)])
                    .and_then([put()]);
                let resp = client
                    .txn(txn)
                    .await
                    .map_err(|e| classify_lease(e, session))?;
                Ok(resp.succeeded())
            }
            _ => Ok(false),
        }
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<()> {
        let lease = lease_id(session)?;
        let Some((holder, revision)) = self.current_holder(key).await? else {
            return Ok(());
        };
        if holder != lease {
            return Ok(());
        }
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then([TxnOp::delete(key, None)]);
        let resp = client.txn(txn).await.map_err(classify)?;
        if !resp.succeeded() {
            warn!(key, session = %session, "Key changed before release, leaving it");
        }
        Ok(())
    }

    async fn put_with_session(&self, key: &str, value: &[u8], session: &SessionId) -> Result<()> {
        let lease = lease_id(session)?;
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(|e| classify_lease(e, session))?;
        Ok(())
    }
}

/// Plugin creating [`EtcdStore`] adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdPlugin;

#[async_trait]
impl StorePlugin for EtcdPlugin {
    fn name(&self) -> &str {
        ETCD_PLUGIN
    }

    fn default_endpoint(&self) -> &str {
        "http://127.0.0.1:2379"
    }

    async fn init(
        &self,
        endpoints: &[String],
        config: &ObjdbConfig,
    ) -> Result<Arc<dyn StoreAdapter>> {
        Ok(Arc::new(EtcdStore::connect(endpoints, config).await?))
    }
}
