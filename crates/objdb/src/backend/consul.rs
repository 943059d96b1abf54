//! Consul backend over the HTTP KV and session APIs.
//!
//! Consul keys carry no leading `/`; it is stripped on the way out and
//! restored on the way in so callers see the same keys on every backend.
//! Watches are blocking queries on the prefix; each response is a full
//! listing that is diffed against the watch cursor.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::adapter::StoreAdapter;
use crate::config::ObjdbConfig;
use crate::error::{ObjdbError, Result};
use crate::plugin::StorePlugin;
use crate::types::{KvEvent, KvPair, SessionId, WatchCursor};

/// Backend name of Consul.
pub const CONSUL_PLUGIN: &str = "consul";

/// Consul rejects session TTLs outside this range.
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
const MAX_SESSION_TTL: Duration = Duration::from_secs(86400);

/// Extra time on top of a blocking query's wait before the HTTP request
/// itself times out.
const WATCH_SLACK: Duration = Duration::from_secs(5);

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKv {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    modify_index: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

fn consul_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

fn session_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_SESSION_TTL, MAX_SESSION_TTL)
}

fn classify(err: reqwest::Error) -> ObjdbError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ObjdbError::unavailable(CONSUL_PLUGIN, err.to_string())
    } else if err.is_decode() {
        ObjdbError::protocol(format!("consul response: {}", err))
    } else {
        ObjdbError::backend(CONSUL_PLUGIN, err.to_string())
    }
}

fn to_pair(kv: ConsulKv) -> Result<KvPair> {
    let value = match kv.value {
        Some(encoded) => STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ObjdbError::protocol(format!("bad base64 value for '{}': {}", kv.key, e)))?,
        None => Vec::new(),
    };
    Ok(KvPair {
        key: format!("/{}", kv.key),
        value,
        session: kv.session.filter(|s| !s.is_empty()).map(SessionId::new),
        mod_index: kv.modify_index,
    })
}

fn response_index(resp: &Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Adapter over a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulStore {
    http: reqwest::Client,
    base: String,
}

impl ConsulStore {
    /// Connects to the agent at `endpoint` (`host:port` or a full URL) and
    /// verifies that the cluster has a leader.
    #[instrument(skip(config))]
    pub async fn connect(endpoint: &str, config: &ObjdbConfig) -> Result<Self> {
        let base = if endpoint.contains("://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let http = reqwest::Client::builder()
            .connect_timeout(config.store.connect_timeout())
            .build()
            .map_err(|e| ObjdbError::Config(format!("failed to build HTTP client: {}", e)))?;
        let store = Self { http, base };

        let resp = store
            .http
            .get(format!("{}/v1/status/leader", store.base))
            .timeout(config.store.connect_timeout())
            .send()
            .await
            .map_err(classify)?;
        let leader: String = Self::check(resp, None).await?.json().await.map_err(classify)?;
        if leader.is_empty() {
            return Err(ObjdbError::unavailable(CONSUL_PLUGIN, "cluster has no leader"));
        }
        Ok(store)
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base, consul_key(key))
    }

    /// Maps non-success statuses onto the error taxonomy. A 500 mentioning
    /// an invalid session means the session is gone.
    async fn check(resp: Response, session: Option<&SessionId>) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if let Some(session) = session {
            if body.contains("invalid session") || body.contains("Session not found") {
                return Err(ObjdbError::session_expired(session.as_str()));
            }
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ObjdbError::unavailable(
                CONSUL_PLUGIN,
                format!("{}: {}", status, body.trim()),
            ))
        } else {
            Err(ObjdbError::backend(
                CONSUL_PLUGIN,
                format!("{}: {}", status, body.trim()),
            ))
        }
    }

    /// Listing under `prefix`; a 404 is an empty listing.
    async fn fetch_prefix(
        &self,
        prefix: &str,
        query: &str,
        timeout: Option<Duration>,
    ) -> Result<(Vec<KvPair>, u64)> {
        let mut request = self
            .http
            .get(format!("{}?recurse=true{}", self.kv_url(prefix), query));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await.map_err(classify)?;
        let index = response_index(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), index));
        }
        let entries: Vec<ConsulKv> = Self::check(resp, None).await?.json().await.map_err(classify)?;
        let mut pairs = entries.into_iter().map(to_pair).collect::<Result<Vec<_>>>()?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok((pairs, index))
    }

    /// PUT returning Consul's `true`/`false` body.
    async fn put_flag(
        &self,
        url: String,
        value: &[u8],
        session: Option<&SessionId>,
    ) -> Result<bool> {
        let resp = self
            .http
            .put(url)
            .body(value.to_vec())
            .send()
            .await
            .map_err(classify)?;
        let body = Self::check(resp, session).await?.text().await.map_err(classify)?;
        Ok(body.trim() == "true")
    }

    async fn session_call(&self, op: &str, session: &SessionId) -> Result<Response> {
        let resp = self
            .http
            .put(format!("{}/v1/session/{}/{}", self.base, op, session))
            .send()
            .await
            .map_err(classify)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjdbError::session_expired(session.as_str()));
        }
        Self::check(resp, Some(session)).await
    }
}

#[async_trait]
impl StoreAdapter for ConsulStore {
    fn name(&self) -> &str {
        CONSUL_PLUGIN
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        let resp = self.http.get(self.kv_url(key)).send().await.map_err(classify)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjdbError::not_found(key));
        }
        let entries: Vec<ConsulKv> = Self::check(resp, None).await?.json().await.map_err(classify)?;
        match entries.into_iter().next() {
            Some(kv) if kv.value.is_some() => to_pair(kv),
            _ => Err(ObjdbError::not_found(key)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.put_flag(self.kv_url(key), value, None).await? {
            Ok(())
        } else {
            Err(ObjdbError::backend(CONSUL_PLUGIN, format!("write of '{}' rejected", key)))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.http.delete(self.kv_url(key)).send().await.map_err(classify)?;
        Self::check(resp, None).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64)> {
        self.fetch_prefix(prefix, "", None).await
    }

    async fn watch(
        &self,
        prefix: &str,
        cursor: &mut WatchCursor,
        wait: Duration,
    ) -> Result<Vec<KvEvent>> {
        let query = format!("&index={}&wait={}ms", cursor.index(), wait.as_millis());
        let (pairs, index) = self
            .fetch_prefix(prefix, &query, Some(wait + WATCH_SLACK))
            .await?;
        if index < cursor.index() {
            debug!(
                prefix,
                index,
                previous = cursor.index(),
                "Consul index went backwards, resyncing"
            );
        }
        Ok(cursor.resync(pairs, index))
    }

    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        let request = SessionRequest {
            name: "contiv-objdb",
            ttl: format!("{}s", session_ttl(ttl).as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };
        let resp = self
            .http
            .put(format!("{}/v1/session/create", self.base))
            .json(&request)
            .send()
            .await
            .map_err(classify)?;
        let created: SessionCreated = Self::check(resp, None).await?.json().await.map_err(classify)?;
        Ok(SessionId::new(created.id))
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        let resp = self.session_call("renew", session).await?;
        // An unknown session renews with 200 and an empty array on some agents.
        let body = resp.text().await.map_err(classify)?;
        if body.trim() == "[]" || body.trim() == "null" {
            return Err(ObjdbError::session_expired(session.as_str()));
        }
        Ok(())
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        match self.session_call("destroy", session).await {
            Ok(_) | Err(ObjdbError::SessionExpired { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn renew_interval(&self, ttl: Duration) -> Duration {
        session_ttl(ttl) / 2
    }

    async fn acquire_key(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let url = format!("{}?acquire={}", self.kv_url(key), session);
        self.put_flag(url, value, Some(session)).await
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<()> {
        let pair = match self.get(key).await {
            Ok(pair) => pair,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if pair.session.as_ref() != Some(session) {
            return Ok(());
        }
        let url = format!("{}?release={}", self.kv_url(key), session);
        if !self.put_flag(url, &pair.value, Some(session)).await? {
            return Ok(());
        }
        // Released keys linger without a holder; remove it unless someone
        // wrote in between.
        let released = self.get(key).await?;
        if released.session.is_none() {
            let url = format!("{}?cas={}", self.kv_url(key), released.mod_index);
            let resp = self.http.delete(url).send().await.map_err(classify)?;
            Self::check(resp, None).await?;
        }
        Ok(())
    }

    async fn put_with_session(&self, key: &str, value: &[u8], session: &SessionId) -> Result<()> {
        if self.acquire_key(key, value, session).await? {
            return Ok(());
        }
        // Held by a stale session; take the key over.
        self.delete(key).await?;
        if self.acquire_key(key, value, session).await? {
            Ok(())
        } else {
            Err(ObjdbError::backend(
                CONSUL_PLUGIN,
                format!("'{}' is held by another session", key),
            ))
        }
    }
}

/// Plugin creating [`ConsulStore`] adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsulPlugin;

#[async_trait]
impl StorePlugin for ConsulPlugin {
    fn name(&self) -> &str {
        CONSUL_PLUGIN
    }

    fn default_endpoint(&self) -> &str {
        "127.0.0.1:8500"
    }

    async fn init(
        &self,
        endpoints: &[String],
        config: &ObjdbConfig,
    ) -> Result<Arc<dyn StoreAdapter>> {
        let endpoint = endpoints
            .first()
            .map(String::as_str)
            .unwrap_or(self.default_endpoint());
        Ok(Arc::new(ConsulStore::connect(endpoint, config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_mapping() {
        assert_eq!(consul_key("/contiv.io/lock/leader"), "contiv.io/lock/leader");
        assert_eq!(consul_key("contiv.io/obj/x"), "contiv.io/obj/x");
    }

    #[test]
    fn test_decode_kv_listing() {
        let body = r#"[
            {"Key":"contiv.io/service/netplugin/10.0.0.1:9002","Value":"eyJhIjoxfQ==","Session":"adf4238a-882b-9ddc-4a9d-5b6758e4159e","ModifyIndex":42,"CreateIndex":40,"LockIndex":1,"Flags":0},
            {"Key":"contiv.io/obj/empty","Value":null,"ModifyIndex":7,"CreateIndex":7,"LockIndex":0,"Flags":0}
        ]"#;
        let entries: Vec<ConsulKv> = serde_json::from_str(body).unwrap();
        let pairs: Vec<KvPair> = entries.into_iter().map(|kv| to_pair(kv).unwrap()).collect();

        assert_eq!(pairs[0].key, "/contiv.io/service/netplugin/10.0.0.1:9002");
        assert_eq!(pairs[0].value, br#"{"a":1}"#.to_vec());
        assert_eq!(
            pairs[0].session,
            Some(SessionId::new("adf4238a-882b-9ddc-4a9d-5b6758e4159e"))
        );
        assert_eq!(pairs[0].mod_index, 42);
        assert!(pairs[1].value.is_empty());
        assert_eq!(pairs[1].session, None);
    }

    #[test]
    fn test_bad_base64_is_protocol_error() {
        let kv = ConsulKv {
            key: "k".to_string(),
            value: Some("%%%".to_string()),
            session: None,
            modify_index: 1,
        };
        assert!(matches!(to_pair(kv), Err(ObjdbError::Protocol { .. })));
    }

    #[test]
    fn test_session_request_body() {
        let request = SessionRequest {
            name: "contiv-objdb",
            ttl: format!("{}s", session_ttl(Duration::from_secs(3)).as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "Name": "contiv-objdb",
                "TTL": "10s",
                "Behavior": "delete",
                "LockDelay": "0s"
            })
        );
    }

    #[test]
    fn test_renew_interval_respects_minimum_ttl() {
        let store = ConsulStore {
            http: reqwest::Client::new(),
            base: "http://127.0.0.1:8500".to_string(),
        };
        assert_eq!(store.renew_interval(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(store.renew_interval(Duration::from_secs(30)), Duration::from_secs(15));
    }
}
