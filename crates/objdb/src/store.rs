//! Object store facade: JSON objects under `/contiv.io/obj/`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::adapter::StoreAdapter;
use crate::error::{ObjdbError, Result};
use crate::keys;
use crate::retry::{with_retry, RetryPolicy};

/// Namespaced object storage over an adapter. Transient backend errors are
/// retried according to the configured policy.
#[derive(Clone)]
pub struct ObjStore {
    adapter: Arc<dyn StoreAdapter>,
    retry: RetryPolicy,
}

impl ObjStore {
    /// Facade over `adapter`.
    pub fn new(adapter: Arc<dyn StoreAdapter>, retry: RetryPolicy) -> Self {
        Self { adapter, retry }
    }

    /// Raw bytes stored under `key`. An empty value counts as absent.
    #[instrument(skip(self))]
    pub async fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        let full = keys::obj_key(key);
        let pair = with_retry(self.retry, "get_obj", || self.adapter.get(&full)).await?;
        if pair.value.is_empty() {
            return Err(ObjdbError::not_found(full));
        }
        Ok(pair.value)
    }

    /// Decodes the JSON object stored under `key`.
    pub async fn get_obj<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get_raw(key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Stores raw bytes under `key`.
    #[instrument(skip(self, value), fields(len = value.len()))]
    pub async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        let full = keys::obj_key(key);
        with_retry(self.retry, "set_obj", || self.adapter.put(&full, value)).await
    }

    /// Stores `value` as JSON under `key`.
    pub async fn set_obj<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.set_raw(key, &raw).await
    }

    /// Deletes the object under `key`.
    #[instrument(skip(self))]
    pub async fn del_obj(&self, key: &str) -> Result<()> {
        let full = keys::obj_key(key);
        with_retry(self.retry, "del_obj", || self.adapter.delete(&full)).await
    }

    /// Keys (relative to the object root) of everything below `prefix`.
    ///
    /// An absent prefix lists as empty; a prefix naming a leaf object is
    /// `NotADirectory`.
    #[instrument(skip(self))]
    pub async fn list_dir(&self, prefix: &str) -> Result<Vec<String>> {
        let pairs = self.list_pairs(prefix).await?;
        Ok(pairs
            .into_iter()
            .filter_map(|(key, _)| keys::strip_obj_prefix(&key).map(str::to_string))
            .collect())
    }

    /// Values of everything below `prefix`, in key order.
    pub async fn list_dir_values(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let pairs = self.list_pairs(prefix).await?;
        Ok(pairs.into_iter().map(|(_, value)| value).collect())
    }

    async fn list_pairs(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let base = prefix.trim_matches('/');
        let dir = if base.is_empty() {
            keys::OBJ_PREFIX.to_string()
        } else {
            format!("{}/", keys::obj_key(base))
        };

        let (pairs, _) = with_retry(self.retry, "list_dir", || self.adapter.list(&dir)).await?;
        if pairs.is_empty() && !base.is_empty() {
            let leaf = keys::obj_key(base);
            match self.adapter.get(&leaf).await {
                Ok(_) => return Err(ObjdbError::NotADirectory { key: leaf }),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(dir = %dir, count = pairs.len(), "Listed directory");
        Ok(pairs.into_iter().map(|p| (p.key, p.value)).collect())
    }
}
