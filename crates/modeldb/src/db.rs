//! Model objects persisted under `/modeldb/<type>/<key>`.

use contiv_objdb::{ObjdbClient, ObjdbError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{ModelDbError, Result};
use crate::link::ModelObj;

/// Root of all model objects within the object store.
pub const MODELDB_ROOT: &str = "/modeldb";

fn check_type(obj_type: &str, obj_key: &str) -> Result<()> {
    let reason = if obj_type.is_empty() {
        "empty type"
    } else if obj_type.contains('/') {
        "type contains '/'"
    } else {
        return Ok(());
    };
    Err(ModelDbError::InvalidAddress {
        obj_type: obj_type.to_string(),
        obj_key: obj_key.to_string(),
        reason,
    })
}

fn obj_path(obj_type: &str, obj_key: &str) -> Result<String> {
    check_type(obj_type, obj_key)?;
    if obj_key.is_empty() {
        return Err(ModelDbError::InvalidAddress {
            obj_type: obj_type.to_string(),
            obj_key: String::new(),
            reason: "empty key",
        });
    }
    Ok(format!("{}/{}/{}", MODELDB_ROOT, obj_type, obj_key))
}

/// Persistence for model objects over an objdb client.
#[derive(Clone)]
pub struct ModelDb {
    client: ObjdbClient,
    best_effort_delete: bool,
}

impl ModelDb {
    pub fn new(client: ObjdbClient) -> Self {
        Self {
            client,
            best_effort_delete: false,
        }
    }

    /// With `true`, `delete_obj` logs store failures and reports success.
    pub fn with_best_effort_delete(mut self, enabled: bool) -> Self {
        self.best_effort_delete = enabled;
        self
    }

    pub async fn write_obj<T: Serialize + ?Sized>(
        &self,
        obj_type: &str,
        obj_key: &str,
        value: &T,
    ) -> Result<()> {
        let path = obj_path(obj_type, obj_key)?;
        self.client.set_obj(&path, value).await.map_err(|e| {
            error!(key = %path, error = %e, "Error storing object");
            ModelDbError::from(e)
        })
    }

    pub async fn read_obj<T: DeserializeOwned>(&self, obj_type: &str, obj_key: &str) -> Result<T> {
        let path = obj_path(obj_type, obj_key)?;
        self.client.get_obj(&path).await.map_err(|e| {
            if e.is_not_found() {
                debug!(key = %path, "Object not found");
            } else {
                error!(key = %path, error = %e, "Error reading object");
            }
            ModelDbError::from(e)
        })
    }

    pub async fn delete_obj(&self, obj_type: &str, obj_key: &str) -> Result<()> {
        let path = obj_path(obj_type, obj_key)?;
        match self.client.del_obj(&path).await {
            Ok(()) => Ok(()),
            Err(e) if self.best_effort_delete => {
                warn!(key = %path, error = %e, "Error deleting object, ignoring");
                Ok(())
            }
            Err(e) => {
                error!(key = %path, error = %e, "Error deleting object");
                Err(e.into())
            }
        }
    }

    /// Every object of `obj_type`, in key order.
    pub async fn read_all_obj<T: DeserializeOwned>(&self, obj_type: &str) -> Result<Vec<T>> {
        check_type(obj_type, "")?;
        let dir = format!("{}/{}", MODELDB_ROOT, obj_type);
        let values = self.client.list_dir_values(&dir).await?;
        values
            .iter()
            .map(|raw| {
                serde_json::from_slice(raw).map_err(|e| ModelDbError::from(ObjdbError::from(e)))
            })
            .collect()
    }

    /// Writes `obj` under its own type and key.
    pub async fn write_model<O: ModelObj + Serialize>(&self, obj: &O) -> Result<()> {
        self.write_obj(obj.obj_type(), obj.obj_key(), obj).await
    }

    /// Reads the stored state of `obj`, addressed by its type and key.
    pub async fn read_model<O: ModelObj + DeserializeOwned>(&self, obj: &O) -> Result<O> {
        self.read_obj(obj.obj_type(), obj.obj_key()).await
    }
}
