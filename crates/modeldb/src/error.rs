use contiv_objdb::ObjdbError;
use thiserror::Error;

/// Errors of the model persistence layer.
#[derive(Debug, Error)]
pub enum ModelDbError {
    /// Type or key unusable as a path segment.
    #[error("Invalid model object address '{obj_type}/{obj_key}': {reason}")]
    InvalidAddress {
        obj_type: String,
        obj_key: String,
        reason: &'static str,
    },

    /// Failure in the underlying object store.
    #[error(transparent)]
    Store(#[from] ObjdbError),
}

impl ModelDbError {
    /// True when the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ModelDbError::Store(e) if e.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, ModelDbError>;
