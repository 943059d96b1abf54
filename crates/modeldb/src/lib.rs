//! Model object persistence on top of the contiv object store.
//!
//! Objects live at `/modeldb/<type>/<key>` below the object root and refer
//! to each other through [`Link`]s.

pub mod db;
pub mod error;
pub mod link;

pub use db::{ModelDb, MODELDB_ROOT};
pub use error::{ModelDbError, Result};
pub use link::{add_link, add_link_set, remove_link, remove_link_set, Link, ModelObj};
