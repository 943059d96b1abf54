//! One-way links between model objects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A persisted model object, addressed by type and key.
pub trait ModelObj {
    /// Object type, the first path segment under `/modeldb/`.
    fn obj_type(&self) -> &str;
    /// Key unique within the type.
    fn obj_key(&self) -> &str;
}

/// Reference from one object to another. An empty link points nowhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub obj_type: String,
    #[serde(rename = "key", default, skip_serializing_if = "String::is_empty")]
    pub obj_key: String,
}

impl Link {
    /// Link pointing at `obj`.
    pub fn to<O: ModelObj + ?Sized>(obj: &O) -> Self {
        Self {
            obj_type: obj.obj_type().to_string(),
            obj_key: obj.obj_key().to_string(),
        }
    }

    /// True when the link points nowhere.
    pub fn is_empty(&self) -> bool {
        self.obj_type.is_empty() && self.obj_key.is_empty()
    }
}

/// Points `link` at `obj`.
pub fn add_link<O: ModelObj + ?Sized>(link: &mut Link, obj: &O) {
    *link = Link::to(obj);
}

/// Clears `link`.
pub fn remove_link(link: &mut Link) {
    *link = Link::default();
}

/// Adds a link to `obj` into `link_set`, keyed by the object key.
pub fn add_link_set<O: ModelObj + ?Sized>(link_set: &mut HashMap<String, Link>, obj: &O) {
    link_set.insert(obj.obj_key().to_string(), Link::to(obj));
}

/// Removes the link to `obj` from `link_set`, if present.
pub fn remove_link_set<O: ModelObj + ?Sized>(link_set: &mut HashMap<String, Link>, obj: &O) {
    link_set.remove(obj.obj_key());
}
