//! Key layout under the `/contiv.io` root.

/// Root of every key written by this crate.
pub const ROOT: &str = "/contiv.io";
/// Prefix for arbitrary objects.
pub const OBJ_PREFIX: &str = "/contiv.io/obj/";
/// Prefix for lock keys.
pub const LOCK_PREFIX: &str = "/contiv.io/lock/";
/// Prefix for service instance keys.
pub const SERVICE_PREFIX: &str = "/contiv.io/service/";

/// Full store key for an object key. Leading slashes are ignored, so
/// `"/modeldb/x"` and `"modeldb/x"` name the same object.
pub fn obj_key(key: &str) -> String {
    format!("{}{}", OBJ_PREFIX, key.trim_start_matches('/'))
}

/// Object key relative to [`OBJ_PREFIX`], or `None` for keys outside it.
pub fn strip_obj_prefix(full: &str) -> Option<&str> {
    full.strip_prefix(OBJ_PREFIX)
}

/// Key of the lock named `name`.
pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name.trim_start_matches('/'))
}

/// Directory holding every instance of a service. Ends with `/` so that a
/// prefix listing of `svc` never picks up `svc2`.
pub fn service_dir(service_name: &str) -> String {
    format!("{}{}/", SERVICE_PREFIX, service_name)
}

/// Key of one service instance.
pub fn service_key(service_name: &str, host_addr: &str, port: u16) -> String {
    format!("{}{}:{}", service_dir(service_name), host_addr, port)
}
