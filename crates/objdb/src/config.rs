//! Configuration file support for objdb clients.
//!
//! Loads and validates client configuration from TOML files.
//! Default location: /etc/contiv/objdb.toml

use crate::error::{ObjdbError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default store URL when none is configured.
pub const DEFAULT_STORE_URL: &str = "etcd://127.0.0.1:2379";

/// Backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL, `<plugin>://<host>:<port>`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Retry policy for object operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first one on a transient error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

/// Long-poll behaviour of lock and service watches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Maximum wait per long-poll in seconds
    #[serde(default = "default_watch_wait")]
    pub wait_secs: u64,

    /// Sleep after a transient watch or renew error in milliseconds
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
}

/// Lock defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock session TTL in seconds
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
}

/// Service registration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Registration TTL in seconds
    #[serde(default = "default_service_ttl")]
    pub ttl_secs: u64,
}

/// Complete objdb configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjdbConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

// Default functions
fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_watch_wait() -> u64 {
    30
}

fn default_error_backoff() -> u64 {
    1000
}

fn default_lock_ttl() -> u64 {
    10
}

fn default_service_ttl() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_watch_wait(),
            error_backoff_ms: default_error_backoff(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_service_ttl(),
        }
    }
}

impl StoreConfig {
    /// Connection timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl RetryConfig {
    /// Delay between attempts as a duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl WatchConfig {
    /// Long-poll wait as a duration
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Error backoff as a duration
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl LockConfig {
    /// Lock session TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ObjdbConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ObjdbError::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match Self::from_file(path) {
            Ok(config) => Ok(config),
            Err(ObjdbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ObjdbError::Config(format!("Failed to serialize TOML: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.store.url.is_empty() {
            crate::plugin::parse_store_url(&self.store.url)?;
        }
        if self.store.connect_timeout_secs == 0 {
            return Err(ObjdbError::Config(
                "store.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.retry.retry_interval_ms == 0 {
            return Err(ObjdbError::Config(
                "retry.retry_interval_ms must be > 0".to_string(),
            ));
        }
        if self.watch.wait_secs == 0 {
            return Err(ObjdbError::Config("watch.wait_secs must be > 0".to_string()));
        }
        if self.watch.error_backoff_ms == 0 {
            return Err(ObjdbError::Config(
                "watch.error_backoff_ms must be > 0".to_string(),
            ));
        }
        if self.lock.ttl_secs == 0 {
            return Err(ObjdbError::Config("lock.ttl_secs must be > 0".to_string()));
        }
        if self.service.ttl_secs < 3 {
            return Err(ObjdbError::Config(
                "service.ttl_secs must be >= 3 to allow refresh at TTL/3".to_string(),
            ));
        }
        Ok(())
    }
}
