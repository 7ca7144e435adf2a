//! Runtime settings backed by the config table.
//!
//! Lookups resolve in order: in-process cache, `ConfigStore`, compiled
//! default. Store failures are logged and fall back to the default without
//! poisoning the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::ConfigError;
use crate::store::ConfigStore;

/// Recognized setting keys.
pub mod keys {
    pub const MAX_RETRIES: &str = "max-retries";
    pub const BACKOFF_BASE: &str = "backoff-base";
    pub const LOCK_TIMEOUT: &str = "lock-timeout";
    pub const WORKER_POLL_INTERVAL: &str = "worker-poll-interval";
    pub const COMMAND_TIMEOUT: &str = "command-timeout";

    pub const ALL: [&str; 5] = [
        MAX_RETRIES,
        BACKOFF_BASE,
        LOCK_TIMEOUT,
        WORKER_POLL_INTERVAL,
        COMMAND_TIMEOUT,
    ];
}

/// Compiled-in defaults for every recognized key.
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            lock_timeout_ms: 300_000, // 5 minutes
            poll_interval_ms: 1_000,
            command_timeout_ms: 60_000,
        }
    }
}

impl Defaults {
    /// Defaults with `MAX_RETRIES` / `BACKOFF_BASE` environment overrides.
    pub fn from_env() -> Self {
        let mut defaults = Self::default();
        if let Some(n) = std::env::var("MAX_RETRIES")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            defaults.max_retries = n;
        }
        if let Some(base) = std::env::var("BACKOFF_BASE")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|b| b.is_finite() && *b > 0.0)
        {
            defaults.backoff_base = base;
        }
        defaults
    }

    /// Default value for a recognized key.
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            keys::MAX_RETRIES => Some(Value::from(self.max_retries)),
            keys::BACKOFF_BASE => Some(Value::from(self.backoff_base)),
            keys::LOCK_TIMEOUT => Some(Value::from(self.lock_timeout_ms)),
            keys::WORKER_POLL_INTERVAL => Some(Value::from(self.poll_interval_ms)),
            keys::COMMAND_TIMEOUT => Some(Value::from(self.command_timeout_ms)),
            _ => None,
        }
    }
}

/// Cached settings provider shared by the managers and the worker pool.
pub struct Settings {
    store: Arc<dyn ConfigStore>,
    defaults: Defaults,
    cache: RwLock<HashMap<String, Value>>,
}

impl Settings {
    /// Settings with environment-adjusted defaults.
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_defaults(store, Defaults::from_env())
    }

    pub fn with_defaults(store: Arc<dyn ConfigStore>, defaults: Defaults) -> Self {
        Self {
            store,
            defaults,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Resolve `key`. A compiled default found on first read is cached like a
    /// stored value. `default` is used, uncached, only for keys with no
    /// compiled default.
    pub async fn get(&self, key: &str, default: Value) -> Value {
        if let Some(v) = self.cache.read().await.get(key) {
            return v.clone();
        }

        match self.store.get_config(key).await {
            Ok(Some(v)) => {
                self.cache.write().await.insert(key.to_string(), v.clone());
                v
            }
            Ok(None) => match self.defaults.value(key) {
                Some(v) => {
                    self.cache.write().await.insert(key.to_string(), v.clone());
                    v
                }
                None => default,
            },
            Err(e) => {
                warn!(key, error = %e, "Config read failed, using default");
                self.defaults.value(key).unwrap_or(default)
            }
        }
    }

    /// Persist `key`. On success the cache holds the new value, so the next
    /// `get` does not hit the store.
    pub async fn set(&self, key: &str, value: Value) -> bool {
        match self.try_set(key, value).await {
            Ok(()) => true,
            Err(e) => {
                error!(key, error = %e, "Failed to set config");
                false
            }
        }
    }

    /// `set` with the failure reason. Recognized keys must hold a usable
    /// number (or numeric string).
    pub async fn try_set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        validate(key, &value)?;
        self.store
            .set_config(key, &value)
            .await
            .map_err(|e| ConfigError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        debug!(key, value = %value, "Config updated");
        self.cache.write().await.insert(key.to_string(), value);
        Ok(())
    }

    /// Every stored setting layered over the defaults.
    pub async fn get_all(&self) -> HashMap<String, Value> {
        let mut all: HashMap<String, Value> = keys::ALL
            .iter()
            .filter_map(|k| self.defaults.value(k).map(|v| (k.to_string(), v)))
            .collect();

        match self.store.all_config().await {
            Ok(stored) => all.extend(stored),
            Err(e) => {
                warn!(error = %e, "Config listing failed, returning cached values");
                all.extend(self.cache.read().await.clone());
            }
        }
        all
    }

    /// Drop cached values; the next `get` re-reads the store.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    // ── Typed accessors ─────────────────────────────────────────────

    pub async fn max_retries(&self) -> u32 {
        let fallback = self.defaults.max_retries;
        let value = self.get(keys::MAX_RETRIES, Value::from(fallback)).await;
        match as_number(&value) {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) => n as u32,
            _ => invalid(keys::MAX_RETRIES, &value, fallback),
        }
    }

    pub async fn backoff_base(&self) -> f64 {
        let fallback = self.defaults.backoff_base;
        let value = self.get(keys::BACKOFF_BASE, Value::from(fallback)).await;
        match as_number(&value) {
            Some(b) if b.is_finite() && b > 0.0 => b,
            _ => invalid(keys::BACKOFF_BASE, &value, fallback),
        }
    }

    pub async fn lock_timeout(&self) -> Duration {
        self.millis(keys::LOCK_TIMEOUT, self.defaults.lock_timeout_ms)
            .await
    }

    pub async fn poll_interval(&self) -> Duration {
        self.millis(keys::WORKER_POLL_INTERVAL, self.defaults.poll_interval_ms)
            .await
    }

    pub async fn command_timeout(&self) -> Duration {
        self.millis(keys::COMMAND_TIMEOUT, self.defaults.command_timeout_ms)
            .await
    }

    async fn millis(&self, key: &str, fallback: u64) -> Duration {
        let value = self.get(key, Value::from(fallback)).await;
        let ms = match as_number(&value) {
            Some(n) if n.is_finite() && n >= 0.0 => n.round() as u64,
            _ => invalid(key, &value, fallback),
        };
        Duration::from_millis(ms)
    }
}

/// JSON numbers and numeric strings both count.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Reject values a typed accessor could never use.
fn validate(key: &str, value: &Value) -> Result<(), ConfigError> {
    let n = as_number(value);
    let ok = match key {
        keys::MAX_RETRIES => n.is_some_and(|n| n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX)),
        keys::BACKOFF_BASE => n.is_some_and(|n| n.is_finite() && n > 0.0),
        keys::LOCK_TIMEOUT | keys::WORKER_POLL_INTERVAL | keys::COMMAND_TIMEOUT => {
            n.is_some_and(|n| n.is_finite() && n >= 0.0)
        }
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unusable value {value}"),
        })
    }
}

fn invalid<T: std::fmt::Display>(key: &str, value: &Value, fallback: T) -> T {
    warn!(key, value = %value, fallback = %fallback, "Invalid config value, using default");
    fallback
}
