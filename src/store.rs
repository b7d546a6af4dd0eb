use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Low-latency key-value store holding cursors, idempotency markers and
/// rate-limit counters.
///
/// Keys carry no cross-key ordering guarantees. An entry past its TTL must
/// read as absent even if the backend has not physically removed it yet.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Unconditionally write `value`, replacing any previous TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;

    /// Atomically write `value` only when `key` is absent (or expired).
    /// Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error>;

    /// Atomically replace a live entry only while it still holds `expected`.
    /// Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error>;

    /// Give an existing entry a new time-to-live. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Atomically add one to a counter, creating it with `ttl` when absent.
    /// Returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process [`CacheStore`], for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, Error> {
        self.entries
            .lock()
            .map_err(|e| Error::Cache(format!("memory store poisoned: {e}")))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let now = Instant::now();
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.value = value.to_string();
                entry.expires_at = ttl.map(|ttl| now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    e.value = "0".to_string();
                    e.expires_at = Some(now + ttl);
                }
            })
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: Some(now + ttl),
            });

        let count = entry
            .value
            .parse::<u64>()
            .map_err(|e| Error::Cache(format!("counter {key} is not numeric: {e}")))?
            + 1;
        entry.value = count.to_string();
        Ok(count)
    }
}
