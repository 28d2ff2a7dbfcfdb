use super::KvStore;
use crate::errors::StoreError;
use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn ttl_from(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Each entry carries its own deadline; entries without one never expire.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        created_at: Instant,
    ) -> Option<Duration> {
        value.ttl_from(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl_from(updated_at)
    }
}

/// In-process [`KvStore`] on a `moka` cache. Expired entries are evicted by
/// the cache's housekeeping, whether or not they are read again.
pub struct MemoryKvStore {
    cache: Cache<String, Entry>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let cache = Cache::builder().expire_after(EntryExpiry).build();
        MemoryKvStore { cache }
    }

    /// Remaining lifetime of `key`, if it is live and has an expiry.
    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        self.cache.get(key)?.ttl_from(Instant::now())
    }

    /// Number of resident entries once pending evictions have run.
    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &str, value: Vec<u8>, expires_at: Option<Instant>) {
        self.cache.insert(key.to_string(), Entry { value, expires_at });
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.cache.get(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.insert(key, value, None);
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.insert(key, value, Some(Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let entry = self
            .cache
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value,
                expires_at: None,
            });
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        Ok(self
            .cache
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }
}
