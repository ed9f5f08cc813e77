use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::sync::Cache;

use crate::model::DedupeKey;
use crate::storage::{DedupStore, StorageError, StorageResult};

/// Process-local dedup store. Entries carry their own deadline so callers can
/// use per-insert TTLs; the cache-wide TTL only bounds memory.
#[derive(Debug)]
pub struct InMemoryDedupCache {
    entries: Cache<String, Instant>,
}

impl InMemoryDedupCache {
    pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(604_800);
    pub const DEFAULT_CAPACITY: u64 = 100_000;

    pub fn new(max_ttl: Duration) -> Self {
        Self::with_capacity(max_ttl, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_ttl: Duration, capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Cache::builder()
                .time_to_live(max_ttl.max(Duration::from_secs(1)))
                .max_capacity(capacity)
                .build(),
        }
    }

    pub fn is_live(&self, key: &DedupeKey) -> bool {
        self.entries
            .get(key.as_str())
            .is_some_and(|deadline| deadline > Instant::now())
    }
}

impl Default for InMemoryDedupCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_TTL)
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupCache {
    async fn contains_key(&self, key: &DedupeKey) -> StorageResult<bool> {
        Ok(self.is_live(key))
    }

    async fn insert_with_ttl(&self, key: &DedupeKey, ttl: Duration) -> StorageResult<()> {
        let deadline = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| StorageError::Database(format!("dedup ttl {ttl:?} out of range")))?;
        self.entries.insert(key.as_str().to_string(), deadline);
        Ok(())
    }

    async fn remove_key(&self, key: &DedupeKey) -> StorageResult<()> {
        self.entries.invalidate(key.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionRule;

    fn key() -> DedupeKey {
        DedupeKey::derive("an:dup:", "0xfeed", DetectionRule::Deviation)
    }

    #[tokio::test]
    async fn marks_and_forgets_keys() {
        let cache = InMemoryDedupCache::default();
        let key = key();
        assert!(!cache.contains_key(&key).await.unwrap());

        cache
            .insert_with_ttl(&key, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.contains_key(&key).await.unwrap());

        cache.remove_key(&key).await.unwrap();
        assert!(!cache.contains_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_rejected() {
        let cache = InMemoryDedupCache::default();
        let key = key();
        let err = cache
            .insert_with_ttl(&key, Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));
        assert!(!cache.contains_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = InMemoryDedupCache::default();
        let key = key();
        cache.insert_with_ttl(&key, Duration::ZERO).await.unwrap();
        assert!(!cache.contains_key(&key).await.unwrap());
    }
}
