use crate::error::StoreError;
use crate::keys::{CachedKeyInfo, KeyStore};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use unigate_core::clock::TimeMeter;

struct CacheEntry {
    /// `None` is a negative entry: the key is unknown, revoked, or planless.
    value: Option<CachedKeyInfo>,
    expires_at_nanos: u64,
}

/// Read-through API-key cache with per-entry absolute expiry.
///
/// Misses never fail on their own; they read through to the key store and
/// cache whatever comes back, negative results included. Admin mutations call
/// `invalidate` synchronously with the DB write so this replica reflects the
/// change immediately; other replicas converge within one TTL.
pub struct ApiKeyCache {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn TimeMeter>,
    ttl_nanos: u64,
    entries: DashMap<String, CacheEntry>,
}

impl ApiKeyCache {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn TimeMeter>, ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            ttl_nanos: ttl_secs * 1_000_000_000,
            entries: DashMap::new(),
        }
    }

    pub async fn get(&self, api_key: &str) -> Result<Option<CachedKeyInfo>, StoreError> {
        let now = self.clock.monotonic_nanos();

        if let Some(entry) = self.entries.get(api_key) {
            if entry.expires_at_nanos > now {
                return Ok(entry.value.clone());
            }
        }

        let value = self.store.key_info(api_key).await?;
        self.entries.insert(
            api_key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at_nanos: now + self.ttl_nanos,
            },
        );
        debug!(api_key, hit = value.is_some(), "Key cache filled");
        Ok(value)
    }

    pub fn invalidate(&self, api_key: &str) {
        self.entries.remove(api_key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ApiKeyRecord, PricingPlan};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use chrono::Utc;
    use num_bigint::BigUint;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use unigate_core::clock::ManualTimeMeter;

    /// KeyStore fake that counts lookups and serves a mutable answer.
    struct CountingStore {
        lookups: AtomicUsize,
        answer: std::sync::Mutex<Option<CachedKeyInfo>>,
    }

    impl CountingStore {
        fn new(answer: Option<CachedKeyInfo>) -> Self {
            Self {
                lookups: AtomicUsize::new(0),
                answer: std::sync::Mutex::new(answer),
            }
        }

        fn set(&self, answer: Option<CachedKeyInfo>) {
            *self.answer.lock().unwrap() = answer;
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyStore for CountingStore {
        async fn find_key(&self, _: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
            unimplemented!("not used by the cache")
        }

        async fn key_info(&self, _: &str) -> Result<Option<CachedKeyInfo>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.lock().unwrap().clone())
        }

        async fn create_key(&self, _: &str, _: &str) -> Result<ApiKeyRecord, StoreError> {
            unimplemented!()
        }

        async fn revoke_key(&self, _: &str) -> Result<bool, StoreError> {
            unimplemented!()
        }

        async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
            unimplemented!()
        }

        async fn plan(&self, _: i64) -> Result<Option<PricingPlan>, StoreError> {
            unimplemented!()
        }

        async fn plans(&self) -> Result<Vec<PricingPlan>, StoreError> {
            unimplemented!()
        }

        async fn create_plan(
            &self,
            _: &str,
            _: i32,
            _: i32,
            _: &BigUint,
        ) -> Result<PricingPlan, StoreError> {
            unimplemented!()
        }
    }

    fn info(key: &str, rps: i32) -> CachedKeyInfo {
        CachedKeyInfo {
            api_key: key.to_string(),
            requests_per_second: rps,
            requests_per_day: 10_000,
            pricing_plan_id: 1,
            active_until: None,
        }
    }

    fn cache_with(
        answer: Option<CachedKeyInfo>,
    ) -> (ApiKeyCache, Arc<CountingStore>, Arc<ManualTimeMeter>) {
        let store = Arc::new(CountingStore::new(answer));
        let clock = Arc::new(ManualTimeMeter::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let cache = ApiKeyCache::new(store.clone(), clock.clone(), 60);
        (cache, store, clock)
    }

    #[tokio::test]
    async fn second_get_within_ttl_hits_cache() {
        let (cache, store, _) = cache_with(Some(info("sk_a", 5)));

        assert!(cache.get("sk_a").await.unwrap().is_some());
        assert!(cache.get("sk_a").await.unwrap().is_some());
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let (cache, store, clock) = cache_with(Some(info("sk_a", 5)));

        cache.get("sk_a").await.unwrap();
        clock.advance(std::time::Duration::from_secs(61));
        cache.get("sk_a").await.unwrap();
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test]
    async fn negative_entries_are_cached_too() {
        let (cache, store, _) = cache_with(None);

        assert!(cache.get("sk_missing").await.unwrap().is_none());
        assert!(cache.get("sk_missing").await.unwrap().is_none());
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let (cache, store, _) = cache_with(Some(info("sk_a", 5)));

        cache.get("sk_a").await.unwrap();
        store.set(Some(info("sk_a", 20)));

        // Without invalidation the stale value is served.
        assert_eq!(
            cache.get("sk_a").await.unwrap().unwrap().requests_per_second,
            5
        );

        cache.invalidate("sk_a");
        assert_eq!(
            cache.get("sk_a").await.unwrap().unwrap().requests_per_second,
            20
        );
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test]
    async fn invalidate_all_clears_everything() {
        let (cache, store, _) = cache_with(Some(info("sk_a", 5)));

        cache.get("sk_a").await.unwrap();
        cache.get("sk_b").await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());

        cache.get("sk_a").await.unwrap();
        assert_eq!(store.lookups(), 3);
    }
}
