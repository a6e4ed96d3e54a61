use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::models::CompletionResponse;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 1000,
        }
    }
}

/// In-memory response cache keyed by request fingerprint.
///
/// Capacity eviction removes the oldest *inserted* entry. Reads do not
/// refresh an entry's position, so this is FIFO eviction rather than LRU.
/// Expired entries are dropped lazily when read, or eagerly through
/// [`ResponseCache::purge_expired`].
pub struct ResponseCache {
    config: CacheConfig,
    store: Mutex<CacheStore>,
}

#[derive(Default)]
struct CacheStore {
    items: HashMap<String, CacheItem>,
    insertion_order: VecDeque<String>,
}

struct CacheItem {
    value: CompletionResponse,
    inserted_at: Instant,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(CacheStore::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.max_entries > 0
    }

    pub async fn get(&self, key: &str) -> Option<CompletionResponse> {
        let mut store = self.store.lock().await;
        let item = store.items.get(key)?;
        if item.inserted_at.elapsed() >= self.config.ttl {
            store.remove(key);
            return None;
        }
        Some(item.value.clone())
    }

    pub async fn set(&self, key: &str, value: &CompletionResponse) {
        let mut store = self.store.lock().await;
        if store.items.contains_key(key) {
            store.remove(key);
        }

        store.items.insert(
            key.to_owned(),
            CacheItem {
                value: value.clone(),
                inserted_at: Instant::now(),
            },
        );
        store.insertion_order.push_back(key.to_owned());

        while store.items.len() > self.config.max_entries {
            let Some(oldest) = store.insertion_order.pop_front() else {
                break;
            };
            store.items.remove(&oldest);
            debug!(key = %oldest, "evicted oldest cache entry");
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let mut store = self.store.lock().await;
        let ttl = self.config.ttl;
        let expired = store
            .items
            .iter()
            .filter(|(_, item)| item.inserted_at.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            store.remove(key);
        }
        expired.len()
    }

    pub async fn clear(&self) {
        let mut store = self.store.lock().await;
        store.items.clear();
        store.insertion_order.clear();
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CacheStore {
    fn remove(&mut self, key: &str) {
        self.items.remove(key);
        self.insertion_order.retain(|candidate| candidate != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cost, FinishReason, Usage};

    fn response(id: &str) -> CompletionResponse {
        CompletionResponse {
            id: id.to_owned(),
            provider: "mock".to_owned(),
            model: "m1".to_owned(),
            content: format!("content for {id}"),
            tool_calls: None,
            usage: Usage::new(1, 1),
            cost: Cost::zero(),
            finish_reason: FinishReason::Stop,
            created: 0,
        }
    }

    fn cache(ttl_secs: u64, max_entries: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache(10, 10);
        cache.set("a", &response("a")).await;
        assert_eq!(cache.get("a").await.map(|r| r.id), Some("a".to_owned()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn evicts_oldest_inserted_entry_even_if_recently_read() {
        let cache = cache(60, 2);
        cache.set("a", &response("a")).await;
        cache.set("b", &response("b")).await;
        assert!(cache.get("a").await.is_some());

        cache.set("c", &response("c")).await;

        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn reinsert_moves_entry_to_newest_position() {
        let cache = cache(60, 2);
        cache.set("a", &response("a")).await;
        cache.set("b", &response("b")).await;
        cache.set("a", &response("a")).await;
        cache.set("c", &response("c")).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let cache = cache(10, 10);
        cache.set("old", &response("old")).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("new", &response("new")).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.get("new").await.is_some());
    }
}
