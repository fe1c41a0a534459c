//! Bounded routing result cache with LRU eviction and per-entry TTL.

use super::RoutingResult;
use crate::message::Message;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Cache key: routing key, exchange and custom headers, each kept separate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    routing_key: Option<String>,
    exchange: Option<String>,
    /// Sorted by header name, values in their JSON form
    headers: Vec<(String, String)>,
}

struct CacheEntry {
    result: RoutingResult,
    inserted_at: Instant,
}

/// Routing cache keyed by (routing key, exchange, sorted custom headers)
pub struct RoutingCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl RoutingCache {
    /// A zero `max_size` is treated as one entry
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cache key for a message
    pub fn key_for(message: &Message) -> CacheKey {
        CacheKey {
            routing_key: message.headers.routing_key.clone(),
            exchange: message.headers.exchange.clone(),
            headers: message
                .headers
                .sorted_custom()
                .into_iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
        }
    }

    /// Look up a live entry, evicting it if its TTL elapsed
    pub fn get(&self, key: &CacheKey) -> Option<RoutingResult> {
        let mut entries = self.entries();
        let expired = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn insert(&self, key: CacheKey, result: RoutingResult) {
        self.entries().put(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
