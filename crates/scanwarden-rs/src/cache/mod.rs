//! Short-lived memoization of expensive read queries.
//!
//! Entries expire after their TTL and the map is bounded; on overflow the
//! oldest inserted key goes first, regardless of how often it was read.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

pub const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    /// Bumped by every invalidation.
    generation: u64,
}

impl Inner {
    fn insert(&mut self, key: String, value: Value, ttl: Duration, max_entries: usize) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = entry;
            return;
        }
        while self.entries.len() >= max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

#[derive(Debug)]
pub struct ResultCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            None => return None,
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // expired
        inner.remove(key);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.inner.lock().insert(key.into(), value, ttl, self.max_entries);
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.remove(key);
    }

    /// Drops every key containing `pattern`.
    pub fn invalidate_pattern(&self, pattern: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.retain(|k, _| !k.contains(pattern));
        inner.order.retain(|k| !k.contains(pattern));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    /// The lock is not held while `fetch` runs. A value fetched across an
    /// invalidation is returned but not stored.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, ttl: Duration, fetch: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let generation = self.inner.lock().generation;
        let value = fetch().await?;
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.insert(key.to_string(), value.clone(), ttl, self.max_entries);
        }
        Ok(value)
    }
}
