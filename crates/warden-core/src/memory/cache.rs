//! Tier 1: bounded in-process context cache, least-recently-used eviction.
//!
//! Volatile by design; lost on restart. Shared by all concurrent requests under
//! simple mutual exclusion. Values are scrubbed before insertion like every
//! other tier.

use super::filter::clean_telemetry;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct LruInner {
    capacity: usize,
    data: HashMap<String, String>,
    // Recency order: front = least recently used.
    order: VecDeque<String>,
}

impl LruInner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

/// Bounded LRU cache for immediate context. Capacity is a record count.
pub struct ContextCache {
    inner: Mutex<LruInner>,
}

impl ContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                capacity: capacity.max(1),
                data: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Insert a value, evicting the least recently used record at capacity.
    pub fn put(&self, key: &str, value: &str) {
        let value = clean_telemetry(value);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !inner.data.contains_key(key) && inner.data.len() >= inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.data.remove(&evicted);
            }
        }
        inner.data.insert(key.to_string(), value);
        inner.touch(key);
    }

    /// Fetch a value, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.data.contains_key(key) {
            inner.touch(key);
            return inner.data.get(key).cloned();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.data.clear();
        inner.order.clear();
    }
}
