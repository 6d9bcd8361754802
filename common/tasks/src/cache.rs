use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::backoff::ExponentialBackoff;
use crate::looper::Looper;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_used: Instant,
}

/// Bounded TTL cache keyed by opaque string.
///
/// Entries past their TTL are still readable through `get_stale` until a
/// sweep evicts them; insertion past `max_entries` evicts the least recently
/// used entry.
#[derive(Clone)]
pub struct ExpiringCache<V> {
    inner: Arc<RwLock<HashMap<String, Entry<V>>>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        if !guard.contains_key(&key) && guard.len() >= self.max_entries {
            Self::evict_one(&mut guard, now);
        }
        guard.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_used: now,
            },
        );
    }

    /// Returns the value only while it is fresh.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.get_stale(key) {
            Some((value, false)) => Some(value),
            _ => None,
        }
    }

    /// Returns the value together with an expired flag, so callers can serve
    /// stale entries while refreshing them.
    pub fn get_stale(&self, key: &str) -> Option<(V, bool)> {
        let now = Instant::now();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        let entry = guard.get_mut(key)?;
        entry.last_used = now;
        Some((entry.value.clone(), entry.expires_at <= now))
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        before - guard.len()
    }

    /// Periodic eviction loop; cancel by closing the returned Looper.
    pub fn spawn_sweeper(&self, interval: Duration) -> Looper {
        let cache = self.clone();
        Looper::spawn(
            "cache-sweep",
            interval,
            ExponentialBackoff::default(),
            move |_cancel| {
                let cache = cache.clone();
                async move {
                    cache.evict_expired();
                    Ok::<(), SweepNever>(())
                }
            },
            |_err| Ok(()),
        )
    }

    fn evict_one(entries: &mut HashMap<String, Entry<V>>, now: Instant) {
        // Prefer expired entries; otherwise drop the least recently used.
        let victim = entries
            .iter()
            .min_by_key(|(_, entry)| {
                if entry.expires_at <= now {
                    (0, entry.last_used)
                } else {
                    (1, entry.last_used)
                }
            })
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }
}

#[derive(Debug)]
enum SweepNever {}

impl std::fmt::Display for SweepNever {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {}
    }
}
