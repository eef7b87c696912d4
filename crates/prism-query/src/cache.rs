//! Result caching with per-entry TTL and least-recently-used eviction.
//!
//! Expiry is lazy: an entry past its TTL is removed by the read that finds it.
//! Eviction happens on write, and only when the cache is at capacity.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;

use crate::request::CacheKey;

struct CacheEntry<V> {
  value: V,
  created: Instant,
  last_access: Instant,
  ttl: Duration,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now.duration_since(self.created) >= self.ttl
  }
}

struct CacheState<V> {
  entries: LruCache<CacheKey, CacheEntry<V>>,
  hits: u64,
  misses: u64,
  evictions: u64,
  expirations: u64,
}

/// Metadata passed to invalidation predicates.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
  pub key: &'a CacheKey,
  /// Time since the entry was written.
  pub age: Duration,
  /// Time since the entry was last read or written.
  pub idle: Duration,
  pub ttl: Duration,
}

impl EntryInfo<'_> {
  pub fn model(&self) -> &str {
    self.key.model()
  }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
  pub size: usize,
  pub capacity: usize,
  pub hit_count: u64,
  pub miss_count: u64,
  pub evictions: u64,
  pub expirations: u64,
  pub oldest_entry_age: Option<Duration>,
  pub newest_entry_age: Option<Duration>,
}

/// A bounded, key-addressed store of query results.
///
/// The recency list and the counters share one mutex, so eviction always
/// picks the least recently accessed entry.
pub struct ResultCache<V> {
  capacity: usize,
  default_ttl: Duration,
  state: Mutex<CacheState<V>>,
}

impl<V: Clone> ResultCache<V> {
  /// Create a cache holding at most `capacity` entries (minimum 1).
  pub fn new(capacity: usize, default_ttl: Duration) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self {
      capacity: capacity.get(),
      default_ttl,
      state: Mutex::new(CacheState {
        entries: LruCache::new(capacity),
        hits: 0,
        misses: 0,
        evictions: 0,
        expirations: 0,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Return the cached value if present and not expired.
  ///
  /// Expired entries are removed and counted as a miss.
  pub fn get(&self, key: &CacheKey) -> Option<V> {
    let now = Instant::now();
    let mut state = self.lock();

    let expired = match state.entries.peek(key) {
      None => {
        state.misses += 1;
        return None;
      }
      Some(entry) => entry.is_expired(now),
    };

    if expired {
      state.entries.pop(key);
      state.expirations += 1;
      state.misses += 1;
      return None;
    }

    let entry = state.entries.get_mut(key)?;
    entry.last_access = now;
    let value = entry.value.clone();
    state.hits += 1;
    Some(value)
  }

  /// Insert or overwrite an entry, evicting the least recently accessed entry
  /// if the cache is full. `None` uses the default TTL.
  pub fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) {
    let now = Instant::now();
    let ttl = ttl.unwrap_or(self.default_ttl);
    let mut state = self.lock();

    let entry = CacheEntry {
      value,
      created: now,
      last_access: now,
      ttl,
    };
    // `push` hands back either the overwritten entry or the evicted one.
    if let Some((displaced, _)) = state.entries.push(key.clone(), entry) {
      if displaced != key {
        state.evictions += 1;
        tracing::debug!(key = %displaced, "cache_evicted");
      }
    }
  }

  /// Remove every entry the predicate selects. Returns the number removed.
  pub fn invalidate<F>(&self, predicate: F) -> usize
  where
    F: Fn(&EntryInfo<'_>) -> bool,
  {
    let now = Instant::now();
    let mut state = self.lock();

    let doomed: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(key, entry)| {
        predicate(&EntryInfo {
          key,
          age: now.duration_since(entry.created),
          idle: now.duration_since(entry.last_access),
          ttl: entry.ttl,
        })
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &doomed {
      state.entries.pop(key);
    }
    doomed.len()
  }

  /// Remove all entries cached for `model`.
  pub fn invalidate_model(&self, model: &str) -> usize {
    self.invalidate(|info| info.model() == model)
  }

  /// Remove all entries written more than `age` ago.
  pub fn invalidate_older_than(&self, age: Duration) -> usize {
    self.invalidate(|info| info.age > age)
  }

  pub fn clear(&self) {
    self.lock().entries.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn stats(&self) -> CacheStats {
    let now = Instant::now();
    let state = self.lock();
    let ages: Vec<Duration> = state
      .entries
      .iter()
      .map(|(_, entry)| now.duration_since(entry.created))
      .collect();

    CacheStats {
      size: state.entries.len(),
      capacity: self.capacity,
      hit_count: state.hits,
      miss_count: state.misses,
      evictions: state.evictions,
      expirations: state.expirations,
      oldest_entry_age: ages.iter().max().copied(),
      newest_entry_age: ages.iter().min().copied(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::QueryRequest;

  fn key(model: &str, dimension: &str) -> CacheKey {
    QueryRequest::new(model).dimension(dimension).cache_key()
  }

  #[tokio::test(start_paused = true)]
  async fn test_hit_before_ttl_and_miss_at_ttl() {
    let cache = ResultCache::new(10, Duration::from_secs(60));
    let k = key("orders", "region");
    cache.put(k.clone(), 1u32, Some(Duration::from_secs(10)));

    tokio::time::advance(Duration::from_millis(9_999)).await;
    assert_eq!(cache.get(&k), Some(1));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(cache.get(&k), None);
    assert_eq!(cache.len(), 0);

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.expirations, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hit_does_not_extend_ttl() {
    let cache = ResultCache::new(10, Duration::from_secs(5));
    let k = key("orders", "region");
    cache.put(k.clone(), "v", None);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(cache.get(&k).is_some());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cache.get(&k).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_removes_least_recently_accessed() {
    let cache = ResultCache::new(3, Duration::from_secs(60));
    let a = key("orders", "a");
    let b = key("orders", "b");
    let c = key("orders", "c");
    let d = key("orders", "d");

    cache.put(a.clone(), 1, None);
    cache.put(b.clone(), 2, None);
    cache.put(c.clone(), 3, None);

    // Touch `a` so `b` becomes the least recently accessed.
    assert_eq!(cache.get(&a), Some(1));
    cache.put(d.clone(), 4, None);

    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get(&b), None);
    assert_eq!(cache.get(&a), Some(1));
    assert_eq!(cache.get(&c), Some(3));
    assert_eq!(cache.get(&d), Some(4));
    assert_eq!(cache.stats().evictions, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overwrite_refreshes_value_and_timestamps() {
    let cache = ResultCache::new(2, Duration::from_secs(10));
    let a = key("orders", "a");
    let b = key("orders", "b");

    cache.put(a.clone(), 1, None);
    cache.put(b.clone(), 2, None);
    tokio::time::advance(Duration::from_secs(8)).await;

    // Overwriting `a` at capacity must not evict anything.
    cache.put(a.clone(), 10, None);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evictions, 0);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get(&a), Some(10));
    assert_eq!(cache.get(&b), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_by_model_and_age() {
    let cache = ResultCache::new(10, Duration::from_secs(600));
    cache.put(key("orders", "a"), 1, None);
    cache.put(key("orders", "b"), 2, None);
    tokio::time::advance(Duration::from_secs(30)).await;
    cache.put(key("sessions", "a"), 3, None);

    assert_eq!(cache.invalidate_model("orders"), 2);
    assert_eq!(cache.len(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    cache.put(key("orders", "c"), 4, None);
    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(cache.invalidate_older_than(Duration::from_secs(40)), 1);
    assert!(cache.get(&key("sessions", "a")).is_none());
    assert!(cache.get(&key("orders", "c")).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stats_report_entry_ages() {
    let cache = ResultCache::new(10, Duration::from_secs(600));
    assert_eq!(cache.stats().oldest_entry_age, None);

    cache.put(key("orders", "a"), 1, None);
    tokio::time::advance(Duration::from_secs(10)).await;
    cache.put(key("orders", "b"), 2, None);
    tokio::time::advance(Duration::from_secs(5)).await;

    let stats = cache.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.oldest_entry_age, Some(Duration::from_secs(15)));
    assert_eq!(stats.newest_entry_age, Some(Duration::from_secs(5)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_capacity_holds_one_entry() {
    let cache = ResultCache::new(0, Duration::from_secs(60));
    assert_eq!(cache.capacity(), 1);

    cache.put(key("orders", "a"), 1, None);
    cache.put(key("orders", "b"), 2, None);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&key("orders", "b")), Some(2));
    assert_eq!(cache.stats().evictions, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_keeps_counters() {
    let cache = ResultCache::new(4, Duration::from_secs(60));
    let a = key("orders", "a");
    cache.put(a.clone(), 1, None);
    assert_eq!(cache.get(&a), Some(1));

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.get(&a), None);

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.size, 0);
  }
}
