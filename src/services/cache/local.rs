//! Bounded in-process LRU tier

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct LocalEntry {
    value: Arc<serde_json::Value>,
    expires_at: Instant,
    tags: Vec<String>,
    tick: u64,
}

#[derive(Default)]
struct LocalInner {
    entries: HashMap<String, LocalEntry>,
    // access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tags: HashMap<String, HashSet<String>>,
    tick: u64,
    evictions: u64,
}

impl LocalInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<LocalEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        let oldest = self.recency.iter().next().map(|(_, key)| key.clone());
        if let Some(key) = oldest {
            self.remove(&key);
            self.evictions += 1;
        }
    }
}

pub struct LocalCache {
    inner: Mutex<LocalInner>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LocalInner::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalInner> {
        // recover from a poisoned lock, the map is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            inner.remove(key);
            return None;
        }

        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let value = entry.value.clone();
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key.to_string());
        Some(value)
    }

    pub fn insert(&self, key: &str, value: serde_json::Value, ttl: Duration, tags: &[String]) {
        if ttl.is_zero() {
            return;
        }
        let mut inner = self.lock();
        inner.remove(key);

        while inner.entries.len() >= self.max_entries {
            inner.evict_oldest();
        }

        let tick = inner.next_tick();
        for tag in tags {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        inner.recency.insert(tick, key.to_string());
        inner.entries.insert(
            key.to_string(),
            LocalEntry {
                value: Arc::new(value),
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
                tick,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.remaining_ttl(key).is_some()
    }

    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.lock();
        let entry = inner.entries.get(key)?;
        let remaining = entry.expires_at.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Remove every entry carrying any of `tags`, returning the removed keys.
    pub fn invalidate_tags(&self, tags: &[String]) -> Vec<String> {
        let mut inner = self.lock();
        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|tag| inner.tags.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();

        keys.into_iter()
            .filter(|key| inner.remove(key).is_some())
            .collect()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.iter().filter(|key| inner.remove(key).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = LocalCache::new(2);
        cache.insert("a", json!(1), Duration::from_secs(60), &[]);
        cache.insert("b", json!(2), Duration::from_secs(60), &[]);
        // touch "a" so "b" becomes the oldest
        assert!(cache.get("a").is_some());
        cache.insert("c", json!(3), Duration::from_secs(60), &[]);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = LocalCache::new(10);
        cache.insert("a", json!("x"), Duration::from_secs(5), &[]);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn tag_invalidation_only_touches_tagged_keys() {
        let cache = LocalCache::new(10);
        cache.insert("k1", json!(1), Duration::from_secs(60), &tags(&["models", "acme"]));
        cache.insert("k2", json!(2), Duration::from_secs(60), &tags(&["models", "globex"]));
        cache.insert("k3", json!(3), Duration::from_secs(60), &tags(&["deployments"]));

        let mut removed = cache.invalidate_tags(&tags(&["acme"]));
        removed.sort();
        assert_eq!(removed, vec!["k1".to_string()]);
        assert!(cache.get("k2").is_some());
        assert!(cache.get("k3").is_some());

        assert_eq!(cache.invalidate_tags(&tags(&["models", "deployments"])).len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn replacing_an_entry_drops_old_tags() {
        let cache = LocalCache::new(10);
        cache.insert("k", json!(1), Duration::from_secs(60), &tags(&["old"]));
        cache.insert("k", json!(2), Duration::from_secs(60), &tags(&["new"]));

        assert!(cache.invalidate_tags(&tags(&["old"])).is_empty());
        assert_eq!(*cache.get("k").unwrap(), json!(2));
    }
}
