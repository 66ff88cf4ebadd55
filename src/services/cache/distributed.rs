use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::CacheError;

/// Second cache tier shared between server instances
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;
    /// Delete every key written with any of `tags`, returning the deleted keys
    async fn invalidate_tags(&self, tags: &[String]) -> Result<Vec<String>, CacheError>;
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    fn backend(&self) -> &'static str;
}

struct StoredEntry {
    value: Vec<u8>,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Default)]
struct Stored {
    entries: HashMap<String, StoredEntry>,
    tags: HashMap<String, HashSet<String>>,
}

impl Stored {
    /// Drop an entry along with its tag memberships
    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        let entry = self.entries.remove(key)?;
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

    fn live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    fn tag_count(&self) -> usize {
        self.tags.len()
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

/// Process-local stand-in for Redis, used by tests and local runs.
/// `set_available(false)` makes every call fail like a dropped connection.
pub struct InMemoryDistributedCache {
    stored: Mutex<Stored>,
    available: AtomicBool,
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self {
            stored: Mutex::new(Stored::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Number of tags with at least one member
    pub fn tag_count(&self) -> usize {
        self.lock().tag_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Stored> {
        self.stored.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("in-memory backend marked unavailable".to_string()))
        }
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let mut stored = self.lock();
        match stored.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                stored.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<(), CacheError> {
        self.check()?;
        let mut stored = self.lock();
        stored.purge_expired(Instant::now());
        stored.remove(key);
        for tag in tags {
            stored
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        stored.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        let mut stored = self.lock();
        let live = stored.live(key, Instant::now());
        Ok(stored.remove(key).is_some() && live)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.expires_at.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero()))
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<Vec<String>, CacheError> {
        self.check()?;
        let mut stored = self.lock();
        let now = Instant::now();
        let mut removed = Vec::new();
        for tag in tags {
            let Some(keys) = stored.tags.get(tag).cloned() else {
                continue;
            };
            for key in keys {
                let live = stored.live(&key, now);
                if stored.remove(&key).is_some() && live {
                    removed.push(key);
                }
            }
        }
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.check()?;
        let mut stored = self.lock();
        let now = Instant::now();
        let keys: Vec<String> = stored
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            let live = stored.live(&key, now);
            if stored.remove(&key).is_some() && live {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn overwrite_moves_the_key_to_its_new_tags() {
        let cache = InMemoryDistributedCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("k", b"1".to_vec(), ttl, &tags(&["old"])).await.unwrap();
        cache.set("k", b"2".to_vec(), ttl, &tags(&["new"])).await.unwrap();

        assert!(cache.invalidate_tags(&tags(&["old"])).await.unwrap().is_empty());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(cache.invalidate_tags(&tags(&["new"])).await.unwrap(), vec!["k".to_string()]);
        assert_eq!(cache.tag_count(), 0);
    }

    #[tokio::test]
    async fn delete_leaves_no_tag_membership_behind() {
        let cache = InMemoryDistributedCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("k", b"1".to_vec(), ttl, &tags(&["models", "acme"])).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert_eq!(cache.tag_count(), 0);

        // a later write under the same key is not swept by the old tag
        cache.set("k", b"2".to_vec(), ttl, &tags(&["deployments"])).await.unwrap();
        assert!(cache.invalidate_tags(&tags(&["models"])).await.unwrap().is_empty());
        assert!(cache.get("k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_release_their_tags() {
        let cache = InMemoryDistributedCache::new();
        cache
            .set("short", b"1".to_vec(), Duration::from_secs(1), &tags(&["models"]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        cache
            .set("long", b"2".to_vec(), Duration::from_secs(60), &tags(&["acme"]))
            .await
            .unwrap();

        assert_eq!(cache.tag_count(), 1);
        assert!(cache.invalidate_tags(&tags(&["models"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefix_delete_counts_live_entries() {
        let cache = InMemoryDistributedCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("mg:acme:a", b"1".to_vec(), ttl, &tags(&["acme"])).await.unwrap();
        cache.set("mg:acme:b", b"2".to_vec(), ttl, &[]).await.unwrap();
        cache.set("mg:globex:a", b"3".to_vec(), ttl, &tags(&["globex"])).await.unwrap();

        assert_eq!(cache.delete_prefix("mg:acme:").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.tag_count(), 1);
    }
}
