//! Two-tier response cache
//!
//! Tier 1 is a bounded in-process LRU, tier 2 an optional distributed
//! backend (Redis in production). Reads go local first and promote tier-2
//! hits; writes populate both. Every key is scoped by organization.
//!
//! Tier-2 failures never fail a cache call: they are logged, counted and
//! flip the `is_connected` signal until the backend answers again.

mod distributed;
mod local;
mod redis_cache;

pub use self::distributed::{DistributedCache, InMemoryDistributedCache};
pub use self::local::LocalCache;
pub use self::redis_cache::RedisCache;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::connectors::ConnectorError;
use crate::helpers::compressor;

const FORMAT_JSON: u8 = b'j';
const FORMAT_BROTLI: u8 = b'b';

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("Cache encode failed: {0}")]
    Encode(String),
    #[error("Cache decode failed: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<CacheError> for ConnectorError {
    fn from(err: CacheError) -> Self {
        ConnectorError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// First segment of every physical key
    #[serde(default = "CacheConfig::default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "CacheConfig::default_local_max_entries")]
    pub local_max_entries: usize,
    /// Upper bound on how long tier 1 keeps anything
    #[serde(default = "CacheConfig::default_local_ttl")]
    pub local_ttl_secs: u64,
    /// Tier-2 TTL when the caller gives none
    #[serde(default = "CacheConfig::default_distributed_ttl")]
    pub distributed_ttl_secs: u64,
    /// Serialized values above this many bytes are brotli-compressed in tier 2
    #[serde(default = "CacheConfig::default_compression_threshold")]
    pub compression_threshold: usize,
    /// Redis connection string, tier 2 is disabled when absent
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Per-operation TTL overrides in seconds
    #[serde(default)]
    pub operation_ttls: HashMap<String, u64>,
}

impl CacheConfig {
    fn default_key_prefix() -> String {
        "modelgate".to_string()
    }

    const fn default_local_max_entries() -> usize {
        1_000
    }

    const fn default_local_ttl() -> u64 {
        300
    }

    const fn default_distributed_ttl() -> u64 {
        3_600
    }

    const fn default_compression_threshold() -> usize {
        1_024
    }

    /// TTL for an operation's cached result
    pub fn ttl_for(&self, operation: &str) -> Duration {
        Duration::from_secs(
            self.operation_ttls
                .get(operation)
                .copied()
                .unwrap_or(self.distributed_ttl_secs),
        )
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: Self::default_key_prefix(),
            local_max_entries: Self::default_local_max_entries(),
            local_ttl_secs: Self::default_local_ttl(),
            distributed_ttl_secs: Self::default_distributed_ttl(),
            compression_threshold: Self::default_compression_threshold(),
            redis_url: None,
            operation_ttls: HashMap::new(),
        }
    }
}

/// Options for a single write
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Tier-2 envelope. Tags travel with the value so promotion into tier 1
/// keeps the entry reachable by tag invalidation.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    tags: Vec<String>,
    expires_at_ms: i64,
    value: serde_json::Value,
}

fn encode_entry(entry: &StoredEntry, threshold: usize) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(entry).map_err(|err| CacheError::Encode(err.to_string()))?;
    if json.len() <= threshold {
        let mut payload = Vec::with_capacity(json.len() + 1);
        payload.push(FORMAT_JSON);
        payload.extend_from_slice(&json);
        return Ok(payload);
    }

    let packed = compressor::compress(&json).map_err(|err| CacheError::Encode(err.to_string()))?;
    let mut payload = Vec::with_capacity(packed.len() + 1);
    payload.push(FORMAT_BROTLI);
    payload.extend_from_slice(&packed);
    Ok(payload)
}

fn decode_entry(payload: &[u8]) -> Result<StoredEntry, CacheError> {
    let (marker, body) = payload
        .split_first()
        .ok_or_else(|| CacheError::Decode("empty payload".to_string()))?;

    let json = match *marker {
        FORMAT_JSON => body.to_vec(),
        FORMAT_BROTLI => compressor::decompress(body).map_err(|err| CacheError::Decode(err.to_string()))?,
        other => return Err(CacheError::Decode(format!("unknown format marker {:#04x}", other))),
    };

    serde_json::from_slice(&json).map_err(|err| CacheError::Decode(err.to_string()))
}

#[derive(Default)]
struct CacheCounters {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    distributed_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub local_entries: usize,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub distributed_errors: u64,
    pub distributed_backend: Option<&'static str>,
    pub distributed_connected: bool,
}

pub struct CacheService {
    config: CacheConfig,
    local: LocalCache,
    distributed: RwLock<Option<Arc<dyn DistributedCache>>>,
    connected: AtomicBool,
    counters: CacheCounters,
}

impl CacheService {
    pub fn new(config: CacheConfig, distributed: Option<Arc<dyn DistributedCache>>) -> Self {
        let connected = distributed.is_some();
        Self {
            local: LocalCache::new(config.local_max_entries),
            config,
            distributed: RwLock::new(distributed),
            connected: AtomicBool::new(connected),
            counters: CacheCounters::default(),
        }
    }

    /// Local-only cache, used when no distributed tier is configured
    pub fn local_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    /// Build from configuration, connecting to Redis when a URL is set.
    /// A Redis outage at startup leaves the service in local-only mode.
    pub async fn init(config: CacheConfig) -> Self {
        let distributed: Option<Arc<dyn DistributedCache>> = match &config.redis_url {
            Some(url) => match RedisCache::new(url, &config.key_prefix).await {
                Ok(cache) => {
                    tracing::info!("Distributed cache connected");
                    Some(Arc::new(cache))
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Distributed cache unavailable, running local-only");
                    None
                }
            },
            None => None,
        };
        Self::new(config, distributed)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key as stored in both tiers, scoped to the organization
    pub fn physical_key(&self, organization: &str, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, organization, key)
    }

    fn tier2(&self) -> Option<Arc<dyn DistributedCache>> {
        self.distributed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn note_failure(&self, action: &str, err: &CacheError) {
        self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %err, action, "Distributed cache disconnected");
        } else {
            tracing::debug!(error = %err, action, "Distributed cache call failed");
        }
    }

    fn note_success(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("Distributed cache reconnected");
        }
    }

    fn local_ttl(&self, ttl: Duration) -> Duration {
        ttl.min(Duration::from_secs(self.config.local_ttl_secs))
    }

    pub async fn get<T: DeserializeOwned>(&self, organization: &str, key: &str) -> Option<T> {
        let physical = self.physical_key(organization, key);

        if let Some(value) = self.local.get(&physical) {
            match serde_json::from_value::<T>((*value).clone()) {
                Ok(decoded) => {
                    self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(decoded);
                }
                Err(err) => {
                    tracing::debug!(error = %err, cache_key = %physical, "Local cache entry has unexpected shape");
                    self.local.remove(&physical);
                }
            }
        }

        if let Some(tier2) = self.tier2() {
            match tier2.get(&physical).await {
                Ok(Some(payload)) => {
                    self.note_success();
                    if let Some(decoded) = self.promote::<T>(&physical, &payload) {
                        self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
                        return Some(decoded);
                    }
                }
                Ok(None) => self.note_success(),
                Err(err) => self.note_failure("get", &err),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn promote<T: DeserializeOwned>(&self, physical: &str, payload: &[u8]) -> Option<T> {
        let entry = match decode_entry(payload) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, cache_key = physical, "Distributed cache entry unreadable");
                return None;
            }
        };
        let decoded = serde_json::from_value::<T>(entry.value.clone()).ok()?;

        let remaining_ms = entry.expires_at_ms - chrono::Utc::now().timestamp_millis();
        if remaining_ms > 0 {
            let ttl = self.local_ttl(Duration::from_millis(remaining_ms as u64));
            self.local.insert(physical, entry.value, ttl, &entry.tags);
        }
        Some(decoded)
    }

    pub async fn set<T: Serialize>(&self, organization: &str, key: &str, value: &T, options: SetOptions) {
        let physical = self.physical_key(organization, key);
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, cache_key = %physical, "Value not cacheable");
                return;
            }
        };
        let ttl = options
            .ttl
            .unwrap_or_else(|| Duration::from_secs(self.config.distributed_ttl_secs));
        if ttl.is_zero() {
            return;
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.local
            .insert(&physical, value.clone(), self.local_ttl(ttl), &options.tags);

        let Some(tier2) = self.tier2() else {
            return;
        };
        let entry = StoredEntry {
            tags: options.tags.clone(),
            expires_at_ms: chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64,
            value,
        };
        let payload = match encode_entry(&entry, self.config.compression_threshold) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(error = %err, cache_key = %physical, "Cache encode failed");
                return;
            }
        };
        match tier2.set(&physical, payload, ttl, &options.tags).await {
            Ok(()) => self.note_success(),
            Err(err) => self.note_failure("set", &err),
        }
    }

    pub async fn delete(&self, organization: &str, key: &str) -> bool {
        let physical = self.physical_key(organization, key);
        let mut removed = self.local.remove(&physical);
        if let Some(tier2) = self.tier2() {
            match tier2.delete(&physical).await {
                Ok(deleted) => {
                    self.note_success();
                    removed |= deleted;
                }
                Err(err) => self.note_failure("delete", &err),
            }
        }
        removed
    }

    pub async fn exists(&self, organization: &str, key: &str) -> bool {
        self.ttl(organization, key).await.is_some()
    }

    /// Remaining lifetime of an entry in whichever tier holds it
    pub async fn ttl(&self, organization: &str, key: &str) -> Option<Duration> {
        let physical = self.physical_key(organization, key);
        if let Some(remaining) = self.local.remaining_ttl(&physical) {
            return Some(remaining);
        }
        let tier2 = self.tier2()?;
        match tier2.ttl(&physical).await {
            Ok(remaining) => {
                self.note_success();
                remaining
            }
            Err(err) => {
                self.note_failure("ttl", &err);
                None
            }
        }
    }

    /// Remove from both tiers every entry written with any of `tags`.
    /// Returns the number of distinct keys removed.
    #[tracing::instrument(name = "Invalidate cache tags", skip(self))]
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut removed: HashSet<String> = self.local.invalidate_tags(tags).into_iter().collect();

        if let Some(tier2) = self.tier2() {
            match tier2.invalidate_tags(tags).await {
                Ok(keys) => {
                    self.note_success();
                    for key in &keys {
                        // an entry may have been promoted after tier 1 was swept
                        self.local.remove(key);
                    }
                    removed.extend(keys);
                }
                Err(err) => self.note_failure("invalidate_tags", &err),
            }
        }

        self.counters
            .invalidations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::info!(removed = removed.len(), "Cache entries invalidated by tag");
        removed.len()
    }

    /// Drop everything cached for an organization
    pub async fn clear_organization(&self, organization: &str) -> usize {
        let prefix = format!("{}:{}:", self.config.key_prefix, organization);
        let mut removed = self.local.remove_prefix(&prefix);
        if let Some(tier2) = self.tier2() {
            match tier2.delete_prefix(&prefix).await {
                Ok(count) => {
                    self.note_success();
                    removed = removed.max(count);
                }
                Err(err) => self.note_failure("clear_organization", &err),
            }
        }
        tracing::info!(organization, removed, "Organization cache cleared");
        removed
    }

    /// Probe tier 2, updating the connection signal
    pub async fn ping(&self) -> Result<(), CacheError> {
        let Some(tier2) = self.tier2() else {
            return Err(CacheError::Unavailable("no distributed cache configured".to_string()));
        };
        match tier2.ping().await {
            Ok(()) => {
                self.note_success();
                Ok(())
            }
            Err(err) => {
                self.note_failure("ping", &err);
                Err(err)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tier2().is_some() && self.connected.load(Ordering::SeqCst)
    }

    pub fn has_distributed_tier(&self) -> bool {
        self.tier2().is_some()
    }

    /// Drop the distributed tier, continuing local-only
    pub fn disconnect(&self) {
        let previous = self
            .distributed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.connected.store(false, Ordering::SeqCst);
        if previous.is_some() {
            tracing::info!("Distributed cache detached");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let tier2 = self.tier2();
        CacheStats {
            local_entries: self.local.len(),
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            distributed_hits: self.counters.distributed_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.local.evictions(),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            distributed_errors: self.counters.distributed_errors.load(Ordering::Relaxed),
            distributed_backend: tier2.as_ref().map(|t| t.backend()),
            distributed_connected: tier2.is_some() && self.connected.load(Ordering::SeqCst),
        }
    }
}
