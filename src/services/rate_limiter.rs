//! Per-organization request scheduler
//!
//! Admits outbound provider calls so that per-organization and global
//! throughput stay inside configured limits:
//! - token reservoir per organization, refilled on a fixed interval
//! - priority queue (lower value first, FIFO among equals)
//! - per-organization overflow policy past a high-water mark
//! - corrections from provider `x-ratelimit-*` / `retry-after` headers
//!
//! Waiting is cooperative: a queued caller sleeps until either its ticket is
//! admitted or the bucket's next refill, at which point it drains the queue
//! on behalf of everyone waiting.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock, Semaphore};
use tokio::time::Instant;

use crate::connectors::ConnectorError;

/// Default priority when the caller does not care
pub const DEFAULT_PRIORITY: u8 = 5;

const GLOBAL_BUCKET: &str = "__global__";

/// What happens when a bucket's queue grows past its high-water mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Reject the newly submitted task
    #[default]
    Reject,
    /// Keep queueing, the caller waits
    Block,
    /// Drop the oldest lowest-priority queued task to make room
    Leak,
}

/// Reservoir settings for one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Maximum tokens held by the reservoir
    pub capacity: u32,
    /// Tokens added every refill interval
    pub refill_amount: u32,
    /// Refill period in milliseconds, 0 disables refill
    pub refill_interval_ms: u64,
    /// Queue length above which the overflow strategy applies
    pub high_water: Option<usize>,
    pub overflow: OverflowStrategy,
    /// Admitted tasks allowed to run at the same time
    pub max_concurrent: Option<usize>,
}

impl BucketConfig {
    fn refill_interval(&self) -> Option<Duration> {
        if self.refill_interval_ms == 0 || self.refill_amount == 0 {
            None
        } else {
            Some(Duration::from_millis(self.refill_interval_ms))
        }
    }
}

impl Default for BucketConfig {
    /// Conservative policy for organizations nobody configured
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_amount: 5,
            refill_interval_ms: 1_000,
            high_water: Some(100),
            overflow: OverflowStrategy::Reject,
            max_concurrent: Some(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Used for any organization without its own entry
    pub default: BucketConfig,
    pub organizations: HashMap<String, BucketConfig>,
    /// Shared ceiling across all organizations
    pub global: Option<BucketConfig>,
    /// Poll period of `wait_for_capacity`
    pub poll_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default: BucketConfig::default(),
            organizations: HashMap::new(),
            global: None,
            poll_interval_ms: 50,
        }
    }
}

/// Quota state reported by the provider alongside a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the provider window resets
    pub reset: Option<Duration>,
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Parse `x-ratelimit-*` and `retry-after` headers. Returns `None` when
    /// the response carries none of them.
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let header = |key: &str| -> Option<String> {
            headers
                .get(key)?
                .to_str()
                .ok()
                .map(|s| s.trim().to_string())
        };

        let info = Self {
            limit: header("x-ratelimit-limit").and_then(|s| s.parse().ok()),
            remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
            reset: header("x-ratelimit-reset").and_then(|s| parse_reset(&s)),
            retry_after: header("retry-after").and_then(|s| parse_retry_after(&s)),
        };

        if info == Self::default() {
            None
        } else {
            Some(info)
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_after.is_some() || self.remaining == Some(0)
    }
}

/// Upper bound on any provider-supplied delay
pub const MAX_PROVIDER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Non-finite, negative and overflowing values are rejected, the rest clamped.
fn bounded_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    if secs >= MAX_PROVIDER_DELAY.as_secs_f64() {
        return Some(MAX_PROVIDER_DELAY);
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// `x-ratelimit-reset` is either seconds-until-reset or an epoch timestamp.
fn parse_reset(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if secs > 1_000_000_000.0 {
        let now = chrono::Utc::now().timestamp() as f64;
        return bounded_secs((secs - now).max(0.0));
    }
    bounded_secs(secs)
}

/// `retry-after` is either delta-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<f64>() {
        return bounded_secs(secs);
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO).min(MAX_PROVIDER_DELAY))
}

/// Per-call scheduling options
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// 0 is most urgent, 9 least
    pub priority: u8,
    /// Tokens consumed on admission
    pub weight: u32,
    /// Upper bound on the task's execution once admitted
    pub timeout: Option<Duration>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            weight: 1,
            timeout: None,
        }
    }
}

impl ScheduleOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("queue for {organization} is full ({queued} waiting)")]
    QueueFull { organization: String, queued: usize },
    #[error("queued request for {organization} was dropped to make room")]
    Dropped { organization: String },
    #[error("weight {weight} exceeds reservoir capacity {capacity} for {organization}")]
    WeightExceedsCapacity {
        organization: String,
        weight: u32,
        capacity: u32,
    },
    #[error("task for {organization} exceeded {timeout:?}")]
    TimedOut {
        organization: String,
        timeout: Duration,
    },
    #[error("rate limiter is stopped")]
    Stopped,
}

impl From<RateLimitError> for ConnectorError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::TimedOut { .. } => ConnectorError::Timeout(err.to_string()),
            RateLimitError::Stopped => ConnectorError::Internal(err.to_string()),
            other => ConnectorError::rate_limited(other.to_string()),
        }
    }
}

struct Ticket {
    priority: u8,
    seq: u64,
    weight: u32,
    notify: oneshot::Sender<Result<(), RateLimitError>>,
}

// BinaryHeap is a max-heap: the "greatest" ticket has the lowest priority
// value and, among equals, the lowest sequence number.
impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ticket {}

struct BucketState {
    config: BucketConfig,
    tokens: u32,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    queue: BinaryHeap<Ticket>,
    concurrency: Option<Arc<Semaphore>>,
    stopped: bool,
}

impl BucketState {
    fn new(config: BucketConfig) -> Self {
        let concurrency = config.max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            tokens: config.capacity,
            last_refill: Instant::now(),
            blocked_until: None,
            queue: BinaryHeap::new(),
            concurrency,
            stopped: false,
            config,
        }
    }

    fn reconfigure(&mut self, config: BucketConfig) {
        self.tokens = self.tokens.min(config.capacity);
        if config.max_concurrent != self.config.max_concurrent {
            self.concurrency = config.max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        }
        self.config = config;
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.blocked_until {
            if now < until {
                return;
            }
            self.blocked_until = None;
            self.tokens = self.config.capacity;
            self.last_refill = until;
        }

        let Some(interval) = self.config.refill_interval() else {
            return;
        };
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_nanos() / interval.as_nanos()).min(u32::MAX as u128) as u32;
        if periods == 0 {
            return;
        }
        self.tokens = self
            .tokens
            .saturating_add(periods.saturating_mul(self.config.refill_amount))
            .min(self.config.capacity);
        self.last_refill += interval * periods;
    }

    fn block_for(&mut self, now: Instant, delay: Duration) {
        let until = now + delay.min(MAX_PROVIDER_DELAY);
        self.tokens = 0;
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn next_wake(&self) -> Option<Instant> {
        if let Some(until) = self.blocked_until {
            return Some(until);
        }
        self.config
            .refill_interval()
            .map(|interval| self.last_refill + interval)
    }

    /// Admit queued tickets in priority order while tokens last. Returns
    /// the sequence numbers admitted.
    fn drain(&mut self, now: Instant) -> Vec<u64> {
        self.refill(now);
        let mut admitted = Vec::new();
        loop {
            let admissible = match self.queue.peek() {
                Some(head) => self.blocked_until.is_none() && self.tokens >= head.weight,
                None => false,
            };
            if !admissible {
                break;
            }
            let Some(ticket) = self.queue.pop() else {
                break;
            };
            self.tokens -= ticket.weight;
            if ticket.notify.send(Ok(())).is_err() {
                // caller went away while queued
                self.tokens += ticket.weight;
                continue;
            }
            admitted.push(ticket.seq);
        }
        admitted
    }

    /// Remove the oldest ticket among those with the lowest priority
    fn evict_lowest(&mut self) -> Option<Ticket> {
        let victim = self
            .queue
            .iter()
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.seq.cmp(&a.seq)))
            .map(|t| t.seq)?;
        let mut remaining = BinaryHeap::with_capacity(self.queue.len());
        let mut evicted = None;
        for ticket in std::mem::take(&mut self.queue) {
            if ticket.seq == victim {
                evicted = Some(ticket);
            } else {
                remaining.push(ticket);
            }
        }
        self.queue = remaining;
        evicted
    }
}

#[derive(Default)]
struct BucketCounters {
    admitted: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Bucket {
    name: String,
    state: Mutex<BucketState>,
    seq: AtomicU64,
    counters: BucketCounters,
}

impl Bucket {
    fn new(name: &str, config: BucketConfig) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BucketState::new(config)),
            seq: AtomicU64::new(0),
            counters: BucketCounters::default(),
        }
    }

    async fn refund(&self, weight: u32) {
        let mut state = self.state.lock().await;
        state.tokens = state.tokens.saturating_add(weight).min(state.config.capacity);
        state.drain(Instant::now());
    }

    /// Wait until a ticket of `options.weight` is admitted by this bucket.
    async fn acquire(&self, options: &ScheduleOptions) -> Result<(), RateLimitError> {
        let (tx, mut rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Err(RateLimitError::Stopped);
            }
            if options.weight > state.config.capacity {
                self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(RateLimitError::WeightExceedsCapacity {
                    organization: self.name.clone(),
                    weight: options.weight,
                    capacity: state.config.capacity,
                });
            }

            state.queue.retain(|t| !t.notify.is_closed());
            state.queue.push(Ticket {
                priority: options.priority,
                seq,
                weight: options.weight,
                notify: tx,
            });
            let admitted = state.drain(Instant::now());

            if !admitted.contains(&seq) {
                if let Some(high_water) = state.config.high_water {
                    if state.queue.len() > high_water {
                        self.apply_overflow(&mut state, seq)?;
                    }
                }
                self.counters.queued.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::debug!(
                    organization = %self.name,
                    priority = options.priority,
                    weight = options.weight,
                    queued = state.queue.len(),
                    "Request queued by rate limiter"
                );
            }
        }

        loop {
            let wake = self.state.lock().await.next_wake();
            match wake {
                Some(at) => {
                    tokio::select! {
                        res = &mut rx => return res.unwrap_or(Err(RateLimitError::Stopped)),
                        _ = tokio::time::sleep_until(at) => {
                            self.state.lock().await.drain(Instant::now());
                        }
                    }
                }
                None => return (&mut rx).await.unwrap_or(Err(RateLimitError::Stopped)),
            }
        }
    }

    fn apply_overflow(&self, state: &mut BucketState, seq: u64) -> Result<(), RateLimitError> {
        let queue_full = || RateLimitError::QueueFull {
            organization: self.name.clone(),
            queued: state.queue.len() - 1,
        };
        match state.config.overflow {
            OverflowStrategy::Block => Ok(()),
            OverflowStrategy::Reject => {
                let err = queue_full();
                state.queue.retain(|t| t.seq != seq);
                self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::warn!(organization = %self.name, "Rate limiter queue full, rejecting request");
                Err(err)
            }
            OverflowStrategy::Leak => {
                let err = queue_full();
                match state.evict_lowest() {
                    Some(victim) if victim.seq == seq => {
                        self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                        Err(err)
                    }
                    Some(victim) => {
                        self.counters.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                        tracing::warn!(
                            organization = %self.name,
                            dropped_priority = victim.priority,
                            "Rate limiter queue full, dropping queued request"
                        );
                        let _ = victim.notify.send(Err(RateLimitError::Dropped {
                            organization: self.name.clone(),
                        }));
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        }
    }
}

/// Counters and reservoir state of one organization
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub organization: String,
    pub available_tokens: u32,
    pub capacity: u32,
    pub queued: usize,
    pub blocked_for_ms: Option<u64>,
    pub admitted: u64,
    pub total_queued: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Two-level (organization, then optional global) request scheduler
pub struct RateLimiter {
    config: RwLock<RateLimiterConfig>,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    global: Option<Arc<Bucket>>,
    stopped: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let global = config
            .global
            .clone()
            .map(|cfg| Arc::new(Bucket::new(GLOBAL_BUCKET, cfg)));
        Self {
            config: RwLock::new(config),
            buckets: RwLock::new(HashMap::new()),
            global,
            stopped: AtomicBool::new(false),
        }
    }

    async fn bucket(&self, organization: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().await.get(organization) {
            return bucket.clone();
        }

        let config = {
            let config = self.config.read().await;
            match config.organizations.get(organization) {
                Some(cfg) => cfg.clone(),
                None => {
                    tracing::debug!(organization, "No rate limit configured, using default policy");
                    config.default.clone()
                }
            }
        };

        self.buckets
            .write()
            .await
            .entry(organization.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(organization, config)))
            .clone()
    }

    /// Replace an organization's policy at runtime. Queued tasks are kept.
    pub async fn configure_organization(&self, organization: &str, config: BucketConfig) {
        self.config
            .write()
            .await
            .organizations
            .insert(organization.to_string(), config.clone());

        let existing = self.buckets.read().await.get(organization).cloned();
        if let Some(bucket) = existing {
            let mut state = bucket.state.lock().await;
            state.reconfigure(config);
            state.drain(Instant::now());
        }
        tracing::info!(organization, "Rate limit policy updated");
    }

    /// Run `task` once the organization (and global) reservoirs admit it.
    ///
    /// The task's own error is returned untouched; limiter rejections are
    /// converted through `E: From<RateLimitError>`.
    pub async fn schedule<T, E, F, Fut>(
        &self,
        organization: &str,
        options: ScheduleOptions,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitError>,
    {
        if self.stopped.load(AtomicOrdering::SeqCst) {
            return Err(RateLimitError::Stopped.into());
        }

        let bucket = self.bucket(organization).await;
        bucket.acquire(&options).await?;

        if let Some(global) = &self.global {
            if let Err(err) = global.acquire(&options).await {
                bucket.refund(options.weight).await;
                return Err(err.into());
            }
        }

        let semaphore = bucket.state.lock().await.concurrency.clone();
        let _permit = match semaphore {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RateLimitError::Stopped)?,
            ),
            None => None,
        };

        bucket.counters.admitted.fetch_add(1, AtomicOrdering::Relaxed);

        let result = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, task()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(organization, timeout_ms = limit.as_millis() as u64, "Scheduled task timed out");
                    Err(RateLimitError::TimedOut {
                        organization: organization.to_string(),
                        timeout: limit,
                    }
                    .into())
                }
            },
            None => task().await,
        };

        let counter = if result.is_ok() {
            &bucket.counters.completed
        } else {
            &bucket.counters.failed
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);

        result
    }

    /// Correct the local reservoir from what the provider reported.
    ///
    /// `retry_after` (or exhausted `remaining` with a `reset`) empties the
    /// reservoir and suspends refill until the delay elapses.
    #[tracing::instrument(name = "RateLimiter::update_from_response", skip(self))]
    pub async fn update_rate_limit_from_response(&self, organization: &str, info: &RateLimitInfo) {
        let bucket = self.bucket(organization).await;
        let mut state = bucket.state.lock().await;
        let now = Instant::now();
        state.refill(now);

        match (info.retry_after, info.remaining, info.reset) {
            (Some(delay), _, _) => {
                tracing::warn!(organization, retry_after_ms = delay.as_millis() as u64, "Provider asked us to back off");
                state.block_for(now, delay);
            }
            (None, Some(0), Some(reset)) => state.block_for(now, reset),
            (None, Some(0), None) => state.tokens = 0,
            (None, Some(remaining), _) => {
                state.tokens = remaining.min(state.config.capacity);
            }
            (None, None, _) => {}
        }

        state.drain(now);
    }

    /// Poll until the organization has at least one token free and nothing
    /// queued ahead, or the timeout elapses.
    pub async fn wait_for_capacity(&self, organization: &str, timeout: Duration) -> bool {
        let bucket = self.bucket(organization).await;
        let poll = Duration::from_millis(self.config.read().await.poll_interval_ms.max(1));
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = bucket.state.lock().await;
                let now = Instant::now();
                state.refill(now);
                if state.blocked_until.is_none() && state.tokens > 0 && state.queue.is_empty() {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    pub async fn queued(&self, organization: &str) -> usize {
        self.bucket(organization).await.state.lock().await.queue.len()
    }

    pub async fn available_tokens(&self, organization: &str) -> u32 {
        let bucket = self.bucket(organization).await;
        let mut state = bucket.state.lock().await;
        state.refill(Instant::now());
        state.tokens
    }

    pub async fn stats(&self, organization: &str) -> RateLimiterStats {
        let bucket = self.bucket(organization).await;
        let mut state = bucket.state.lock().await;
        let now = Instant::now();
        state.refill(now);
        let counters = &bucket.counters;

        RateLimiterStats {
            organization: organization.to_string(),
            available_tokens: state.tokens,
            capacity: state.config.capacity,
            queued: state.queue.len(),
            blocked_for_ms: state
                .blocked_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            admitted: counters.admitted.load(AtomicOrdering::Relaxed),
            total_queued: counters.queued.load(AtomicOrdering::Relaxed),
            rejected: counters.rejected.load(AtomicOrdering::Relaxed),
            dropped: counters.dropped.load(AtomicOrdering::Relaxed),
            completed: counters.completed.load(AtomicOrdering::Relaxed),
            failed: counters.failed.load(AtomicOrdering::Relaxed),
        }
    }

    pub async fn organizations(&self) -> Vec<String> {
        self.buckets.read().await.keys().cloned().collect()
    }

    /// Reject everything queued and refuse new work
    pub async fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        let mut buckets: Vec<Arc<Bucket>> = self.buckets.read().await.values().cloned().collect();
        if let Some(global) = &self.global {
            buckets.push(global.clone());
        }

        for bucket in buckets {
            let mut state = bucket.state.lock().await;
            state.stopped = true;
            for ticket in std::mem::take(&mut state.queue) {
                let _ = ticket.notify.send(Err(RateLimitError::Stopped));
            }
            if let Some(semaphore) = &state.concurrency {
                semaphore.close();
            }
        }
        tracing::info!("Rate limiter stopped");
    }
}
