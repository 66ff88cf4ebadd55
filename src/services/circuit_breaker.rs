//! Per-operation circuit breakers
//!
//! # States
//!
//! - **Closed**: calls flow through; outcomes land in a rolling window
//! - **Open**: failure percentage crossed the threshold, calls short-circuit
//! - **HalfOpen**: after `reset_timeout`, a bounded number of trial calls
//!   decide between closing again and re-opening
//!
//! Short-circuits and counted failures go through the fallback chain: last
//! good response for the same key (if fresh enough), then the operation's
//! configured default value, then the original error.
//!
//! Only availability errors (see [`ConnectorError::counts_as_failure`])
//! move the breaker. Rate-limit, client and credential errors propagate
//! untouched.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connectors::ConnectorError;
use crate::health::{ComponentHealth, HealthMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Response cache hit, no upstream call
    Cache,
    Live,
    /// Last good response replayed by the breaker
    CachedFallback,
    /// Operation's configured default value
    DefaultFallback,
}

impl ResponseSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::CachedFallback | Self::DefaultFallback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Per-call deadline, exceeding it counts as a failure
    pub timeout_ms: u64,
    /// Failure percentage within the window that opens the circuit
    pub error_threshold_percentage: f64,
    /// Minimum calls within the window before the percentage is considered
    pub volume_threshold: u32,
    pub rolling_window_ms: u64,
    pub rolling_buckets: u32,
    /// Time spent Open before trial calls are allowed
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
    /// Successful trials needed to close again
    pub success_threshold: u32,
    /// Oldest last-good response the fallback chain will replay
    pub cache_max_age_ms: u64,
    pub fallback_enabled: bool,
    /// Served when nothing cached is fresh enough
    pub default_value: Option<serde_json::Value>,
    /// Period of the optional health probe
    pub health_check_interval_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            error_threshold_percentage: 50.0,
            volume_threshold: 10,
            rolling_window_ms: 10_000,
            rolling_buckets: 10,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
            success_threshold: 2,
            cache_max_age_ms: 300_000,
            fallback_enabled: true,
            default_value: None,
            health_check_interval_ms: None,
        }
    }
}

impl BreakerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_thresholds(mut self, volume: u32, error_percentage: f64) -> Self {
        self.volume_threshold = volume;
        self.error_threshold_percentage = error_percentage;
        self
    }

    pub fn with_reset_timeout(mut self, reset: Duration) -> Self {
        self.reset_timeout_ms = reset.as_millis() as u64;
        self
    }

    pub fn with_half_open(mut self, max_calls: u32, success_threshold: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self.success_threshold = success_threshold;
        self
    }

    pub fn with_default_value(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_health_check(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default)]
    pub default: BreakerConfig,
    /// Overrides keyed by operation name
    #[serde(default)]
    pub operations: HashMap<String, BreakerConfig>,
    /// Bound on remembered last-good responses
    #[serde(default = "CircuitBreakerSettings::default_max_fallback_entries")]
    pub max_fallback_entries: usize,
}

impl CircuitBreakerSettings {
    const fn default_max_fallback_entries() -> usize {
        1_024
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            default: BreakerConfig::default(),
            operations: HashMap::new(),
            max_fallback_entries: Self::default_max_fallback_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BreakerEvent {
    StateChanged {
        operation: String,
        from: CircuitState,
        to: CircuitState,
    },
    Rejected {
        operation: String,
    },
    Timeout {
        operation: String,
        timeout_ms: u64,
    },
    FallbackServed {
        operation: String,
        source: ResponseSource,
    },
    HealthProbeFailed {
        operation: String,
        error: String,
    },
    HealthProbeRecovered {
        operation: String,
    },
}

/// Value plus provenance
#[derive(Debug, Clone)]
pub struct BreakerOutcome<T> {
    pub value: T,
    pub source: ResponseSource,
}

#[derive(Default, Clone, Copy)]
struct WindowBucket {
    successes: u32,
    failures: u32,
    timeouts: u32,
    rejections: u32,
}

struct RollingWindow {
    buckets: VecDeque<(Instant, WindowBucket)>,
    width: Duration,
    span: Duration,
}

impl RollingWindow {
    fn new(config: &BreakerConfig) -> Self {
        let span = Duration::from_millis(config.rolling_window_ms.max(1));
        Self {
            buckets: VecDeque::new(),
            width: span / config.rolling_buckets.max(1),
            span,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((started, _)) = self.buckets.front() {
            if *started + self.span <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current(&mut self, now: Instant) -> &mut WindowBucket {
        self.prune(now);
        let fresh = matches!(self.buckets.back(), Some((started, _)) if *started + self.width > now);
        if !fresh {
            self.buckets.push_back((now, WindowBucket::default()));
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last].1
    }

    fn totals(&mut self, now: Instant) -> WindowBucket {
        self.prune(now);
        self.buckets
            .iter()
            .fold(WindowBucket::default(), |mut acc, (_, bucket)| {
                acc.successes += bucket.successes;
                acc.failures += bucket.failures;
                acc.timeouts += bucket.timeouts;
                acc.rejections += bucket.rejections;
                acc
            })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

struct InternalState {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    trial_successes: u32,
    /// Bumped on every transition so stale trials cannot touch a newer half-open phase
    generation: u64,
    last_transition_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial(u64),
}

/// Holds an admission until the call settles. A caller dropped mid-call
/// hands its half-open trial slot back.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl AdmissionGuard<'_> {
    fn settle(&mut self) -> Admission {
        self.admission.take().unwrap_or(Admission::Normal)
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            debug!(operation = %self.breaker.operation, "Caller abandoned the call");
            self.breaker.on_neutral(admission);
        }
    }
}

#[derive(Default)]
struct BreakerCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejections: AtomicU64,
    cached_fallbacks: AtomicU64,
    default_fallbacks: AtomicU64,
    transitions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub operation: String,
    pub state: CircuitState,
    pub last_transition_at: DateTime<Utc>,
    pub window_requests: u32,
    pub window_failures: u32,
    pub window_timeouts: u32,
    pub window_rejections: u32,
    pub window_error_percentage: f64,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub cached_fallbacks: u64,
    pub default_fallbacks: u64,
    pub transitions: u64,
}

/// State machine for one operation
pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    internal: Mutex<InternalState>,
    events: broadcast::Sender<BreakerEvent>,
    counters: BreakerCounters,
}

impl CircuitBreaker {
    fn new(operation: &str, config: BreakerConfig, events: broadcast::Sender<BreakerEvent>) -> Self {
        Self {
            operation: operation.to_string(),
            internal: Mutex::new(InternalState {
                state: CircuitState::Closed,
                window: RollingWindow::new(&config),
                opened_at: None,
                trials_in_flight: 0,
                trial_successes: 0,
                generation: 0,
                last_transition_at: Utc::now(),
            }),
            config,
            events,
            counters: BreakerCounters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InternalState> {
        match self.internal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(operation = %self.operation, "Circuit breaker lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn emit(&self, event: BreakerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, internal: &mut InternalState, to: CircuitState) {
        let from = internal.state;
        if from == to {
            return;
        }
        internal.state = to;
        internal.last_transition_at = Utc::now();
        internal.trials_in_flight = 0;
        internal.trial_successes = 0;
        internal.generation = internal.generation.wrapping_add(1);
        match to {
            CircuitState::Open => internal.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                internal.opened_at = None;
                internal.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitState::Open => warn!(operation = %self.operation, %from, %to, "Circuit breaker opened"),
            _ => info!(operation = %self.operation, %from, %to, "Circuit breaker state changed"),
        }
        self.emit(BreakerEvent::StateChanged {
            operation: self.operation.clone(),
            from,
            to,
        });
    }

    /// Move Open to HalfOpen once the reset timeout has elapsed
    fn refresh(&self, internal: &mut InternalState) {
        if internal.state != CircuitState::Open {
            return;
        }
        let elapsed = internal
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout())
            .unwrap_or(true);
        if elapsed {
            self.transition(internal, CircuitState::HalfOpen);
        }
    }

    fn admit(&self) -> Option<Admission> {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let mut internal = self.lock();
        self.refresh(&mut internal);

        let admission = match internal.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen if internal.trials_in_flight < self.config.half_open_max_calls.max(1) => {
                internal.trials_in_flight += 1;
                Some(Admission::Trial(internal.generation))
            }
            _ => None,
        };

        if admission.is_none() {
            internal.window.current(Instant::now()).rejections += 1;
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(operation = %self.operation, state = %internal.state, "Call short-circuited");
            self.emit(BreakerEvent::Rejected {
                operation: self.operation.clone(),
            });
        }
        admission
    }

    fn on_success(&self, admission: Admission) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        let mut internal = self.lock();
        match (admission, internal.state) {
            (Admission::Trial(generation), CircuitState::HalfOpen) if generation == internal.generation => {
                internal.trials_in_flight = internal.trials_in_flight.saturating_sub(1);
                internal.trial_successes += 1;
                if internal.trial_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut internal, CircuitState::Closed);
                }
            }
            (_, CircuitState::Closed) => {
                internal.window.current(Instant::now()).successes += 1;
            }
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission, timed_out: bool) {
        if timed_out {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut internal = self.lock();
        match (admission, internal.state) {
            (Admission::Trial(generation), CircuitState::HalfOpen) if generation == internal.generation => {
                self.transition(&mut internal, CircuitState::Open);
            }
            (_, CircuitState::Closed) => {
                let now = Instant::now();
                let bucket = internal.window.current(now);
                if timed_out {
                    bucket.timeouts += 1;
                } else {
                    bucket.failures += 1;
                }
                let totals = internal.window.totals(now);
                let requests = totals.successes + totals.failures + totals.timeouts;
                if requests >= self.config.volume_threshold {
                    let percentage = f64::from(totals.failures + totals.timeouts) * 100.0 / f64::from(requests);
                    if percentage >= self.config.error_threshold_percentage {
                        self.transition(&mut internal, CircuitState::Open);
                    }
                }
            }
            _ => {}
        }
    }

    /// Outcome that says nothing about availability
    fn on_neutral(&self, admission: Admission) {
        if let Admission::Trial(generation) = admission {
            let mut internal = self.lock();
            if internal.state == CircuitState::HalfOpen && generation == internal.generation {
                internal.trials_in_flight = internal.trials_in_flight.saturating_sub(1);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut internal = self.lock();
        self.refresh(&mut internal);
        internal.state
    }

    pub fn force(&self, state: CircuitState) {
        let mut internal = self.lock();
        self.transition(&mut internal, state);
    }

    pub fn reset(&self) {
        let mut internal = self.lock();
        self.transition(&mut internal, CircuitState::Closed);
        internal.window.clear();
    }

    pub fn stats(&self) -> BreakerStats {
        let mut internal = self.lock();
        self.refresh(&mut internal);
        let totals = internal.window.totals(Instant::now());
        let requests = totals.successes + totals.failures + totals.timeouts;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        BreakerStats {
            operation: self.operation.clone(),
            state: internal.state,
            last_transition_at: internal.last_transition_at,
            window_requests: requests,
            window_failures: totals.failures,
            window_timeouts: totals.timeouts,
            window_rejections: totals.rejections,
            window_error_percentage: if requests == 0 {
                0.0
            } else {
                f64::from(totals.failures + totals.timeouts) * 100.0 / f64::from(requests)
            },
            calls: load(&self.counters.calls),
            successes: load(&self.counters.successes),
            failures: load(&self.counters.failures),
            timeouts: load(&self.counters.timeouts),
            rejections: load(&self.counters.rejections),
            cached_fallbacks: load(&self.counters.cached_fallbacks),
            default_fallbacks: load(&self.counters.default_fallbacks),
            transitions: load(&self.counters.transitions),
        }
    }
}

/// Latest health probe result for an operation
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Probe run periodically against an operation's upstream
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ConnectorError>> + Send + Sync>;

/// Registry of breakers keyed by operation name
pub struct CircuitBreakerService {
    settings: CircuitBreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    last_good: Mutex<HashMap<String, (Instant, serde_json::Value)>>,
    events: broadcast::Sender<BreakerEvent>,
    health: Arc<HealthMetrics>,
    probes: Mutex<HashMap<String, ProbeStatus>>,
    probe_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl CircuitBreakerService {
    pub fn new(settings: CircuitBreakerSettings, health: Arc<HealthMetrics>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
            last_good: Mutex::new(HashMap::new()),
            events,
            health,
            probes: Mutex::new(HashMap::new()),
            probe_tasks: tokio::sync::Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn config_for(&self, operation: &str) -> &BreakerConfig {
        self.settings
            .operations
            .get(operation)
            .unwrap_or(&self.settings.default)
    }

    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    operation,
                    self.config_for(operation).clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    fn fallback_key(operation: &str, key: &str) -> String {
        format!("{}|{}", operation, key)
    }

    fn remember(&self, operation: &str, key: &str, value: serde_json::Value) {
        let max_entries = self.settings.max_fallback_entries.max(1);
        let mut last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
        if last_good.len() >= max_entries {
            let oldest = last_good
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                last_good.remove(&oldest);
            }
        }
        last_good.insert(Self::fallback_key(operation, key), (Instant::now(), value));
    }

    fn recall(&self, operation: &str, key: &str, max_age: Duration) -> Option<serde_json::Value> {
        let last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
        let (at, value) = last_good.get(&Self::fallback_key(operation, key))?;
        (at.elapsed() <= max_age).then(|| value.clone())
    }

    async fn guarded<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        call: F,
    ) -> Result<T, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let operation = breaker.operation.as_str();
        let admission = breaker
            .admit()
            .ok_or_else(|| ConnectorError::CircuitOpen(operation.to_string()))?;
        let mut guard = AdmissionGuard {
            breaker,
            admission: Some(admission),
        };

        let timeout = breaker.config.timeout();
        let result = tokio::time::timeout(timeout, call()).await;
        let admission = guard.settle();
        match result {
            Ok(Ok(value)) => {
                breaker.on_success(admission);
                Ok(value)
            }
            Ok(Err(err)) if err.counts_as_failure() => {
                debug!(operation, error = %err, "Call failed");
                breaker.on_failure(admission, false);
                Err(err)
            }
            Ok(Err(err)) => {
                breaker.on_neutral(admission);
                Err(err)
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Call timed out");
                breaker.on_failure(admission, true);
                breaker.emit(BreakerEvent::Timeout {
                    operation: operation.to_string(),
                    timeout_ms,
                });
                Err(ConnectorError::Timeout(format!("{} exceeded {}ms", operation, timeout_ms)))
            }
        }
    }

    /// Run a read through the breaker with the fallback chain.
    /// `fallback_key` identifies the request for last-good replay.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        fallback_key: &str,
        call: F,
    ) -> Result<BreakerOutcome<T>, ConnectorError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let breaker = self.breaker(operation);
        let err = match self.guarded(&breaker, call).await {
            Ok(value) => {
                if breaker.config.fallback_enabled {
                    match serde_json::to_value(&value) {
                        Ok(json) => self.remember(operation, fallback_key, json),
                        Err(err) => debug!(operation, error = %err, "Response not retained for fallback"),
                    }
                }
                return Ok(BreakerOutcome {
                    value,
                    source: ResponseSource::Live,
                });
            }
            Err(err) => err,
        };

        let eligible = matches!(err, ConnectorError::CircuitOpen(_)) || err.counts_as_failure();
        if !eligible || !breaker.config.fallback_enabled {
            return Err(err);
        }
        self.fallback(&breaker, fallback_key, err)
    }

    fn fallback<T: DeserializeOwned>(
        &self,
        breaker: &CircuitBreaker,
        fallback_key: &str,
        err: ConnectorError,
    ) -> Result<BreakerOutcome<T>, ConnectorError> {
        let operation = breaker.operation.as_str();
        let max_age = Duration::from_millis(breaker.config.cache_max_age_ms);

        let cached = self
            .recall(operation, fallback_key, max_age)
            .and_then(|json| serde_json::from_value::<T>(json).ok());
        let (value, source) = match cached {
            Some(value) => {
                breaker.counters.cached_fallbacks.fetch_add(1, Ordering::Relaxed);
                (value, ResponseSource::CachedFallback)
            }
            None => match breaker
                .config
                .default_value
                .clone()
                .and_then(|json| serde_json::from_value::<T>(json).ok())
            {
                Some(value) => {
                    breaker.counters.default_fallbacks.fetch_add(1, Ordering::Relaxed);
                    (value, ResponseSource::DefaultFallback)
                }
                None => return Err(err),
            },
        };

        info!(operation, ?source, error = %err, "Serving fallback response");
        breaker.emit(BreakerEvent::FallbackServed {
            operation: operation.to_string(),
            source,
        });
        Ok(BreakerOutcome { value, source })
    }

    /// Run a write through the breaker. No fallback: short-circuits and
    /// failures surface as errors.
    pub async fn execute_without_fallback<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let breaker = self.breaker(operation);
        self.guarded(&breaker, call).await
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        self.breaker(operation).state()
    }

    pub fn reset(&self, operation: &str) {
        self.breaker(operation).reset();
    }

    pub fn force_state(&self, operation: &str, state: CircuitState) {
        warn!(operation, %state, "Circuit breaker state forced");
        self.breaker(operation).force(state);
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.operation.cmp(&b.operation));
        stats
    }

    pub fn probe_status(&self) -> HashMap<String, ProbeStatus> {
        self.probes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn health_metrics(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    async fn run_probe(&self, operation: &str, probe: &HealthProbe, timeout: Duration) {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, probe()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(format!("health probe for {}", operation))),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let previous_failures = self
            .probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .map(|p| p.consecutive_failures)
            .unwrap_or(0);

        let (status, health) = match &result {
            Ok(()) => {
                if previous_failures > 0 {
                    info!(operation, "Health probe recovered");
                    let _ = self.events.send(BreakerEvent::HealthProbeRecovered {
                        operation: operation.to_string(),
                    });
                }
                (
                    ProbeStatus {
                        healthy: true,
                        last_checked: Utc::now(),
                        last_error: None,
                        consecutive_failures: 0,
                    },
                    ComponentHealth::healthy(elapsed_ms),
                )
            }
            Err(err) => {
                warn!(operation, error = %err, "Health probe failed");
                let _ = self.events.send(BreakerEvent::HealthProbeFailed {
                    operation: operation.to_string(),
                    error: err.to_string(),
                });
                (
                    ProbeStatus {
                        healthy: false,
                        last_checked: Utc::now(),
                        last_error: Some(err.to_string()),
                        consecutive_failures: previous_failures + 1,
                    },
                    ComponentHealth::unhealthy(err.to_string()),
                )
            }
        };

        self.health.record(format!("breaker:{}", operation), &health).await;
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation.to_string(), status);
    }

    /// Periodically probe an operation's upstream. Results are published
    /// and recorded, they never move the breaker. Returns false when the
    /// operation has no probe interval configured.
    pub async fn start_health_probe(self: &Arc<Self>, operation: &str, probe: HealthProbe) -> bool {
        let config = self.config_for(operation);
        let Some(interval_ms) = config.health_check_interval_ms else {
            return false;
        };
        let period = Duration::from_millis(interval_ms.max(1));
        let timeout = config.timeout();

        let service = Arc::clone(self);
        let operation = operation.to_string();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => service.run_probe(&operation, &probe, timeout).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(operation = %operation, "Health probe stopped");
        });
        self.probe_tasks.lock().await.push(handle);
        true
    }

    /// Stop probes
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.probe_tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Health probe task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_with(config: BreakerConfig) -> Arc<CircuitBreakerService> {
        let settings = CircuitBreakerSettings {
            default: config,
            ..Default::default()
        };
        Arc::new(CircuitBreakerService::new(settings, Arc::new(HealthMetrics::new(100))))
    }

    fn tight() -> BreakerConfig {
        BreakerConfig::default()
            .with_thresholds(4, 50.0)
            .with_reset_timeout(Duration::from_secs(30))
            .with_half_open(1, 2)
    }

    async fn succeed(service: &CircuitBreakerService, value: i32) -> Result<BreakerOutcome<i32>, ConnectorError> {
        service.execute("search", "q", || async move { Ok(value) }).await
    }

    async fn fail(service: &CircuitBreakerService) -> Result<BreakerOutcome<i32>, ConnectorError> {
        service
            .execute("search", "q", || async { Err(ConnectorError::Transient("502".into())) })
            .await
    }

    async fn trip(service: &CircuitBreakerService) {
        for _ in 0..4 {
            let _ = fail(service).await;
        }
        assert_eq!(service.state("search"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_when_failure_percentage_reaches_threshold() {
        let service = service_with(tight());
        succeed(&service, 1).await.unwrap();
        succeed(&service, 1).await.unwrap();
        let _ = fail(&service).await;
        assert_eq!(service.state("search"), CircuitState::Closed);
        let _ = fail(&service).await;
        assert_eq!(service.state("search"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_volume_threshold() {
        let service = service_with(tight());
        for _ in 0..3 {
            let _ = fail(&service).await;
        }
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_leave_the_window() {
        let service = service_with(tight());
        for _ in 0..3 {
            let _ = fail(&service).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&service).await;
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_without_calling() {
        let service = service_with(BreakerConfig {
            fallback_enabled: false,
            ..tight()
        });
        trip(&service).await;

        let called = std::sync::atomic::AtomicBool::new(false);
        let result: Result<BreakerOutcome<i32>, _> = service
            .execute("search", "q", || async {
                called.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(ConnectorError::CircuitOpen(_))));
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(service.stats()[0].rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_enough_successes() {
        let service = service_with(tight());
        trip(&service).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(service.state("search"), CircuitState::HalfOpen);

        succeed(&service, 7).await.unwrap();
        assert_eq!(service.state("search"), CircuitState::HalfOpen);
        succeed(&service, 7).await.unwrap();
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let service = service_with(tight());
        trip(&service).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let _ = fail(&service).await;
        assert_eq!(service.state("search"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_limited_trials() {
        let service = service_with(BreakerConfig {
            fallback_enabled: false,
            ..tight()
        });
        trip(&service).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let slow = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .execute("search", "q", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(succeed(&service, 2).await, Err(ConnectorError::CircuitOpen(_))));
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_trial_hands_its_slot_back() {
        let service = service_with(BreakerConfig {
            fallback_enabled: false,
            ..tight()
        });
        trip(&service).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let stuck = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .execute("search", "q", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());

        assert_eq!(service.state("search"), CircuitState::HalfOpen);
        succeed(&service, 1).await.unwrap();
        succeed(&service, 1).await.unwrap();
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_dropped_by_an_outer_timeout_is_released() {
        let service = service_with(BreakerConfig {
            fallback_enabled: false,
            ..tight()
        });
        trip(&service).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            service.execute("search", "q", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        assert!(succeed(&service, 2).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_chain_prefers_fresh_cached_then_default() {
        let service = service_with(tight().with_default_value(json!(-1)));

        succeed(&service, 42).await.unwrap();
        let outcome = fail(&service).await.unwrap();
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.source, ResponseSource::CachedFallback);

        tokio::time::advance(Duration::from_secs(301)).await;
        let outcome = fail(&service).await.unwrap();
        assert_eq!(outcome.value, -1);
        assert_eq!(outcome.source, ResponseSource::DefaultFallback);
    }

    #[tokio::test(start_paused = true)]
    async fn without_fallback_the_original_error_surfaces() {
        let service = service_with(tight());
        assert!(matches!(fail(&service).await, Err(ConnectorError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_failures() {
        let service = service_with(tight().with_timeout(Duration::from_millis(100)));
        let result: Result<BreakerOutcome<i32>, _> = service
            .execute("search", "q", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(ConnectorError::Timeout(_))));
        let stats = &service.stats()[0];
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.window_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_move_the_breaker() {
        let service = service_with(tight().with_default_value(json!(0)));
        for _ in 0..10 {
            let result: Result<BreakerOutcome<i32>, _> = service
                .execute("search", "q", || async {
                    Err(ConnectorError::Client {
                        status: 422,
                        message: "bad query".into(),
                    })
                })
                .await;
            assert!(matches!(result, Err(ConnectorError::Client { status: 422, .. })));
        }
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_never_use_fallback() {
        let service = service_with(tight().with_default_value(json!(0)));
        let result: Result<i32, _> = service
            .execute_without_fallback("create_deployment", || async {
                Err(ConnectorError::Transient("503".into()))
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_published() {
        let service = service_with(tight());
        let mut events = service.subscribe();
        trip(&service).await;

        let mut saw_open = false;
        while let Ok(event) = events.try_recv() {
            if let BreakerEvent::StateChanged { to: CircuitState::Open, from, .. } = event {
                assert_eq!(from, CircuitState::Closed);
                saw_open = true;
            }
        }
        assert!(saw_open);
    }

    #[tokio::test(start_paused = true)]
    async fn force_and_reset() {
        let service = service_with(tight());
        service.force_state("search", CircuitState::Open);
        assert_eq!(service.state("search"), CircuitState::Open);
        service.reset("search");
        assert_eq!(service.state("search"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn health_probes_report_but_never_transition() {
        let service = service_with(tight().with_health_check(Duration::from_secs(10)));
        let mut events = service.subscribe();
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = healthy.clone();
        let probe: HealthProbe = Arc::new(move || {
            let flag = flag.clone();
            Box::pin(async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(ConnectorError::Transient("unreachable".into()))
                }
            })
        });
        assert!(service.start_health_probe("search", probe).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(events.recv().await.unwrap(), BreakerEvent::HealthProbeFailed { .. }));
        assert_eq!(service.state("search"), CircuitState::Closed);
        assert!(!service.probe_status()["search"].healthy);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(events.recv().await.unwrap(), BreakerEvent::HealthProbeRecovered { .. }));
        assert!(service.health_metrics().get_component_stats("breaker:search").await.is_some());

        service.stop().await;
    }

    #[tokio::test]
    async fn probe_requires_interval() {
        let service = service_with(BreakerConfig::default());
        let probe: HealthProbe = Arc::new(|| Box::pin(async { Ok(()) }));
        assert!(!service.start_health_probe("search", probe).await);
    }
}
