//! # Circuit Breaker
//!
//! Per-backend circuit breaker preventing a failing telemetry store from
//! being hammered by every concurrent request.
//!
//! - `CLOSED` → `OPEN` once consecutive failures reach `failure_threshold`
//! - `OPEN` → `HALF-OPEN` lazily, on the first call after `recovery_timeout`
//!   has elapsed since the last failure
//! - `HALF-OPEN` → `CLOSED` after `success_threshold` consecutive successes,
//!   back to `OPEN` on any failure
//!
//! All counters live in one [`CircuitBreakerRecord`] behind a mutex that is
//! never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, probe requests allowed
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a probe call is admitted
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Deadline applied to every wrapped call
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Mutable state of one breaker
#[derive(Debug)]
struct CircuitBreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    total_timeouts: u64,
}

impl Default for CircuitBreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_time: None,
            last_success_time: None,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
            total_timeouts: 0,
        }
    }
}

impl CircuitBreakerRecord {
    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub total_timeouts: u64,
    pub failure_rate: f64,
}

/// A circuit breaker guarding one named operation class
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    record: Mutex<CircuitBreakerRecord>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            record: Mutex::new(CircuitBreakerRecord::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executes an operation through the breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] without running the operation while
    /// the circuit is open, and with [`Error::Timeout`] if the operation
    /// outlives `call_timeout`. Any other error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure();
                Err(error)
            }
            Err(_) => {
                self.lock().total_timeouts += 1;
                counter!("circuit_breaker_timeouts_total", 1, "circuit" => self.name.clone());
                self.record_failure();
                Err(Error::Timeout {
                    operation: self.name.clone(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Counts the request and decides whether it may run
    fn admit(&self) -> Result<()> {
        let mut record = self.lock();
        record.total_requests += 1;

        if record.state == CircuitState::Open {
            let elapsed = record
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(self.config.recovery_timeout);

            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut record, CircuitState::HalfOpen);
                record.success_count = 0;
            } else {
                record.total_rejections += 1;
                drop(record);
                counter!("circuit_breaker_rejections_total", 1, "circuit" => self.name.clone());
                debug!(circuit = %self.name, "Call rejected by open circuit");
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after: Some(self.config.recovery_timeout - elapsed),
                });
            }
        }

        Ok(())
    }

    /// Records a successful call
    pub fn record_success(&self) {
        let mut record = self.lock();
        record.total_successes += 1;
        record.last_success_time = Some(Utc::now());

        match record.state {
            CircuitState::Closed => {
                record.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.success_threshold {
                    self.transition(&mut record, CircuitState::Closed);
                    record.failure_count = 0;
                    record.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call
    pub fn record_failure(&self) {
        let mut record = self.lock();
        record.total_failures += 1;
        record.last_failure = Some(Instant::now());
        record.last_failure_time = Some(Utc::now());
        counter!("circuit_breaker_failures_total", 1, "circuit" => self.name.clone());

        match record.state {
            CircuitState::Closed => {
                record.failure_count += 1;
                if record.failure_count >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = record.failure_count,
                        threshold = self.config.failure_threshold,
                        "Failure threshold reached"
                    );
                    self.transition(&mut record, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                record.success_count = 0;
                self.transition(&mut record, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, record: &mut CircuitBreakerRecord, to: CircuitState) {
        let from = record.state;
        if from == to {
            return;
        }
        record.state = to;

        match to {
            CircuitState::Open => {
                warn!(circuit = %self.name, from = %from, to = %to, "Circuit opened")
            }
            _ => info!(circuit = %self.name, from = %from, to = %to, "Circuit state changed"),
        }
        counter!(
            "circuit_breaker_transitions_total",
            1,
            "circuit" => self.name.clone(),
            "to" => to.to_string()
        );
        gauge!("circuit_breaker_state", to.as_gauge(), "circuit" => self.name.clone());
    }

    /// Current state, without applying the lazy recovery transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// State the next call will observe: an OPEN circuit whose recovery
    /// timeout has elapsed reports HALF-OPEN.
    pub fn current_state(&self) -> CircuitState {
        let record = self.lock();
        match (record.state, record.last_failure) {
            (CircuitState::Open, Some(t)) if t.elapsed() >= self.config.recovery_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Failed calls over all calls seen, rejections included
    pub fn failure_rate(&self) -> f64 {
        self.lock().failure_rate()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let record = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            last_failure_time: record.last_failure_time,
            last_success_time: record.last_success_time,
            total_requests: record.total_requests,
            total_failures: record.total_failures,
            total_successes: record.total_successes,
            total_rejections: record.total_rejections,
            total_timeouts: record.total_timeouts,
            failure_rate: record.failure_rate(),
        }
    }

    /// Forces the circuit back to CLOSED and clears its consecutive counters
    pub fn reset(&self) {
        let mut record = self.lock();
        self.transition(&mut record, CircuitState::Closed);
        record.failure_count = 0;
        record.success_count = 0;
        record.last_failure = None;
        info!(circuit = %self.name, "Circuit manually reset");
    }
}

/// Lazily created breakers keyed by backend name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Sets the config used when the named breaker is first created
    pub fn set_override(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.insert(name.into(), config);
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                debug!(circuit = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Resets a breaker by name, returns false if it was never created
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            success_threshold: 2,
            call_timeout: Duration::from_millis(50),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(Error::unavailable("logs", "down")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_threshold() {
        let cb = CircuitBreaker::new("logs", test_config());

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = succeed(&cb).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
        assert_eq!(cb.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("logs", test_config());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_needs_success_threshold() {
        let cb = CircuitBreaker::new("traces", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("traces", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("metrics", test_config());

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        let stats = cb.stats();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_failure_rate_counts_every_request() {
        let cb = CircuitBreaker::new("logs", test_config());

        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;

        assert_eq!(cb.stats().total_requests, 4);
        assert!((cb.failure_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_registry_shares_breakers_and_resets() {
        let registry = CircuitBreakerRegistry::new(test_config());
        registry.set_override(
            "metrics",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..test_config()
            },
        );

        let a = registry.get_or_create("logs");
        let b = registry.get_or_create("logs");
        assert!(Arc::ptr_eq(&a, &b));

        let metrics = registry.get_or_create("metrics");
        assert_eq!(metrics.config().failure_threshold, 1);
        let _ = fail(&metrics).await;
        assert_eq!(metrics.state(), CircuitState::Open);

        assert!(registry.reset("metrics"));
        assert_eq!(metrics.state(), CircuitState::Closed);
        assert!(!registry.reset("unknown"));
        assert_eq!(registry.all_stats().len(), 2);
    }
}
