//! # Graceful Degradation
//!
//! Composes the retry engine and circuit breaker around a primary call and,
//! when that fails, walks down the degradation tiers: fresh cache, explicit
//! fallback, stale cache, synthetic value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::fallback::{FallbackCache, FallbackResult, ResultSource};
use crate::retry::RetryPolicy;
use crate::types::{Error, Result};

/// Failure rate above which a closed circuit still counts as degraded
pub const DEGRADED_FAILURE_RATE: f64 = 0.5;

/// Coarse health tier of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Full,
    Degraded,
    Minimal,
    Unavailable,
}

impl DegradationLevel {
    /// Whether the primary operation may be attempted at this level
    pub fn permits_primary(self) -> bool {
        matches!(self, DegradationLevel::Full | DegradationLevel::Degraded)
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradationLevel::Full => write!(f, "FULL"),
            DegradationLevel::Degraded => write!(f, "DEGRADED"),
            DegradationLevel::Minimal => write!(f, "MINIMAL"),
            DegradationLevel::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// Last observed health of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationRecord {
    pub service: String,
    pub level: DegradationLevel,
    pub last_check: DateTime<Utc>,
    pub error_message: Option<String>,
    pub fallback_active: bool,
}

impl DegradationRecord {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            level: DegradationLevel::Full,
            last_check: Utc::now(),
            error_message: None,
            fallback_active: false,
        }
    }
}

/// Values that have a minimal stand-in for a given operation
pub trait Synthesize: Sized {
    /// Returns the minimal value for `operation`, or `None` if there is no
    /// meaningful stand-in
    fn synthesize(operation: &str) -> Option<Self>;
}

/// An explicit fallback operation
pub type BoxedFallback<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a>;

/// Tracks per-service degradation and serves values through the tiers.
///
/// One manager is shared by every request; breaker state comes from the
/// registry it was built with.
#[derive(Debug)]
pub struct DegradationManager<T> {
    breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    cache: FallbackCache<String, T>,
    fallback_ttl: Duration,
    records: DashMap<String, DegradationRecord>,
}

impl<T> DegradationManager<T>
where
    T: Clone + Synthesize,
{
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        retry_policy: RetryPolicy,
        cache: FallbackCache<String, T>,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            breakers,
            retry_policy,
            cache,
            fallback_ttl,
            records: DashMap::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &FallbackCache<String, T> {
        &self.cache
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Starts tracking a service at FULL if it is not tracked yet
    pub fn register_service(&self, service: &str) {
        self.records
            .entry(service.to_string())
            .or_insert_with(|| DegradationRecord::new(service));
        self.breakers.get_or_create(service);
    }

    /// Every tracked service, ordered by name
    pub fn status(&self) -> Vec<DegradationRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.service.cmp(&b.service));
        records
    }

    pub fn record(&self, service: &str) -> Option<DegradationRecord> {
        self.records.get(service).map(|r| r.value().clone())
    }

    /// Level derived from the service's breaker
    pub fn current_level(&self, service: &str) -> DegradationLevel {
        let breaker = self.breakers.get_or_create(service);
        match breaker.current_state() {
            CircuitState::Open => DegradationLevel::Unavailable,
            CircuitState::HalfOpen => DegradationLevel::Degraded,
            CircuitState::Closed if breaker.failure_rate() > DEGRADED_FAILURE_RATE => {
                DegradationLevel::Degraded
            }
            CircuitState::Closed => DegradationLevel::Full,
        }
    }

    fn update_record(
        &self,
        service: &str,
        level: DegradationLevel,
        fallback_active: bool,
        error_message: Option<String>,
    ) {
        let mut record = self
            .records
            .entry(service.to_string())
            .or_insert_with(|| DegradationRecord::new(service));
        record.level = level;
        record.last_check = Utc::now();
        record.fallback_active = fallback_active;
        record.error_message = error_message;
    }

    fn served(&self, service: &str, source: ResultSource) {
        counter!(
            "degradation_served_total",
            1,
            "service" => service.to_string(),
            "source" => source.to_string()
        );
    }

    /// Serves `operation` for `service`, stopping at the first tier that
    /// yields a value:
    ///
    /// 1. a fresh cache entry, when the service is already degraded
    /// 2. `primary` through retry and the service's circuit breaker
    /// 3. `fallback`, cached with the short fallback TTL
    /// 4. a stale cache entry
    /// 5. [`Synthesize::synthesize`]
    ///
    /// Fails with [`Error::FallbackExhausted`] when no tier answers.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        service: &str,
        operation: &str,
        primary: F,
        fallback: Option<BoxedFallback<'_, T>>,
        cache_key: Option<&str>,
    ) -> Result<FallbackResult<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let level = self.current_level(service);
        let key = cache_key.map(str::to_string);
        let mut causes = Vec::new();

        if level != DegradationLevel::Full {
            if let Some(value) = key.as_ref().and_then(|k| self.cache.get_fresh(k)) {
                debug!(service = %service, operation = %operation, level = %level, "Serving fresh cache entry");
                let active = self.record(service).map(|r| r.fallback_active).unwrap_or(false);
                self.update_record(service, level, active, None);
                self.served(service, ResultSource::Cache);
                return Ok(FallbackResult::new(value, ResultSource::Cache));
            }
        }

        if level.permits_primary() {
            let breaker = self.breakers.get_or_create(service);
            let attempt = self
                .retry_policy
                .retry(operation, || {
                    let breaker = breaker.clone();
                    let call = primary();
                    async move { breaker.execute(|| call).await }
                })
                .await;

            match attempt {
                Ok(value) => {
                    if let Some(k) = key.clone() {
                        self.cache.put(k, value.clone(), None);
                    }
                    self.update_record(service, self.current_level(service), false, None);
                    self.served(service, ResultSource::Primary);
                    return Ok(FallbackResult::new(value, ResultSource::Primary));
                }
                Err(error) => {
                    warn!(
                        service = %service,
                        operation = %operation,
                        error = %error,
                        "Primary operation failed, degrading"
                    );
                    causes.push(error.to_string());
                }
            }
        } else {
            causes.push(format!("service '{}' is {}", service, level));
        }

        let level = self.current_level(service);
        let last_error = causes.last().cloned();
        self.update_record(service, level, true, last_error.clone());

        if let Some(fallback) = fallback {
            match fallback().await {
                Ok(value) => {
                    if let Some(k) = key.clone() {
                        self.cache.put(k, value.clone(), Some(self.fallback_ttl));
                    }
                    self.served(service, ResultSource::Fallback);
                    return Ok(FallbackResult::new(value, ResultSource::Fallback));
                }
                Err(error) => {
                    warn!(service = %service, operation = %operation, error = %error, "Fallback failed");
                    causes.push(error.to_string());
                }
            }
        }

        if let Some(value) = key.as_ref().and_then(|k| self.cache.get_stale(k)) {
            debug!(service = %service, operation = %operation, "Serving stale cache entry");
            self.served(service, ResultSource::StaleCache);
            return Ok(FallbackResult::new(value, ResultSource::StaleCache));
        }

        if let Some(value) = T::synthesize(operation) {
            self.update_record(service, DegradationLevel::Minimal, true, last_error);
            self.served(service, ResultSource::Synthetic);
            return Ok(FallbackResult::new(value, ResultSource::Synthetic));
        }

        counter!("degradation_exhausted_total", 1, "service" => service.to_string());
        Err(Error::FallbackExhausted {
            service: service.to_string(),
            operation: operation.to_string(),
            causes,
        })
    }
}
