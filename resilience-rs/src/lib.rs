//! # Resilience Framework
//!
//! Resilience primitives for calls into remote telemetry stores: a shared
//! error taxonomy, structured logging setup, retry with exponential backoff,
//! per-backend circuit breakers and a graceful degradation manager that
//! falls back through cache, explicit fallback and synthetic values.
//!
//! ## Features
//!
//! - Standardized error types with a retry classification
//! - Structured logging (JSON or text, optional rolling files)
//! - Retry mechanisms with exponential backoff and jitter
//! - Circuit breakers with a per-name registry
//! - Bounded fallback cache with TTL and stale reads
//! - Per-service degradation tracking
//!

pub mod types;
pub mod logging;
pub mod retry;
pub mod circuit_breaker;
pub mod fallback;
pub mod degradation;

// Re-export commonly used types
pub use types::{Error, ErrorKind, Result};
pub use logging::{init_logging, log_structured_error, LoggingConfig, LoggingGuard};
pub use retry::{retry, RetryPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use fallback::{FallbackCache, FallbackResult, ResultSource};
pub use degradation::{
    BoxedFallback, DegradationLevel, DegradationManager, DegradationRecord, Synthesize,
};
