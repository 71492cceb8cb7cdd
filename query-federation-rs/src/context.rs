//! Process-wide federation state, built once at startup and handed to the
//! orchestrator.

use std::sync::Arc;

use tracing::info;

use resilience_rs::{CircuitBreakerRegistry, DegradationManager, FallbackCache, Result};

use crate::backend::{BackendAdapter, BackendResponse};
use crate::config::FederationConfig;

/// Backends plus the breaker registry and degradation manager shared by
/// every request
pub struct FederationContext {
    config: FederationConfig,
    backends: Vec<Arc<dyn BackendAdapter>>,
    breakers: Arc<CircuitBreakerRegistry>,
    degradation: DegradationManager<BackendResponse>,
}

impl FederationContext {
    /// Builds the context after validating `config`
    pub fn new(config: FederationConfig) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.to_config()));
        let cache = FallbackCache::new("backend-responses", config.cache.max_entries, config.default_ttl());
        let degradation = DegradationManager::new(
            breakers.clone(),
            config.retry.to_policy(),
            cache,
            config.fallback_ttl(),
        );

        Ok(Self {
            config,
            backends: Vec::new(),
            breakers,
            degradation,
        })
    }

    /// Adds a backend and starts tracking its degradation level.
    /// A backend with an already registered name replaces the old one.
    pub fn with_backend(mut self, backend: Arc<dyn BackendAdapter>) -> Self {
        self.degradation.register_service(backend.name());
        info!(
            backend = %backend.name(),
            signal_type = %backend.signal_type(),
            "Registered backend"
        );
        self.backends.retain(|b| b.name() != backend.name());
        self.backends.push(backend);
        self
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn backends(&self) -> &[Arc<dyn BackendAdapter>] {
        &self.backends
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn degradation(&self) -> &DegradationManager<BackendResponse> {
        &self.degradation
    }
}

impl std::fmt::Debug for FederationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("FederationContext")
            .field("backends", &names)
            .field("breakers", &self.breakers)
            .finish()
    }
}
