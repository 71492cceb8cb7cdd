//! Backend adapter contract and an in-memory adapter.
//!
//! Real adapters translate a [`UnifiedQuery`] into the query language of a
//! log, metric or trace store and normalize the response into
//! [`SearchItem`]s. The in-memory adapter evaluates queries against a fixed
//! item set and is what the demo binary and the tests run against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use resilience_rs::{Error, Result, Synthesize};

use crate::model::{sort_items, SearchItem, SearchStats, SignalType, SourceStatus, TenantId, UnifiedQuery};

/// Items and statistics returned by one backend call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub items: Vec<SearchItem>,
    pub stats: SearchStats,
}

impl BackendResponse {
    pub fn new(items: Vec<SearchItem>, stats: SearchStats) -> Self {
        Self { items, stats }
    }

    /// Empty response tagged with the "unavailable" marker for `backend`
    pub fn unavailable(backend: &str) -> Self {
        let mut response = BackendResponse::default();
        response
            .stats
            .sources
            .insert(backend.to_string(), SourceStatus::unavailable());
        response
    }
}

impl Synthesize for BackendResponse {
    fn synthesize(_operation: &str) -> Option<Self> {
        Some(BackendResponse::default())
    }
}

/// A telemetry store the orchestrator can federate over
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Unique backend name, also the key of its breaker and degradation record
    fn name(&self) -> &str;

    /// Signal type this backend serves
    fn signal_type(&self) -> SignalType;

    /// Runs the query for `tenant`
    async fn search(&self, query: &UnifiedQuery, tenant: &TenantId) -> Result<BackendResponse>;

    /// Probes the backend; must not fail
    async fn health_check(&self) -> bool;
}

/// Backend answering from an in-process item set
#[derive(Debug)]
pub struct InMemoryBackend {
    name: String,
    signal_type: SignalType,
    items: RwLock<Vec<SearchItem>>,
    latency: Duration,
    healthy: AtomicBool,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>, signal_type: SignalType) -> Self {
        Self {
            name: name.into(),
            signal_type,
            items: RwLock::new(Vec::new()),
            latency: Duration::ZERO,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn with_items(self, items: Vec<SearchItem>) -> Self {
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = items;
        self
    }

    /// Simulated round-trip time added to every search
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, item: SearchItem) {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
    }

    /// An unhealthy backend fails searches as unavailable and health probes
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BackendAdapter for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_type(&self) -> SignalType {
        self.signal_type
    }

    async fn search(&self, query: &UnifiedQuery, tenant: &TenantId) -> Result<BackendResponse> {
        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(Error::unavailable(&self.name, "backend is not reachable"));
        }

        let (mut matched, scanned) = {
            let items = self.items.read().unwrap_or_else(|e| e.into_inner());
            let matched: Vec<SearchItem> = items
                .iter()
                .filter(|item| item.tenant() == tenant.as_str() && query.matches(item))
                .cloned()
                .collect();
            (matched, items.len() as u64)
        };

        let total = matched.len() as u64;
        sort_items(&mut matched, query.sort_field, query.sort_direction);
        matched.truncate(query.limit);

        debug!(
            backend = %self.name,
            tenant = %tenant,
            matched = total,
            returned = matched.len(),
            "In-memory search finished"
        );

        let mut stats = SearchStats {
            matched: total,
            scanned,
            latency_ms: started.elapsed().as_millis() as u64,
            ..SearchStats::default()
        };
        stats
            .sources
            .insert(self.name.clone(), SourceStatus::Count(matched.len() as u64));

        Ok(BackendResponse::new(matched, stats))
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
