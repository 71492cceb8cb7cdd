//! query-federation-rs/src/lib.rs
//! Federated search over log, metric and trace backends.
//!
//! A [`QueryOrchestrator`] fans one [`UnifiedQuery`] out to every backend
//! registered in a [`FederationContext`], protects each call with the
//! circuit breakers and degradation tiers from `resilience_rs`, and merges
//! the results into one sorted, paginated [`UnifiedResult`]. Items of
//! different signal types are linked by the [`CorrelationEngine`].

pub mod api;
pub mod backend;
pub mod config;
pub mod context;
pub mod correlation;
pub mod model;
pub mod orchestrator;
pub mod stream;

pub use api::{CorrelateRequest, CorrelateResponse, HealthReport, SearchEvent};
pub use backend::{BackendAdapter, BackendResponse, InMemoryBackend};
pub use config::FederationConfig;
pub use context::FederationContext;
pub use correlation::{CorrelationEngine, CorrelationGraph};
pub use model::{
    Filter, FilterOperator, Payload, SearchItem, SearchStats, SignalType, SortDirection, SortField,
    SourceStatus, TenantId, TimeRange, UnifiedQuery, UnifiedResult,
};
pub use orchestrator::QueryOrchestrator;
pub use stream::{SearchStream, StreamChunk};
