//! # Query Federation Orchestrator
//!
//! Fans a [`UnifiedQuery`] out to every applicable backend concurrently,
//! each call guarded by the degradation manager, then merges, correlates,
//! sorts and paginates whatever came back. A failing backend never fails
//! the request: it contributes an empty item set and a marker in
//! `stats.sources`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use resilience_rs::{log_structured_error, BoxedFallback, Error, FallbackResult, Result, ResultSource};

use crate::api::{CorrelateRequest, CorrelateResponse, HealthReport};
use crate::backend::{BackendAdapter, BackendResponse};
use crate::context::FederationContext;
use crate::correlation::CorrelationEngine;
use crate::model::{
    sort_items, Facets, SearchItem, SearchStats, SignalType, SourceStatus, TenantId, UnifiedQuery,
    UnifiedResult, MAX_LIMIT,
};
use crate::stream::{self, SearchStream};

/// Entry point for federated searches
#[derive(Debug, Clone)]
pub struct QueryOrchestrator {
    context: Arc<FederationContext>,
    correlation: CorrelationEngine,
}

impl QueryOrchestrator {
    pub fn new(context: Arc<FederationContext>) -> Self {
        Self {
            context,
            correlation: CorrelationEngine::default(),
        }
    }

    pub fn with_correlation_engine(mut self, correlation: CorrelationEngine) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn context(&self) -> &Arc<FederationContext> {
        &self.context
    }

    /// Binds the query to `tenant` and validates it.
    ///
    /// A blank tenant in the query is filled in; a different one is refused.
    fn prepare(&self, mut query: UnifiedQuery, tenant: &TenantId) -> Result<Arc<UnifiedQuery>> {
        if query.tenant.trim().is_empty() {
            query.tenant = tenant.to_string();
        } else if query.tenant != tenant.as_str() {
            return Err(Error::validation(format!(
                "query tenant '{}' does not match request tenant '{}'",
                query.tenant, tenant
            )));
        }
        query.validate()?;
        Ok(Arc::new(query))
    }

    fn backends_for(&self, signal_type: SignalType) -> Vec<Arc<dyn BackendAdapter>> {
        self.context
            .backends()
            .iter()
            .filter(|b| signal_type.includes(b.signal_type()))
            .cloned()
            .collect()
    }

    /// Runs a federated search and returns one page of merged results
    pub async fn search(&self, query: UnifiedQuery, tenant: &TenantId) -> Result<UnifiedResult> {
        let span = info_span!("federated_search", request_id = %Uuid::new_v4(), tenant = %tenant);
        self.search_inner(query, tenant).instrument(span).await
    }

    async fn search_inner(&self, query: UnifiedQuery, tenant: &TenantId) -> Result<UnifiedResult> {
        let started = Instant::now();
        let query = self.prepare(query, tenant)?;
        let backends = self.backends_for(query.signal_type);
        let per_backend = Arc::new(backend_query(&query));
        counter!("federation_requests_total", 1, "signal_type" => query.signal_type.to_string());

        let (names, handles): (Vec<String>, Vec<_>) = backends
            .into_iter()
            .map(|backend| {
                let name = backend.name().to_string();
                let context = self.context.clone();
                let query = per_backend.clone();
                let tenant = tenant.clone();
                let handle = tokio::spawn(
                    async move { guarded_search(&context, &backend, query, &tenant).await }
                        .in_current_span(),
                );
                (name, handle)
            })
            .unzip();

        let mut items = Vec::new();
        let mut stats = SearchStats::default();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(response) => {
                    items.extend(response.items);
                    stats.merge(response.stats);
                }
                Err(join_error) => {
                    error!(backend = %name, error = %join_error, "Backend task failed");
                    stats.sources.insert(name, SourceStatus::error());
                }
            }
        }

        let result = self.assemble(&query, items, stats);
        info!(
            matched = result.stats.matched,
            returned = result.items.len(),
            degraded = result.stats.sources.values().filter(|s| s.is_degraded()).count(),
            duration_ms = %started.elapsed().as_millis(),
            "Federated search finished"
        );
        Ok(result)
    }

    /// Correlates, sorts and paginates the merged candidates
    fn assemble(&self, query: &UnifiedQuery, mut items: Vec<SearchItem>, stats: SearchStats) -> UnifiedResult {
        let signal_types: HashSet<SignalType> = items.iter().map(|i| i.signal_type()).collect();
        if signal_types.len() > 1 {
            self.correlation.correlate(&mut items, &query.time_range);
        }

        let facets = Facets::from_items(&items);
        sort_items(&mut items, query.sort_field, query.sort_direction);

        // backends return one item past the page, so a longer merged set
        // means another page exists; `matched` covers the capped case
        let next_offset = query.offset.saturating_add(query.limit);
        let more = items.len() > next_offset || stats.matched > next_offset as u64;
        let items: Vec<SearchItem> = items.into_iter().skip(query.offset).take(query.limit).collect();

        UnifiedResult {
            items,
            stats,
            facets,
            next_token: more.then(|| next_offset.to_string()),
        }
    }

    /// Streams per-window chunks from every backend, ending with one
    /// terminal chunk. Must be called from within a Tokio runtime.
    pub fn search_stream(&self, query: UnifiedQuery, tenant: &TenantId) -> Result<SearchStream> {
        let query = self.prepare(query, tenant)?;
        let backends = self.backends_for(query.signal_type);
        let span = info_span!("federated_stream", request_id = %Uuid::new_v4(), tenant = %tenant);
        counter!("federation_streams_total", 1);

        Ok(stream::spawn(
            self.context.clone(),
            backends,
            Arc::new(backend_query(&query)),
            tenant.clone(),
            span,
        ))
    }

    /// Finds the items related to a trace, correlation id or service in a
    /// time range, together with their correlation graph
    pub async fn correlate(&self, request: CorrelateRequest, tenant: &TenantId) -> Result<CorrelateResponse> {
        request.validate()?;

        let query = UnifiedQuery::new(SignalType::All, request.time_range)
            .with_tenant(tenant.as_str())
            .with_page(0, MAX_LIMIT);
        let result = self.search(query, tenant).await?;

        let related: Vec<SearchItem> = result.items.into_iter().filter(|i| request.matches(i)).collect();
        let graph = self.correlation.build_graph(&related);
        info!(tenant = %tenant, related = related.len(), confidence = graph.confidence, "Correlation finished");

        Ok(CorrelateResponse {
            confidence_score: graph.confidence,
            related_items: related,
            correlation_graph: graph,
        })
    }

    /// Probes every backend concurrently; a probe outliving the configured
    /// timeout reports `false`
    pub async fn health(&self) -> BTreeMap<String, bool> {
        let probe_timeout = self.context.config().probe_timeout();
        let probes = self.context.backends().iter().cloned().map(|backend| async move {
            let healthy = timeout(probe_timeout, backend.health_check())
                .await
                .unwrap_or(false);
            if !healthy {
                warn!(backend = %backend.name(), "Health probe failed");
            }
            (backend.name().to_string(), healthy)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Health map plus degradation and breaker state
    pub async fn health_report(&self) -> HealthReport {
        HealthReport {
            backends: self.health().await,
            degradation: self.context.degradation().status(),
            circuit_breakers: self.context.breakers().all_stats().into_iter().collect(),
            checked_at: chrono::Utc::now(),
        }
    }
}

/// What each backend is asked for: everything up to the end of the
/// requested page plus one item to detect a further page, since merging
/// happens here
fn backend_query(query: &UnifiedQuery) -> UnifiedQuery {
    let mut per_backend = query.clone();
    per_backend.limit = query
        .offset
        .saturating_add(query.limit)
        .saturating_add(1)
        .min(MAX_LIMIT);
    per_backend.offset = 0;
    per_backend
}

fn cache_key(backend: &str, tenant: &TenantId, query: &UnifiedQuery) -> Result<String> {
    Ok(format!("{}:{}:{}", backend, tenant, serde_json::to_string(query)?))
}

/// Runs one backend call through the degradation tiers. Never fails: the
/// response's `sources` entry for the backend tells how it was served.
pub(crate) async fn guarded_search(
    context: &FederationContext,
    backend: &Arc<dyn BackendAdapter>,
    query: Arc<UnifiedQuery>,
    tenant: &TenantId,
) -> BackendResponse {
    let name = backend.name().to_string();
    let operation = format!("{}.search", backend.signal_type());
    let key = match cache_key(&name, tenant, &query) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(backend = %name, error = %e, "Query has no cache key, caching disabled for this call");
            None
        }
    };
    let started = Instant::now();

    let primary = || {
        let backend = backend.clone();
        let query = query.clone();
        let tenant = tenant.clone();
        async move { backend.search(&query, &tenant).await }
    };
    let fallback_name = name.clone();
    let fallback: BoxedFallback<'static, BackendResponse> =
        Box::new(move || async move { Ok(BackendResponse::unavailable(&fallback_name)) }.boxed());

    let outcome = context
        .degradation()
        .execute_with_fallback(&name, &operation, primary, Some(fallback), key.as_deref())
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    histogram!("federation_backend_latency_ms", elapsed_ms as f64, "backend" => name.clone());

    match outcome {
        Ok(FallbackResult { value, source }) => {
            let count = value.items.len() as u64;
            let status = match source {
                ResultSource::Primary => SourceStatus::Count(count),
                ResultSource::Cache => value
                    .stats
                    .sources
                    .get(&name)
                    .cloned()
                    .unwrap_or(SourceStatus::Count(count)),
                ResultSource::StaleCache => SourceStatus::stale(),
                ResultSource::Fallback | ResultSource::Synthetic => SourceStatus::unavailable(),
            };
            counter!("federation_backend_items_total", count, "backend" => name.clone());

            let mut stats = value.stats;
            if source != ResultSource::Primary {
                stats.latency_ms = elapsed_ms;
            }
            stats.sources = BTreeMap::from([(name, status)]);
            BackendResponse::new(value.items, stats)
        }
        Err(error) => {
            log_structured_error(&name, &error);
            let mut response = BackendResponse::default();
            response.stats.latency_ms = elapsed_ms;
            response.stats.sources.insert(name, SourceStatus::error());
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::FederationConfig;
    use crate::model::{Filter, FilterOperator, LogPayload, Payload, TimeRange};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;

    fn log(id: &str, minutes: i64) -> SearchItem {
        SearchItem::new(
            id,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::minutes(minutes),
            "api",
            "t1",
            Payload::Log(LogPayload {
                level: "info".to_string(),
                message: format!("event {}", id),
                fields: HashMap::new(),
            }),
        )
    }

    fn orchestrator(items: Vec<SearchItem>) -> QueryOrchestrator {
        let context = FederationContext::new(FederationConfig::default())
            .unwrap()
            .with_backend(Arc::new(InMemoryBackend::new("logs", SignalType::Logs).with_items(items)));
        QueryOrchestrator::new(Arc::new(context))
    }

    fn query() -> UnifiedQuery {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        UnifiedQuery::new(SignalType::All, TimeRange::new(start, start + Duration::hours(1)))
    }

    #[tokio::test]
    async fn test_tenant_is_filled_and_checked() {
        let orchestrator = orchestrator(vec![log("a", 1)]);
        let tenant = TenantId::new("t1").unwrap();

        let result = orchestrator.search(query(), &tenant).await.unwrap();
        assert_eq!(result.items.len(), 1);

        let foreign = orchestrator.search(query().with_tenant("t2"), &tenant).await;
        assert!(matches!(foreign, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_pagination_and_next_token() {
        let orchestrator = orchestrator((0..5).map(|i| log(&format!("l{}", i), i)).collect());
        let tenant = TenantId::new("t1").unwrap();

        let first = orchestrator.search(query().with_page(0, 2), &tenant).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["l4", "l3"]);
        assert_eq!(first.next_token.as_deref(), Some("2"));
        assert_eq!(first.stats.matched, 5);
        // facets count the fetched candidates: the page plus one look-ahead item
        assert_eq!(first.facets.services["api"], 3);

        let middle = orchestrator.search(query().with_page(2, 2), &tenant).await.unwrap();
        assert_eq!(middle.next_token.as_deref(), Some("4"));

        let exact = orchestrator.search(query().with_page(3, 2), &tenant).await.unwrap();
        assert_eq!(exact.items.len(), 2);
        assert!(exact.next_token.is_none());

        let last = orchestrator.search(query().with_page(4, 2), &tenant).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].id(), "l0");
        assert!(last.next_token.is_none());
    }

    #[test]
    fn test_backend_query_covers_requested_page() {
        let q = backend_query(&query().with_page(9_995, 100));
        assert_eq!(q.offset, 0);
        assert_eq!(q.limit, MAX_LIMIT);

        let q = backend_query(&query().with_page(20, 30));
        assert_eq!(q.limit, 51);
    }

    #[test]
    fn test_cache_key_separates_queries() {
        let tenant = TenantId::new("t1").unwrap();
        let plain = cache_key("logs", &tenant, &query()).unwrap();
        let filtered = cache_key(
            "logs",
            &tenant,
            &query().with_filter(Filter::new("service", FilterOperator::Eq, serde_json::json!("api"))),
        )
        .unwrap();

        assert!(plain.starts_with("logs:t1:{"));
        assert_ne!(plain, filtered);
        assert_ne!(plain, cache_key("metrics", &tenant, &query()).unwrap());
    }

    #[tokio::test]
    async fn test_health_map() {
        let orchestrator = orchestrator(Vec::new());
        let health = orchestrator.health().await;
        assert_eq!(health.get("logs"), Some(&true));
    }
}
