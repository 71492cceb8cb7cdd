use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::StreamExt;
use tokio_test::{assert_err, assert_ok};

use query_federation::backend::{BackendAdapter, BackendResponse};
use query_federation::model::{LogPayload, MetricPayload, TracePayload};
use query_federation::{
    CorrelateRequest, FederationConfig, FederationContext, InMemoryBackend, Payload,
    QueryOrchestrator, SearchItem, SignalType, SourceStatus, StreamChunk, TenantId, TimeRange,
    UnifiedQuery,
};
use resilience_rs::{Error, Result};

fn base() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn hour() -> TimeRange {
    TimeRange::new(base(), base() + ChronoDuration::hours(1))
}

fn tenant() -> TenantId {
    TenantId::new("t1").unwrap()
}

fn log_item(id: &str, secs: i64, service: &str, message: &str) -> SearchItem {
    SearchItem::new(
        id,
        base() + ChronoDuration::seconds(secs),
        service,
        "t1",
        Payload::Log(LogPayload {
            level: "error".to_string(),
            message: message.to_string(),
            fields: HashMap::new(),
        }),
    )
}

fn metric_item(id: &str, secs: i64, service: &str) -> SearchItem {
    SearchItem::new(
        id,
        base() + ChronoDuration::seconds(secs),
        service,
        "t1",
        Payload::Metric(MetricPayload {
            name: "http_request_duration_seconds".to_string(),
            value: 0.25,
            labels: HashMap::new(),
        }),
    )
}

fn trace_item(id: &str, secs: i64, service: &str, trace_id: &str) -> SearchItem {
    SearchItem::new(
        id,
        base() + ChronoDuration::seconds(secs),
        service,
        "t1",
        Payload::Trace(TracePayload {
            trace_id: trace_id.to_string(),
            span_id: format!("{}-root", id),
            operation: "GET /cart".to_string(),
            duration_ms: 42.0,
            status: "ok".to_string(),
        }),
    )
}

/// `count` items spread over the hour, each kind in its own service so no
/// correlation happens
fn spread(signal_type: SignalType, count: usize, offset_secs: i64) -> Vec<SearchItem> {
    (0..count)
        .map(|i| {
            let secs = offset_secs + i as i64 * 300;
            let id = format!("{}-{}", signal_type, i);
            match signal_type {
                SignalType::Logs => log_item(&id, secs, "log-svc", "request served"),
                SignalType::Metrics => metric_item(&id, secs, "metric-svc"),
                _ => trace_item(&id, secs, "trace-svc", &format!("trace-{}", i)),
            }
        })
        .collect()
}

fn test_config() -> FederationConfig {
    let mut config = FederationConfig::default();
    config.circuit_breaker.call_timeout_ms = 100;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = false;
    config.health.probe_timeout_ms = 50;
    config.streaming.window_count = 4;
    config
}

fn orchestrator(config: FederationConfig, backends: Vec<Arc<dyn BackendAdapter>>) -> QueryOrchestrator {
    let context = backends
        .into_iter()
        .fold(FederationContext::new(config).unwrap(), |ctx, b| ctx.with_backend(b));
    QueryOrchestrator::new(Arc::new(context))
}

fn memory(name: &str, signal_type: SignalType, items: Vec<SearchItem>) -> Arc<dyn BackendAdapter> {
    Arc::new(InMemoryBackend::new(name, signal_type).with_items(items))
}

fn sample_backends() -> Vec<Arc<dyn BackendAdapter>> {
    vec![
        memory("logs", SignalType::Logs, spread(SignalType::Logs, 10, 10)),
        memory("metrics", SignalType::Metrics, spread(SignalType::Metrics, 5, 20)),
        memory("traces", SignalType::Traces, spread(SignalType::Traces, 3, 30)),
    ]
}

fn assert_sorted_desc(items: &[SearchItem]) {
    for pair in items.windows(2) {
        assert!(
            pair[0].timestamp() >= pair[1].timestamp(),
            "{} before {} is out of order",
            pair[0].id(),
            pair[1].id()
        );
    }
}

/// Adapter whose behaviour tests can script
struct ScriptedBackend {
    inner: InMemoryBackend,
    search_delay: Duration,
    health_delay: Duration,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(name: &str, signal_type: SignalType, items: Vec<SearchItem>) -> Self {
        Self {
            inner: InMemoryBackend::new(name, signal_type).with_items(items),
            search_delay: Duration::ZERO,
            health_delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn signal_type(&self) -> SignalType {
        self.inner.signal_type()
    }

    async fn search(&self, query: &UnifiedQuery, tenant: &TenantId) -> Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.search_delay.is_zero() {
            tokio::time::sleep(self.search_delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::unavailable(self.inner.name(), "connection reset"));
        }
        self.inner.search(query, tenant).await
    }

    async fn health_check(&self) -> bool {
        tokio::time::sleep(self.health_delay).await;
        true
    }
}

#[tokio::test]
async fn test_sample_scenario_merges_all_backends() {
    let orchestrator = orchestrator(test_config(), sample_backends());
    let query = UnifiedQuery::new(SignalType::All, hour())
        .with_tenant("t1")
        .with_page(0, 50);

    let result = assert_ok!(orchestrator.search(query, &tenant()).await);

    assert_eq!(result.items.len(), 18);
    assert_eq!(result.stats.matched, 18);
    assert!(result.stats.scanned >= 18);
    assert_sorted_desc(&result.items);
    assert_eq!(result.stats.sources["logs"], SourceStatus::Count(10));
    assert_eq!(result.stats.sources["metrics"], SourceStatus::Count(5));
    assert_eq!(result.stats.sources["traces"], SourceStatus::Count(3));
    assert_eq!(result.facets.signal_types["logs"], 10);
    assert!(result.next_token.is_none());
}

#[tokio::test]
async fn test_next_token_walks_every_page() {
    let orchestrator = orchestrator(
        test_config(),
        vec![
            memory("logs", SignalType::Logs, spread(SignalType::Logs, 12, 10)),
            memory("traces", SignalType::Traces, spread(SignalType::Traces, 3, 30)),
        ],
    );

    let mut seen = Vec::new();
    let mut offset = 0;
    let mut pages = 0;
    loop {
        let query = UnifiedQuery::new(SignalType::All, hour()).with_page(offset, 5);
        let page = assert_ok!(orchestrator.search(query, &tenant()).await);
        assert_eq!(page.stats.matched, 15);
        assert_sorted_desc(&page.items);
        seen.extend(page.items.iter().map(|i| (i.timestamp(), i.id().to_string())));
        pages += 1;

        match page.next_token {
            Some(token) => {
                assert_eq!(page.items.len(), 5);
                offset = token.parse().unwrap();
            }
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 15);
    assert!(seen.windows(2).all(|w| w[0].0 >= w[1].0));
    let mut ids: Vec<_> = seen.into_iter().map(|(_, id)| id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 15);
}

#[tokio::test]
async fn test_timed_out_backend_is_marked_unavailable() {
    let mut slow = ScriptedBackend::new("metrics", SignalType::Metrics, spread(SignalType::Metrics, 5, 20));
    slow.search_delay = Duration::from_millis(500);
    let slow = Arc::new(slow);

    let orchestrator = orchestrator(
        test_config(),
        vec![
            memory("logs", SignalType::Logs, spread(SignalType::Logs, 10, 10)),
            slow.clone(),
            memory("traces", SignalType::Traces, spread(SignalType::Traces, 3, 30)),
        ],
    );

    let result = orchestrator
        .search(UnifiedQuery::new(SignalType::All, hour()), &tenant())
        .await
        .unwrap();

    assert!(result.stats.sources["metrics"] == "unavailable");
    assert_eq!(result.items.len(), 13);
    assert!(result.items.iter().all(|i| i.signal_type() != SignalType::Metrics));
    assert_sorted_desc(&result.items);
    // both attempts hit the breaker's call timeout
    assert_eq!(slow.calls(), 2);

    let record = orchestrator
        .context()
        .degradation()
        .record("metrics")
        .unwrap();
    assert!(record.fallback_active);
}

#[tokio::test]
async fn test_search_is_idempotent() {
    let orchestrator = orchestrator(test_config(), sample_backends());
    let query = UnifiedQuery::new(SignalType::All, hour()).with_tenant("t1");

    let first = orchestrator.search(query.clone(), &tenant()).await.unwrap();
    let second = orchestrator.search(query, &tenant()).await.unwrap();

    let mut a: Vec<_> = first.items.iter().map(|i| i.id().to_string()).collect();
    let mut b: Vec<_> = second.items.iter().map(|i| i.id().to_string()).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let mut items = spread(SignalType::Logs, 3, 10);
    items.push(SearchItem::new(
        "other-tenant",
        base() + ChronoDuration::seconds(5),
        "log-svc",
        "t2",
        Payload::Log(LogPayload {
            level: "info".to_string(),
            message: "not yours".to_string(),
            fields: HashMap::new(),
        }),
    ));
    let orchestrator = orchestrator(test_config(), vec![memory("logs", SignalType::Logs, items)]);

    let result = orchestrator
        .search(UnifiedQuery::new(SignalType::Logs, hour()), &tenant())
        .await
        .unwrap();

    assert_eq!(result.items.len(), 3);
    assert!(result.items.iter().all(|i| i.tenant() == "t1"));
}

#[tokio::test]
async fn test_signal_selector_limits_backends() {
    let orchestrator = orchestrator(test_config(), sample_backends());

    let result = orchestrator
        .search(UnifiedQuery::new(SignalType::Traces, hour()), &tenant())
        .await
        .unwrap();

    assert_eq!(result.items.len(), 3);
    assert_eq!(result.stats.sources.len(), 1);
    assert!(result.stats.sources.contains_key("traces"));
}

#[tokio::test]
async fn test_invalid_query_is_rejected() {
    let orchestrator = orchestrator(test_config(), sample_backends());
    let inverted = UnifiedQuery::new(SignalType::All, TimeRange::new(base(), base()));

    let error = assert_err!(orchestrator.search(inverted, &tenant()).await);

    assert_eq!(query_federation::api::status_code(&error), 400);
}

#[tokio::test]
async fn test_mixed_signals_are_correlated() {
    let orchestrator = orchestrator(
        test_config(),
        vec![
            memory(
                "logs",
                SignalType::Logs,
                vec![
                    log_item("near", 20, "payments", "charge for abc123 declined"),
                    log_item("far", 40, "payments", "charge retried"),
                ],
            ),
            memory("traces", SignalType::Traces, vec![trace_item("root", 0, "checkout", "abc123")]),
        ],
    );

    let result = orchestrator
        .search(UnifiedQuery::new(SignalType::All, hour()), &tenant())
        .await
        .unwrap();

    let by_id: HashMap<_, _> = result.items.iter().map(|i| (i.id(), i)).collect();
    assert_eq!(by_id["near"].correlation_id(), Some("abc123"));
    assert_eq!(by_id["far"].correlation_id(), None);
    assert_eq!(by_id["root"].correlation_id(), Some("abc123"));
}

#[tokio::test]
async fn test_open_circuit_skips_primary() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    let flaky = Arc::new(ScriptedBackend::new("logs", SignalType::Logs, spread(SignalType::Logs, 4, 10)));
    let orchestrator = orchestrator(config, vec![flaky.clone()]);
    let query = UnifiedQuery::new(SignalType::Logs, hour());

    let healthy = orchestrator.search(query.clone(), &tenant()).await.unwrap();
    assert_eq!(healthy.stats.sources["logs"], SourceStatus::Count(4));

    flaky.failing.store(true, Ordering::SeqCst);
    let failed = orchestrator.search(query.clone(), &tenant()).await.unwrap();
    assert!(failed.stats.sources["logs"] == "unavailable");
    assert!(failed.items.is_empty());
    // the second attempt was rejected by the open circuit
    assert_eq!(flaky.calls(), 2);

    let while_open = orchestrator.search(query, &tenant()).await.unwrap();
    assert!(while_open.stats.sources["logs"] == "unavailable");
    assert_eq!(flaky.calls(), 2);

    let stats = orchestrator.context().breakers().get("logs").unwrap().stats();
    assert_eq!(stats.state, resilience_rs::CircuitState::Open);
}

#[tokio::test]
async fn test_stream_emits_windows_then_one_terminal_chunk() {
    let orchestrator = orchestrator(test_config(), sample_backends());

    let stream = orchestrator
        .search_stream(UnifiedQuery::new(SignalType::All, hour()), &tenant())
        .unwrap();
    let chunks: Vec<StreamChunk> = stream.collect().await;

    let (last, partials) = chunks.split_last().unwrap();
    assert!(last.is_terminal());
    assert!(partials.iter().all(|c| !c.is_terminal()));
    // three backends, four windows each
    assert_eq!(partials.len(), 12);

    let mut per_backend: HashMap<String, Vec<TimeRange>> = HashMap::new();
    let mut streamed = 0;
    for chunk in partials {
        if let StreamChunk::Partial { backend, window, items, .. } = chunk {
            per_backend.entry(backend.clone()).or_default().push(*window);
            streamed += items.len();
        }
    }
    assert_eq!(streamed, 18);
    for windows in per_backend.values() {
        assert!(windows.windows(2).all(|w| w[0].start < w[1].start));
    }

    match last {
        StreamChunk::Completed { stats } => {
            assert_eq!(stats.sources["logs"], SourceStatus::Count(10));
            assert_eq!(stats.sources["traces"], SourceStatus::Count(3));
        }
        other => panic!("unexpected terminal chunk {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_stream_stops_window_queries() {
    let mut config = test_config();
    config.streaming.window_count = 20;
    config.streaming.channel_capacity = 1;
    config.circuit_breaker.call_timeout_ms = 1_000;
    let mut slow = ScriptedBackend::new("logs", SignalType::Logs, spread(SignalType::Logs, 10, 10));
    slow.search_delay = Duration::from_millis(20);
    let slow = Arc::new(slow);
    let orchestrator = orchestrator(config, vec![slow.clone()]);

    let mut stream = orchestrator
        .search_stream(UnifiedQuery::new(SignalType::All, hour()), &tenant())
        .unwrap();
    let first = stream.next().await.unwrap();
    assert!(!first.is_terminal());
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let calls = slow.calls();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(calls < 20, "expected early stop, saw {} window queries", calls);
    assert_eq!(slow.calls(), calls);
}

#[tokio::test]
async fn test_correlate_returns_related_items_and_graph() {
    let orchestrator = orchestrator(
        test_config(),
        vec![
            memory(
                "logs",
                SignalType::Logs,
                vec![
                    log_item("l1", 10, "checkout", "payment failed"),
                    log_item("l2", 900, "search", "index rebuilt"),
                ],
            ),
            memory("metrics", SignalType::Metrics, vec![metric_item("m1", 15, "checkout")]),
            memory("traces", SignalType::Traces, vec![trace_item("t1", 0, "checkout", "abc123")]),
        ],
    );

    let request = CorrelateRequest {
        trace_id: Some("abc123".to_string()),
        correlation_id: None,
        service: None,
        time_range: hour(),
    };
    let response = orchestrator.correlate(request, &tenant()).await.unwrap();

    let mut ids: Vec<_> = response.related_items.iter().map(|i| i.id().to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["l1", "m1", "t1"]);
    assert_eq!(response.correlation_graph.edges.len(), 3);
    assert!(response.confidence_score > 0.9);
}

#[tokio::test]
async fn test_correlate_without_selector_is_rejected() {
    let orchestrator = orchestrator(test_config(), sample_backends());
    let request = CorrelateRequest {
        trace_id: None,
        correlation_id: None,
        service: None,
        time_range: hour(),
    };

    let error = orchestrator.correlate(request, &tenant()).await.unwrap_err();

    assert!(matches!(error, Error::Correlation(_)));
}

#[tokio::test]
async fn test_health_probe_is_bounded() {
    let mut hanging = ScriptedBackend::new("traces", SignalType::Traces, Vec::new());
    hanging.health_delay = Duration::from_secs(5);
    let down = InMemoryBackend::new("metrics", SignalType::Metrics);
    down.set_healthy(false);

    let orchestrator = orchestrator(
        test_config(),
        vec![
            memory("logs", SignalType::Logs, Vec::new()),
            Arc::new(down),
            Arc::new(hanging),
        ],
    );

    let started = std::time::Instant::now();
    let health = orchestrator.health().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(health["logs"], true);
    assert_eq!(health["metrics"], false);
    assert_eq!(health["traces"], false);

    let report = orchestrator.health_report().await;
    assert!(!report.all_healthy());
    assert_eq!(report.degradation.len(), 3);
}
