// query-federation-rs/src/main.rs
//
// Demo entry point for the federation service.
// Seeds in-memory backends from a fixture file and runs one request:
//
//   query-federation search    <fixtures.json> <query.json> [tenant]
//   query-federation stream    <fixtures.json> <query.json> [tenant]
//   query-federation correlate <fixtures.json> <request.json> <tenant>
//   query-federation health    <fixtures.json>
//
// Sample inputs live in `demos/`.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use query_federation::api::{self, CorrelateRequest};
use query_federation::{
    FederationConfig, FederationContext, InMemoryBackend, QueryOrchestrator, SearchItem,
    SignalType, TenantId, UnifiedQuery,
};
use resilience_rs::{init_logging, Error};

const USAGE: &str = "usage: query-federation <search|stream|correlate|health> <fixtures.json> [request.json] [tenant]";

#[derive(Debug, Deserialize)]
struct Fixtures {
    backends: Vec<BackendFixture>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendFixture {
    name: String,
    signal_type: SignalType,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default = "default_healthy")]
    healthy: bool,
    #[serde(default)]
    items: Vec<SearchItem>,
}

fn default_healthy() -> bool {
    true
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, Error> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("cannot read {}: {}", path, e)))?;
    Ok(serde_json::from_str(&raw)?)
}

fn build_context(config: FederationConfig, fixtures: Fixtures) -> Result<FederationContext, Error> {
    let mut context = FederationContext::new(config)?;
    for fixture in fixtures.backends {
        let backend = InMemoryBackend::new(fixture.name, fixture.signal_type)
            .with_items(fixture.items)
            .with_latency(Duration::from_millis(fixture.latency_ms));
        backend.set_healthy(fixture.healthy);
        context = context.with_backend(Arc::new(backend));
    }
    Ok(context)
}

fn tenant_for(explicit: Option<&String>, query_tenant: &str) -> Result<TenantId, Error> {
    match explicit {
        Some(tenant) => TenantId::new(tenant.as_str()),
        None => TenantId::new(query_tenant),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = FederationConfig::load()?;
    let _log_guard = init_logging(Some(config.logging.clone()))?;

    if config.metrics.enabled {
        let addr: SocketAddr = config.metrics.listen_addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(addr = %addr, "Prometheus exporter listening");
    }

    let args: Vec<String> = env::args().collect();
    let (mode, fixtures_path) = match (args.get(1), args.get(2)) {
        (Some(mode), Some(path)) => (mode.as_str(), path.as_str()),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let fixtures: Fixtures = read_json(fixtures_path)?;
    let context = build_context(config, fixtures)?;
    let orchestrator = QueryOrchestrator::new(Arc::new(context));
    info!(mode = %mode, backends = orchestrator.context().backends().len(), "Starting federation demo");

    let request_path = args.get(3).map(String::as_str);
    let tenant_arg = args.get(4);

    match (mode, request_path) {
        ("health", _) => {
            let report = orchestrator.health_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ("search", Some(path)) => {
            let query: UnifiedQuery = read_json(path)?;
            let tenant = tenant_for(tenant_arg, &query.tenant)?;
            let result = orchestrator.search(query, &tenant).await;
            match result {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    error!(status = api::status_code(&e), error = %e, "Search failed");
                    println!("{}", serde_json::to_string_pretty(&api::ErrorResponse::from(&e))?);
                }
            }
        }
        ("stream", Some(path)) => {
            let query: UnifiedQuery = read_json(path)?;
            let tenant = tenant_for(tenant_arg, &query.tenant)?;
            match orchestrator.search_stream(query.clone(), &tenant) {
                Ok(chunks) => {
                    let mut events = Box::pin(api::event_stream(Uuid::new_v4(), query, chunks));
                    while let Some(event) = events.next().await {
                        print!("{}", event.to_sse_frame()?);
                    }
                }
                Err(e) => print!("{}", api::error_event(&e).to_sse_frame()?),
            }
        }
        ("correlate", Some(path)) => {
            let request: CorrelateRequest = read_json(path)?;
            let tenant = tenant_for(tenant_arg, "")?;
            let response = orchestrator.correlate(request, &tenant).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}
