//! Request and response types consumed by the HTTP layer, server-sent
//! event framing and status code mapping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use resilience_rs::{CircuitBreakerStats, DegradationRecord, Error, ErrorKind, Result};

use crate::correlation::CorrelationGraph;
use crate::model::{SearchItem, SearchStats, TimeRange, UnifiedQuery};
use crate::stream::{SearchStream, StreamChunk};

/// Body of `POST search/correlate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelateRequest {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    pub time_range: TimeRange,
}

impl CorrelateRequest {
    /// Needs at least one selector and a non-empty time range
    pub fn validate(&self) -> Result<()> {
        let given = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        if !given(&self.trace_id) && !given(&self.correlation_id) && !given(&self.service) {
            return Err(Error::correlation(
                "one of traceId, correlationId or service is required",
            ));
        }
        if self.time_range.end <= self.time_range.start {
            return Err(Error::correlation("time range end must be after its start"));
        }
        Ok(())
    }

    /// Whether an item satisfies every selector that was given
    pub fn matches(&self, item: &SearchItem) -> bool {
        let trace_ok = self.trace_id.as_deref().map_or(true, |trace_id| {
            item.correlation_id() == Some(trace_id) || item.trace_id() == Some(trace_id)
        });
        let correlation_ok = self
            .correlation_id
            .as_deref()
            .map_or(true, |cid| item.correlation_id() == Some(cid));
        let service_ok = self
            .service
            .as_deref()
            .map_or(true, |service| item.service() == service);

        trace_ok && correlation_ok && service_ok
    }
}

/// Response of `POST search/correlate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelateResponse {
    pub related_items: Vec<SearchItem>,
    pub correlation_graph: CorrelationGraph,
    pub confidence_score: f64,
}

/// Response of `GET search/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub backends: BTreeMap<String, bool>,
    pub degradation: Vec<DegradationRecord>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.backends.values().all(|healthy| *healthy)
    }
}

/// Error body returned with a non-200 status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

impl From<&Error> for ErrorResponse {
    fn from(error: &Error) -> Self {
        Self {
            error: error.to_string(),
            kind: error.kind(),
        }
    }
}

/// HTTP status for a failed request: 400 for bad input, 500 otherwise
pub fn status_code(error: &Error) -> u16 {
    if error.is_client_error() {
        400
    } else {
        500
    }
}

/// HTTP status for a request outcome; partial results are still a 200
pub fn response_status<T>(result: &Result<T>) -> u16 {
    match result {
        Ok(_) => 200,
        Err(error) => status_code(error),
    }
}

/// Events of `POST search/stream`
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    SearchStarted { request_id: Uuid, query: UnifiedQuery },
    SearchChunk(StreamChunk),
    SearchCompleted { stats: SearchStats },
    SearchError(ErrorResponse),
}

impl SearchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SearchEvent::SearchStarted { .. } => "search_started",
            SearchEvent::SearchChunk(_) => "search_chunk",
            SearchEvent::SearchCompleted { .. } => "search_completed",
            SearchEvent::SearchError(_) => "search_error",
        }
    }

    /// JSON payload of the event
    pub fn data(&self) -> Result<String> {
        let data = match self {
            SearchEvent::SearchStarted { request_id, query } => {
                json!({ "requestId": request_id, "query": query })
            }
            SearchEvent::SearchChunk(chunk) => serde_json::to_value(chunk)?,
            SearchEvent::SearchCompleted { stats } => json!({ "stats": stats }),
            SearchEvent::SearchError(error) => serde_json::to_value(error)?,
        };
        Ok(serde_json::to_string(&data)?)
    }

    /// Renders the event as one server-sent event frame
    pub fn to_sse_frame(&self) -> Result<String> {
        Ok(format!("event: {}\ndata: {}\n\n", self.name(), self.data()?))
    }
}

impl From<StreamChunk> for SearchEvent {
    fn from(chunk: StreamChunk) -> Self {
        match chunk {
            StreamChunk::Completed { stats } => SearchEvent::SearchCompleted { stats },
            partial => SearchEvent::SearchChunk(partial),
        }
    }
}

/// Event sequence for one streamed search: `search_started`, the chunks,
/// then `search_completed`
pub fn event_stream(
    request_id: Uuid,
    query: UnifiedQuery,
    chunks: SearchStream,
) -> impl Stream<Item = SearchEvent> {
    stream::once(async move { SearchEvent::SearchStarted { request_id, query } })
        .chain(chunks.map(SearchEvent::from))
}

/// Event sequence for a stream that could not be started
pub fn error_event(error: &Error) -> SearchEvent {
    SearchEvent::SearchError(ErrorResponse::from(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
        )
    }

    #[test]
    fn test_correlate_request_needs_a_selector() {
        let request = CorrelateRequest {
            trace_id: None,
            correlation_id: Some("  ".to_string()),
            service: None,
            time_range: range(),
        };
        let error = request.validate().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Correlation);
        assert_eq!(status_code(&error), 400);

        let request = CorrelateRequest {
            service: Some("checkout".to_string()),
            ..request
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(response_status(&Ok::<_, Error>(())), 200);
        assert_eq!(response_status::<()>(&Err(Error::validation("bad limit"))), 400);
        assert_eq!(response_status::<()>(&Err(Error::internal("merge failed"))), 500);
    }

    #[test]
    fn test_sse_frame() {
        let event = SearchEvent::from(StreamChunk::Completed {
            stats: SearchStats {
                matched: 3,
                ..SearchStats::default()
            },
        });

        let frame = event.to_sse_frame().unwrap();
        assert!(frame.starts_with("event: search_completed\ndata: {"));
        assert!(frame.contains("\"matched\":3"));
        assert!(frame.ends_with("\n\n"));

        let error = error_event(&Error::validation("bad"));
        assert_eq!(error.name(), "search_error");
    }
}
