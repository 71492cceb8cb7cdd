//! Data model shared by the orchestrator, the backend adapters and the
//! correlation engine.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use resilience_rs::{Error, Result};

/// Largest page a single query may request
pub const MAX_LIMIT: usize = 10_000;

const DEFAULT_LIMIT: usize = 100;

/// Kind of telemetry signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Logs,
    Metrics,
    Traces,
    All,
}

impl SignalType {
    /// Concrete signal types, one per backend kind
    pub const CONCRETE: [SignalType; 3] = [SignalType::Logs, SignalType::Metrics, SignalType::Traces];

    /// Whether a query for `self` covers items of `other`
    pub fn includes(self, other: SignalType) -> bool {
        self == SignalType::All || self == other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Logs => "logs",
            SignalType::Metrics => "metrics",
            SignalType::Traces => "traces",
            SignalType::All => "all",
        }
    }
}

impl Default for SignalType {
    fn default() -> Self {
        SignalType::All
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `duration` leading up to now
    pub fn last(duration: Duration) -> Self {
        let end = Utc::now();
        Self { start: end - duration, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Splits the range into `count` consecutive windows in ascending order.
    ///
    /// Windows share their boundaries; the last one always ends at `end`.
    pub fn split(&self, count: usize) -> Vec<TimeRange> {
        let count = count.max(1);
        let total_ms = self.duration().num_milliseconds().max(0);
        let step = total_ms / count as i64;

        if step == 0 {
            return vec![*self];
        }

        (0..count)
            .map(|i| {
                let start = self.start + Duration::milliseconds(step * i as i64);
                let end = if i + 1 == count {
                    self.end
                } else {
                    self.start + Duration::milliseconds(step * (i as i64 + 1))
                };
                TimeRange { start, end }
            })
            .collect()
    }
}

/// Comparison applied by a [`Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
}

/// A structured predicate on one item field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluates the filter against an item
    pub fn matches(&self, item: &SearchItem) -> bool {
        let actual = item.field(&self.field);

        match self.operator {
            FilterOperator::Exists => actual.is_some(),
            FilterOperator::Ne => actual.map_or(true, |v| !loosely_equal(&v, &self.value)),
            FilterOperator::Eq => actual.map_or(false, |v| loosely_equal(&v, &self.value)),
            FilterOperator::Contains => actual.map_or(false, |v| contains(&v, &self.value)),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::String(a), other) | (other, Value::String(a)) => a == &other.to_string(),
            _ => actual == expected,
        },
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Array(values), needle) => values.iter().any(|v| loosely_equal(v, needle)),
        (haystack, Value::String(needle)) => haystack.to_string().contains(needle.as_str()),
        _ => false,
    }
}

fn compare(actual: Option<Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

/// Field items are ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    Service,
    SignalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

/// A single logical search across every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedQuery {
    #[serde(default)]
    pub free_text: String,
    #[serde(default, rename = "type")]
    pub signal_type: SignalType,
    pub time_range: TimeRange,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub tenant: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_field: SortField,
    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl UnifiedQuery {
    /// Query for every signal in `time_range` with default paging
    pub fn new(signal_type: SignalType, time_range: TimeRange) -> Self {
        Self {
            free_text: String::new(),
            signal_type,
            time_range,
            filters: Vec::new(),
            tenant: String::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_field: SortField::default(),
            sort_direction: SortDirection::default(),
        }
    }

    pub fn with_free_text(mut self, text: impl Into<String>) -> Self {
        self.free_text = text.into();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, field: SortField, direction: SortDirection) -> Self {
        self.sort_field = field;
        self.sort_direction = direction;
        self
    }

    /// Checks paging, time range and filters
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(Error::validation(format!(
                "limit must be between 1 and {}, got {}",
                MAX_LIMIT, self.limit
            )));
        }
        if self.time_range.end <= self.time_range.start {
            return Err(Error::validation("time range end must be after its start"));
        }
        if let Some(filter) = self.filters.iter().find(|f| f.field.trim().is_empty()) {
            return Err(Error::validation(format!(
                "filter with operator {:?} has an empty field name",
                filter.operator
            )));
        }
        Ok(())
    }

    /// Whether an item satisfies the free text and every filter
    pub fn matches(&self, item: &SearchItem) -> bool {
        self.signal_type.includes(item.signal_type())
            && self.time_range.contains(item.timestamp())
            && item.matches_text(&self.free_text)
            && self.filters.iter().all(|f| f.matches(item))
    }
}

/// Tenant every guarded operation runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::validation("tenant identifier must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    #[serde(default)]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPayload {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePayload {
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub status: String,
}

/// Signal-specific part of a [`SearchItem`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Log(LogPayload),
    Metric(MetricPayload),
    Trace(TracePayload),
}

impl Payload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Payload::Log(_) => SignalType::Logs,
            Payload::Metric(_) => SignalType::Metrics,
            Payload::Trace(_) => SignalType::Traces,
        }
    }
}

/// One normalized result row.
///
/// Immutable once built, except for the correlation id which can be set
/// exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchItem {
    id: String,
    timestamp: DateTime<Utc>,
    signal_type: SignalType,
    service: String,
    tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    payload: Payload,
}

impl SearchItem {
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        service: impl Into<String>,
        tenant: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            signal_type: payload.signal_type(),
            service: service.into(),
            tenant: tenant.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn signal_type(&self) -> SignalType {
        self.signal_type
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Sets the correlation id unless one is already set.
    /// Returns whether the id was written.
    pub fn set_correlation_id(&mut self, id: impl Into<String>) -> bool {
        if self.correlation_id.is_some() {
            return false;
        }
        self.correlation_id = Some(id.into());
        true
    }

    /// Trace id of a trace item
    pub fn trace_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Trace(trace) => Some(&trace.trace_id),
            _ => None,
        }
    }

    /// Looks up a field by name for filter evaluation
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => return Some(Value::from(self.id.as_str())),
            "service" => return Some(Value::from(self.service.as_str())),
            "tenant" => return Some(Value::from(self.tenant.as_str())),
            "signal_type" | "signalType" => return Some(Value::from(self.signal_type.as_str())),
            "correlation_id" | "correlationId" => {
                return self.correlation_id.as_deref().map(Value::from)
            }
            _ => {}
        }

        match &self.payload {
            Payload::Log(log) => match name {
                "level" => Some(Value::from(log.level.as_str())),
                "message" => Some(Value::from(log.message.as_str())),
                other => log
                    .fields
                    .get(other.strip_prefix("fields.").unwrap_or(other))
                    .cloned(),
            },
            Payload::Metric(metric) => match name {
                "name" => Some(Value::from(metric.name.as_str())),
                "value" => Some(Value::from(metric.value)),
                other => metric
                    .labels
                    .get(other.strip_prefix("labels.").unwrap_or(other))
                    .map(|v| Value::from(v.as_str())),
            },
            Payload::Trace(trace) => match name {
                "trace_id" | "traceId" => Some(Value::from(trace.trace_id.as_str())),
                "span_id" | "spanId" => Some(Value::from(trace.span_id.as_str())),
                "operation" => Some(Value::from(trace.operation.as_str())),
                "duration_ms" | "durationMs" => Some(Value::from(trace.duration_ms)),
                "status" => Some(Value::from(trace.status.as_str())),
                _ => None,
            },
        }
    }

    /// Case-insensitive free-text match; an empty needle matches everything
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.trim();
        if needle.is_empty() {
            return true;
        }
        let needle = needle.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&needle);

        hit(&self.service)
            || match &self.payload {
                Payload::Log(log) => hit(&log.message),
                Payload::Metric(metric) => hit(&metric.name),
                Payload::Trace(trace) => hit(&trace.operation) || hit(&trace.trace_id),
            }
    }
}

/// Item comparison for the requested sort; ties are broken by id ascending
/// whatever the direction.
pub fn compare_items(
    a: &SearchItem,
    b: &SearchItem,
    field: SortField,
    direction: SortDirection,
) -> Ordering {
    let primary = match field {
        SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortField::Service => a.service.cmp(&b.service),
        SortField::SignalType => a.signal_type.cmp(&b.signal_type),
    };
    let primary = match direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

/// Stable sort by [`compare_items`]
pub fn sort_items(items: &mut [SearchItem], field: SortField, direction: SortDirection) {
    items.sort_by(|a, b| compare_items(a, b, field, direction));
}

/// Per-backend contribution to a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceStatus {
    /// Number of items the backend contributed
    Count(u64),
    /// Why the backend did not contribute normally
    Marker(String),
}

impl SourceStatus {
    pub const UNAVAILABLE: &'static str = "unavailable";
    pub const STALE: &'static str = "stale";
    pub const ERROR: &'static str = "error";

    pub fn unavailable() -> Self {
        SourceStatus::Marker(Self::UNAVAILABLE.to_string())
    }

    pub fn stale() -> Self {
        SourceStatus::Marker(Self::STALE.to_string())
    }

    pub fn error() -> Self {
        SourceStatus::Marker(Self::ERROR.to_string())
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SourceStatus::Marker(_))
    }
}

impl PartialEq<&str> for SourceStatus {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, SourceStatus::Marker(m) if m == other)
    }
}

/// Run statistics of a search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    pub matched: u64,
    pub scanned: u64,
    pub latency_ms: u64,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceStatus>,
}

impl SearchStats {
    /// Sums counts, keeps the slowest latency and merges source maps
    pub fn merge(&mut self, other: SearchStats) {
        self.matched += other.matched;
        self.scanned += other.scanned;
        self.latency_ms = self.latency_ms.max(other.latency_ms);
        self.sources.extend(other.sources);
    }
}

/// Candidate counts by signal type and service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facets {
    pub signal_types: BTreeMap<String, u64>,
    pub services: BTreeMap<String, u64>,
}

impl Facets {
    pub fn from_items(items: &[SearchItem]) -> Self {
        let mut facets = Facets::default();
        for item in items {
            *facets
                .signal_types
                .entry(item.signal_type.as_str().to_string())
                .or_insert(0) += 1;
            *facets.services.entry(item.service.clone()).or_insert(0) += 1;
        }
        facets
    }
}

/// Merged, sorted and paginated result of a federated search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedResult {
    pub items: Vec<SearchItem>,
    pub stats: SearchStats,
    pub facets: Facets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}
