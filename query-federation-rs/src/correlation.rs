//! # Cross-Signal Correlation
//!
//! Links logs and metrics to the traces they most likely belong to and
//! scores how well a result set hangs together.
//!
//! Traces are processed in ascending timestamp order (ties by item id) and
//! the first trace to claim an item wins.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::{Payload, SearchItem, SignalType, TimeRange};

/// Half-width of the window around a trace in which items may link to it
pub const DEFAULT_CORRELATION_WINDOW_SECS: i64 = 30;

const DIVERSITY_WEIGHT: f64 = 0.3;
const RATIO_WEIGHT: f64 = 0.4;
const CLUSTERING_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub signal_type: SignalType,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Undirected link between two items sharing a correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub confidence: f64,
}

/// Stateless correlation engine
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    window: Duration,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_CORRELATION_WINDOW_SECS))
    }
}

impl CorrelationEngine {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Writes trace ids into the correlation id of linked items.
    ///
    /// Only items inside `time_range` take part. A log links to a trace in
    /// its window when its message or structured fields mention the trace id
    /// or it shares the trace's service; a metric links when it shares the
    /// service. A trace with at least one link is tagged with its own id, and
    /// so is every other span of that trace. Returns the number of items
    /// newly tagged.
    pub fn correlate(&self, items: &mut [SearchItem], time_range: &TimeRange) -> usize {
        let in_range = |item: &SearchItem| time_range.contains(item.timestamp());

        let mut traces: Vec<usize> = Vec::new();
        let mut logs: Vec<usize> = Vec::new();
        let mut metrics_by_service: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, item) in items.iter().enumerate() {
            if !in_range(item) {
                continue;
            }
            match item.signal_type() {
                SignalType::Traces => traces.push(idx),
                SignalType::Logs => logs.push(idx),
                SignalType::Metrics => metrics_by_service
                    .entry(item.service().to_string())
                    .or_default()
                    .push(idx),
                SignalType::All => {}
            }
        }

        let by_time = |a: &usize, b: &usize| {
            items[*a]
                .timestamp()
                .cmp(&items[*b].timestamp())
                .then_with(|| items[*a].id().cmp(items[*b].id()))
        };
        traces.sort_by(&by_time);
        logs.sort_by(&by_time);
        for partition in metrics_by_service.values_mut() {
            partition.sort_by(&by_time);
        }

        let mut tagged = 0;
        let mut grouped: HashSet<String> = HashSet::new();
        for &trace_idx in &traces {
            let (trace_id, service, at) = {
                let trace = &items[trace_idx];
                match trace.trace_id() {
                    Some(id) => (id.to_string(), trace.service().to_string(), trace.timestamp()),
                    None => continue,
                }
            };
            let lower = at - self.window;
            let upper = at + self.window;

            let mut linked = Vec::new();
            for &idx in window_slice(items, &logs, lower, upper) {
                let item = &items[idx];
                if item.correlation_id().is_none() && log_mentions(item, &trace_id, &service) {
                    linked.push(idx);
                }
            }
            if let Some(partition) = metrics_by_service.get(&service) {
                for &idx in window_slice(items, partition, lower, upper) {
                    if items[idx].correlation_id().is_none() {
                        linked.push(idx);
                    }
                }
            }

            if linked.is_empty() {
                continue;
            }
            for idx in linked {
                if items[idx].set_correlation_id(trace_id.as_str()) {
                    tagged += 1;
                }
            }
            if items[trace_idx].set_correlation_id(trace_id.as_str()) {
                tagged += 1;
            }
            grouped.insert(trace_id);
        }

        // spans of a grouped trace join the group even without links of their own
        for &trace_idx in &traces {
            let joins = items[trace_idx]
                .trace_id()
                .filter(|id| grouped.contains(*id))
                .map(str::to_string);
            if let Some(trace_id) = joins {
                if items[trace_idx].set_correlation_id(trace_id) {
                    tagged += 1;
                }
            }
        }

        debug!(items = items.len(), tagged = tagged, "Correlation pass finished");
        tagged
    }

    /// One node per item and an edge between every pair of items sharing a
    /// correlation id
    pub fn build_graph(&self, items: &[SearchItem]) -> CorrelationGraph {
        let nodes = items
            .iter()
            .map(|item| GraphNode {
                id: item.id().to_string(),
                signal_type: item.signal_type(),
                service: item.service().to_string(),
                timestamp: item.timestamp(),
                correlation_id: item.correlation_id().map(str::to_string),
            })
            .collect();

        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for item in items {
            if let Some(cid) = item.correlation_id() {
                groups.entry(cid).or_default().push(item.id());
            }
        }

        let mut edges = Vec::new();
        for (cid, members) in groups {
            for (i, source) in members.iter().enumerate() {
                for target in &members[i + 1..] {
                    edges.push(GraphEdge {
                        source: source.to_string(),
                        target: target.to_string(),
                        correlation_id: cid.to_string(),
                    });
                }
            }
        }

        CorrelationGraph {
            nodes,
            edges,
            confidence: self.confidence(items),
        }
    }

    /// Weighted blend of signal diversity, correlation ratio and service
    /// clustering, in `[0, 1]`
    pub fn confidence(&self, items: &[SearchItem]) -> f64 {
        if items.is_empty() {
            return 0.0;
        }

        let score = DIVERSITY_WEIGHT * signal_diversity(items)
            + RATIO_WEIGHT * correlation_ratio(items)
            + CLUSTERING_WEIGHT * service_clustering(items);
        score.clamp(0.0, 1.0)
    }
}

/// Items whose timestamp lies in `[lower, upper]`, given indices sorted by time
fn window_slice<'a>(
    items: &[SearchItem],
    sorted: &'a [usize],
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
) -> &'a [usize] {
    let begin = sorted.partition_point(|&i| items[i].timestamp() < lower);
    let end = sorted.partition_point(|&i| items[i].timestamp() <= upper);
    &sorted[begin..end.max(begin)]
}

fn log_mentions(item: &SearchItem, trace_id: &str, service: &str) -> bool {
    let Payload::Log(log) = item.payload() else {
        return false;
    };

    item.service() == service
        || log.message.contains(trace_id)
        || log.fields.values().any(|v| value_mentions(v, trace_id))
}

fn value_mentions(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(values) => values.iter().any(|v| value_mentions(v, needle)),
        Value::Object(map) => map.values().any(|v| value_mentions(v, needle)),
        _ => false,
    }
}

/// Distinct concrete signal types present, over 3
pub fn signal_diversity(items: &[SearchItem]) -> f64 {
    let distinct: HashSet<SignalType> = items
        .iter()
        .map(|i| i.signal_type())
        .filter(|t| *t != SignalType::All)
        .collect();
    distinct.len() as f64 / SignalType::CONCRETE.len() as f64
}

/// Share of items carrying a correlation id
pub fn correlation_ratio(items: &[SearchItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let correlated = items.iter().filter(|i| i.correlation_id().is_some()).count();
    correlated as f64 / items.len() as f64
}

/// Size of the largest single-service group, over all items
pub fn service_clustering(items: &[SearchItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let mut groups: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *groups.entry(item.service()).or_insert(0) += 1;
    }
    let largest = groups.values().copied().max().unwrap_or(0);
    largest as f64 / items.len() as f64
}
