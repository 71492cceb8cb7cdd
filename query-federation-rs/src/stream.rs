//! Streaming federated search.
//!
//! Each backend's time range is split into consecutive windows that are
//! queried one after another; every resolved window becomes a chunk. Chunks
//! from different backends interleave. Once every backend is done a single
//! terminal chunk carries the consolidated stats, and nothing follows it.
//! Dropping the stream stops all producers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn, Instrument, Span};

use crate::backend::BackendAdapter;
use crate::context::FederationContext;
use crate::model::{SearchItem, SearchStats, SourceStatus, TenantId, TimeRange, UnifiedQuery};
use crate::orchestrator::guarded_search;

/// One element of a streamed search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Items one backend returned for one window
    Partial {
        backend: String,
        window: TimeRange,
        items: Vec<SearchItem>,
        status: SourceStatus,
    },
    /// Consolidated stats; always the last chunk
    Completed { stats: SearchStats },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Completed { .. })
    }
}

/// Finite, non-restartable sequence of [`StreamChunk`]s
#[derive(Debug)]
pub struct SearchStream {
    receiver: mpsc::Receiver<StreamChunk>,
    producer: JoinHandle<()>,
    finished: bool,
}

impl Stream for SearchStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    self.finished = true;
                    self.receiver.close();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Starts one producer per backend plus a coordinator that emits the
/// terminal chunk
pub(crate) fn spawn(
    context: Arc<FederationContext>,
    backends: Vec<Arc<dyn BackendAdapter>>,
    query: Arc<UnifiedQuery>,
    tenant: TenantId,
    span: Span,
) -> SearchStream {
    let settings = context.config().streaming.clone();
    let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));

    let producer = tokio::spawn(
        async move {
            let mut stats = SearchStats::default();
            let mut producers = JoinSet::new();

            for backend in backends {
                // replaced by the backend's own entry once it finishes
                stats.sources.insert(backend.name().to_string(), SourceStatus::error());
                producers.spawn(
                    stream_backend(
                        context.clone(),
                        backend,
                        query.clone(),
                        tenant.clone(),
                        settings.window_count,
                        sender.clone(),
                    )
                    .in_current_span(),
                );
            }

            while let Some(joined) = producers.join_next().await {
                match joined {
                    Ok(backend_stats) => stats.merge(backend_stats),
                    Err(join_error) => warn!(error = %join_error, "Stream producer failed"),
                }
            }

            debug!(matched = stats.matched, "Stream finished");
            let _ = sender.send(StreamChunk::Completed { stats }).await;
        }
        .instrument(span),
    );

    SearchStream {
        receiver,
        producer,
        finished: false,
    }
}

/// Queries one backend window by window, stopping early once the consumer
/// is gone
async fn stream_backend(
    context: Arc<FederationContext>,
    backend: Arc<dyn BackendAdapter>,
    query: Arc<UnifiedQuery>,
    tenant: TenantId,
    window_count: usize,
    sender: mpsc::Sender<StreamChunk>,
) -> SearchStats {
    let name = backend.name().to_string();
    let windows = query.time_range.split(window_count);
    let last = windows.len().saturating_sub(1);

    let mut stats = SearchStats::default();
    let mut returned = 0u64;
    let mut degraded: Option<SourceStatus> = None;

    for (idx, window) in windows.into_iter().enumerate() {
        if sender.is_closed() {
            debug!(backend = %name, "Consumer gone, no further windows");
            break;
        }

        let mut window_query = (*query).clone();
        window_query.time_range = window;
        let mut response = guarded_search(&context, &backend, Arc::new(window_query), &tenant).await;

        // windows share boundaries; an item on one belongs to the later window
        if idx != last {
            response.items.retain(|item| item.timestamp() < window.end);
        }

        let status = response
            .stats
            .sources
            .remove(&name)
            .unwrap_or_else(SourceStatus::error);
        if status.is_degraded() {
            degraded = Some(status.clone());
        }
        returned += response.items.len() as u64;
        stats.merge(response.stats);

        let chunk = StreamChunk::Partial {
            backend: name.clone(),
            window,
            items: response.items,
            status,
        };
        if sender.send(chunk).await.is_err() {
            break;
        }
    }

    stats
        .sources
        .insert(name, degraded.unwrap_or(SourceStatus::Count(returned)));
    stats
}
