//! Instrumentation boundary for plugin calls
//!
//! Every remote call through a [`PluginLink`](crate::link::PluginLink) passes
//! through [`Instrumentation`], which records a sent-message count, a
//! received-message count and the call latency, labelled by call kind,
//! service, method and plugin. Unary calls count one received message per
//! successful response; server-streaming calls count one per yielded item.
//! Exporting the numbers is left to whoever implements [`MetricsSink`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use synse_core::GatewayResult;
use tokio::time::Instant;
use tracing::trace;

/// Shape of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    ServerStreaming,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::ServerStreaming => "server_streaming",
        }
    }
}

/// Labels attached to every recorded metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallLabels {
    pub kind: CallKind,
    pub service: String,
    pub method: String,
    pub plugin: String,
}

impl CallLabels {
    /// Build labels from a `/{service}/{method}` path
    pub fn new(kind: CallKind, path: &str, plugin: &str) -> Self {
        let (service, method) = split_method(path);
        Self {
            kind,
            service: service.to_string(),
            method: method.to_string(),
            plugin: plugin.to_string(),
        }
    }
}

/// Split `/{service}/{method}` into its parts.
///
/// Returns empty strings when the path does not have both parts.
///
/// ```
/// # use synse_gateway::metrics::split_method;
/// assert_eq!(split_method("/synse.V3Plugin/Devices"), ("synse.V3Plugin", "Devices"));
/// assert_eq!(split_method("Devices"), ("", ""));
/// ```
pub fn split_method(path: &str) -> (&str, &str) {
    let items: Vec<&str> = path.split('/').collect();
    if items.len() < 3 {
        return ("", "");
    }
    (items[1], items[2])
}

/// Receiver of call measurements
pub trait MetricsSink: Send + Sync {
    fn message_sent(&self, labels: &CallLabels);
    fn message_received(&self, labels: &CallLabels);
    fn observe_latency(&self, labels: &CallLabels, latency: Duration);
}

/// Sink that emits every measurement as a `trace` event
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn message_sent(&self, labels: &CallLabels) {
        trace!(
            kind = labels.kind.as_str(),
            service = %labels.service,
            method = %labels.method,
            plugin = %labels.plugin,
            "rpc message sent"
        );
    }

    fn message_received(&self, labels: &CallLabels) {
        trace!(
            kind = labels.kind.as_str(),
            service = %labels.service,
            method = %labels.method,
            plugin = %labels.plugin,
            "rpc message received"
        );
    }

    fn observe_latency(&self, labels: &CallLabels, latency: Duration) {
        trace!(
            kind = labels.kind.as_str(),
            service = %labels.service,
            method = %labels.method,
            plugin = %labels.plugin,
            latency_ms = latency.as_millis() as u64,
            "rpc latency"
        );
    }
}

/// Accumulated numbers for one label set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub sent: u64,
    pub received: u64,
    pub calls_timed: u64,
    pub total_latency: Duration,
}

/// Sink that keeps counters in memory, for tests and for exporters to read
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    stats: Mutex<HashMap<CallLabels, CallStats>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numbers recorded for one label set
    pub fn get(&self, labels: &CallLabels) -> Option<CallStats> {
        self.stats.lock().get(labels).cloned()
    }

    /// All label sets with their numbers
    pub fn snapshot(&self) -> Vec<(CallLabels, CallStats)> {
        self.stats
            .lock()
            .iter()
            .map(|(labels, stats)| (labels.clone(), stats.clone()))
            .collect()
    }

    fn with_stats(&self, labels: &CallLabels, f: impl FnOnce(&mut CallStats)) {
        let mut stats = self.stats.lock();
        f(stats.entry(labels.clone()).or_default());
    }
}

impl MetricsSink for InMemoryMetrics {
    fn message_sent(&self, labels: &CallLabels) {
        self.with_stats(labels, |s| s.sent += 1);
    }

    fn message_received(&self, labels: &CallLabels) {
        self.with_stats(labels, |s| s.received += 1);
    }

    fn observe_latency(&self, labels: &CallLabels, latency: Duration) {
        self.with_stats(labels, |s| {
            s.calls_timed += 1;
            s.total_latency += latency;
        });
    }
}

/// Wraps remote calls, measures them and forwards their results unchanged
#[derive(Clone)]
pub struct Instrumentation {
    sink: Arc<dyn MetricsSink>,
}

impl Instrumentation {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    /// Request/response variant
    pub async fn unary<T, Fut>(&self, labels: &CallLabels, call: Fut) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.sink.message_sent(labels);
        let start = Instant::now();
        let result = call.await;
        self.sink.observe_latency(labels, start.elapsed());
        if result.is_ok() {
            self.sink.message_received(labels);
        }
        result
    }

    /// Request/stream-of-response variant.
    ///
    /// Latency covers opening the stream; each item the returned stream
    /// yields is counted as one received message.
    pub async fn server_streaming<S, Fut>(
        &self,
        labels: CallLabels,
        open: Fut,
    ) -> GatewayResult<BoxStream<'static, S::Item>>
    where
        Fut: Future<Output = GatewayResult<S>>,
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
    {
        self.sink.message_sent(&labels);
        let start = Instant::now();
        let result = open.await;
        self.sink.observe_latency(&labels, start.elapsed());
        let stream = result?;
        Ok(count_items(stream, self.sink.clone(), labels).boxed())
    }
}

/// Count every item a stream yields, passing items through untouched
pub fn count_items<S>(
    stream: S,
    sink: Arc<dyn MetricsSink>,
    labels: CallLabels,
) -> impl Stream<Item = S::Item>
where
    S: Stream,
{
    stream.inspect(move |_| sink.message_received(&labels))
}
