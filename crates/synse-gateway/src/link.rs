//! RPC link - a managed client connection to one plugin
//!
//! The link establishes its [`PluginClient`] lazily through a [`Connector`]
//! on the first call, applies the per-call deadline, and routes every call
//! through the [`Instrumentation`] boundary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use parking_lot::RwLock;
use synse_core::{
    Connector, DeviceInfo, GatewayError, GatewayResult, HealthReport, PluginClient,
    PluginDescriptor, PluginMetadata, Reading, RpcMethod, TransactionUpdate, TransportKind,
    WriteAck, WritePayload,
};
use tracing::debug;

use crate::metrics::{CallKind, CallLabels, Instrumentation};

/// Managed connection to one plugin
pub struct PluginLink {
    descriptor: PluginDescriptor,
    connector: Arc<dyn Connector>,
    client: RwLock<Option<Arc<dyn PluginClient>>>,
    instrumentation: Instrumentation,
    timeout: Duration,
}

impl PluginLink {
    pub fn new(
        descriptor: PluginDescriptor,
        connector: Arc<dyn Connector>,
        instrumentation: Instrumentation,
        timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            connector,
            client: RwLock::new(None),
            instrumentation,
            timeout,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Whether a client has been established
    pub fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    /// Drop the established client; the next call reconnects
    pub fn reset(&self) {
        if self.client.write().take().is_some() {
            debug!(plugin_id = %self.descriptor.id, "Plugin link reset");
        }
    }

    async fn client(&self) -> GatewayResult<Arc<dyn PluginClient>> {
        let existing = self.client.read().clone();
        if let Some(client) = existing {
            return Ok(client);
        }

        let client = self.connector.connect(&self.descriptor).await?;
        debug!(
            plugin_id = %self.descriptor.id,
            address = %self.descriptor.address,
            transport = %self.descriptor.transport,
            "Established plugin link"
        );
        *self.client.write() = Some(client.clone());
        Ok(client)
    }

    fn deadline_exceeded(&self, method: RpcMethod) -> GatewayError {
        GatewayError::UpstreamTimeout(format!(
            "{} {} exceeded {:?}",
            self.descriptor.id,
            method.name(),
            self.timeout
        ))
    }

    /// Issue a request/response call
    pub async fn unary<T, F, Fut>(&self, method: RpcMethod, call: F) -> GatewayResult<T>
    where
        F: FnOnce(Arc<dyn PluginClient>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let labels = CallLabels::new(CallKind::Unary, &method.path(), &self.descriptor.id);
        let attempt = async {
            let client = self.client().await?;
            call(client).await
        };

        self.instrumentation
            .unary(&labels, async {
                tokio::time::timeout(self.timeout, attempt)
                    .await
                    .map_err(|_| self.deadline_exceeded(method))?
            })
            .await
    }

    /// Issue a request/stream-of-response call.
    ///
    /// The deadline applies to opening the stream only; the stream itself
    /// lives as long as the plugin keeps it open.
    pub async fn server_streaming<S, F, Fut>(
        &self,
        method: RpcMethod,
        call: F,
    ) -> GatewayResult<BoxStream<'static, S::Item>>
    where
        F: FnOnce(Arc<dyn PluginClient>) -> Fut,
        Fut: Future<Output = GatewayResult<S>>,
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
    {
        let labels = CallLabels::new(
            CallKind::ServerStreaming,
            &method.path(),
            &self.descriptor.id,
        );
        let attempt = async {
            let client = self.client().await?;
            call(client).await
        };

        self.instrumentation
            .server_streaming(labels, async {
                tokio::time::timeout(self.timeout, attempt)
                    .await
                    .map_err(|_| self.deadline_exceeded(method))?
            })
            .await
    }

    pub async fn metadata(&self) -> GatewayResult<PluginMetadata> {
        self.unary(RpcMethod::Metadata, |c| async move { c.metadata().await })
            .await
    }

    pub async fn devices(&self) -> GatewayResult<Vec<DeviceInfo>> {
        self.unary(RpcMethod::Devices, |c| async move { c.devices().await })
            .await
    }

    pub async fn read(&self, device_id: &str) -> GatewayResult<Vec<Reading>> {
        self.unary(RpcMethod::Read, |c| async move { c.read(device_id).await })
            .await
    }

    pub async fn write(&self, device_id: &str, payload: &WritePayload) -> GatewayResult<WriteAck> {
        self.unary(RpcMethod::Write, |c| async move {
            c.write(device_id, payload).await
        })
        .await
    }

    pub async fn transaction_status(
        &self,
        transaction_id: &str,
    ) -> GatewayResult<BoxStream<'static, GatewayResult<TransactionUpdate>>> {
        self.server_streaming(RpcMethod::Transaction, |c| async move {
            c.transaction_status(transaction_id).await
        })
        .await
    }

    pub async fn health(&self) -> GatewayResult<HealthReport> {
        self.unary(RpcMethod::Health, |c| async move { c.health().await })
            .await
    }
}

/// Connector for in-process plugins.
///
/// Clients are looked up by plugin identity, then by address, so a plugin
/// can be discovered before its identity is known.
#[derive(Default)]
pub struct MemoryConnector {
    clients: RwLock<HashMap<String, Arc<dyn PluginClient>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a client available under a plugin identity or address
    pub fn insert(&self, key: impl Into<String>, client: Arc<dyn PluginClient>) {
        self.clients.write().insert(key.into(), client);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn PluginClient>> {
        self.clients.write().remove(key)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, descriptor: &PluginDescriptor) -> GatewayResult<Arc<dyn PluginClient>> {
        let clients = self.clients.read();
        clients
            .get(&descriptor.id)
            .or_else(|| clients.get(&descriptor.address))
            .cloned()
            .ok_or_else(|| {
                GatewayError::UpstreamUnavailable(format!(
                    "No in-process plugin registered as {}",
                    descriptor.id
                ))
            })
    }
}

/// Connector that picks a sub-connector by transport kind
#[derive(Default)]
pub struct TransportConnector {
    by_kind: HashMap<TransportKind, Arc<dyn Connector>>,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: TransportKind, connector: Arc<dyn Connector>) -> Self {
        self.by_kind.insert(kind, connector);
        self
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, descriptor: &PluginDescriptor) -> GatewayResult<Arc<dyn PluginClient>> {
        let connector = self.by_kind.get(&descriptor.transport).ok_or_else(|| {
            GatewayError::UpstreamUnavailable(format!(
                "No connector for transport '{}' (plugin {})",
                descriptor.transport, descriptor.id
            ))
        })?;
        connector.connect(descriptor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::testing::MockPlugin;
    use futures::StreamExt;
    use synse_core::{TransactionStatus, TransportKind};

    fn link_for(mock: Arc<MockPlugin>, sink: Arc<InMemoryMetrics>) -> PluginLink {
        let connector = MemoryConnector::new();
        connector.insert("emulator", mock);
        PluginLink::new(
            PluginDescriptor::new("emulator", "memory://emulator", TransportKind::Memory),
            Arc::new(connector),
            Instrumentation::new(sink),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn connects_lazily() {
        let mock = Arc::new(MockPlugin::new("emulator"));
        let link = link_for(mock, Arc::new(InMemoryMetrics::new()));
        assert!(!link.is_connected());

        link.devices().await.unwrap();
        assert!(link.is_connected());

        link.reset();
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn unknown_in_process_plugin_is_unavailable() {
        let link = PluginLink::new(
            PluginDescriptor::new("ghost", "memory://ghost", TransportKind::Memory),
            Arc::new(MemoryConnector::new()),
            Instrumentation::new(Arc::new(InMemoryMetrics::new())),
            Duration::from_secs(5),
        );
        let err = link.devices().await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.set_latency(Duration::from_secs(30));
        let link = link_for(mock, Arc::new(InMemoryMetrics::new()));

        let err = link.devices().await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout(_)));
    }

    #[tokio::test]
    async fn streaming_call_is_counted_per_message() {
        let mock = Arc::new(MockPlugin::new("emulator"));
        let sink = Arc::new(InMemoryMetrics::new());
        let link = link_for(mock.clone(), sink.clone());

        let feed = mock.transaction_feed("t-1");
        feed.send(TransactionUpdate::new(TransactionStatus::Writing)).unwrap();
        feed.send(TransactionUpdate::new(TransactionStatus::Success)).unwrap();
        drop(feed);

        let updates: Vec<_> = link.transaction_status("t-1").await.unwrap().collect().await;
        assert_eq!(updates.len(), 2);

        let labels = CallLabels::new(
            CallKind::ServerStreaming,
            &RpcMethod::Transaction.path(),
            "emulator",
        );
        let stats = sink.get(&labels).unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 2);
    }

    #[tokio::test]
    async fn transport_connector_routes_by_kind() {
        let memory = MemoryConnector::new();
        memory.insert("emulator", Arc::new(MockPlugin::new("emulator")));
        let connector = TransportConnector::new().with(TransportKind::Memory, Arc::new(memory));

        let desc = PluginDescriptor::new("emulator", "memory://emulator", TransportKind::Memory);
        assert!(connector.connect(&desc).await.is_ok());

        let http = PluginDescriptor::new("emulator", "http://127.0.0.1:1", TransportKind::Http);
        assert!(matches!(
            connector.connect(&http).await,
            Err(GatewayError::UpstreamUnavailable(_))
        ));
    }
}
