//! PluginClient trait - the remote-procedure surface of a plugin process

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::GatewayResult;
use crate::models::{
    DeviceInfo, HealthReport, PluginDescriptor, PluginMetadata, Reading, TransactionUpdate,
    WriteAck, WritePayload,
};

/// Server-streaming response carrying transaction state transitions
pub type StatusStream = Pin<Box<dyn Stream<Item = GatewayResult<TransactionUpdate>> + Send>>;

/// Remote calls a plugin serves.
///
/// Implementations translate these into their wire protocol. Errors must be
/// mapped onto [`GatewayError`](crate::GatewayError): connection problems to
/// `UpstreamUnavailable`, deadlines to `UpstreamTimeout`, undecodable
/// answers to `UpstreamProtocol`.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Capability negotiation: identity, version and declared capabilities
    async fn metadata(&self) -> GatewayResult<PluginMetadata>;

    /// Device enumeration
    async fn devices(&self) -> GatewayResult<Vec<DeviceInfo>>;

    /// Read the current values of one device
    async fn read(&self, device_id: &str) -> GatewayResult<Vec<Reading>>;

    /// Issue a write; the plugin acknowledges with its own transaction id
    async fn write(&self, device_id: &str, payload: &WritePayload) -> GatewayResult<WriteAck>;

    /// Stream the state transitions of a plugin-side transaction
    async fn transaction_status(&self, transaction_id: &str) -> GatewayResult<StatusStream>;

    /// Liveness probe
    async fn health(&self) -> GatewayResult<HealthReport>;
}

/// Establishes clients for plugin descriptors.
///
/// The registry calls this lazily, on the first call routed to a plugin.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &PluginDescriptor) -> GatewayResult<Arc<dyn PluginClient>>;
}

/// The remote methods of the plugin service, used to label instrumentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    Metadata,
    Devices,
    Read,
    Write,
    Transaction,
    Health,
}

impl RpcMethod {
    /// Service name shared by all plugin methods
    pub const SERVICE: &'static str = "synse.V3Plugin";

    /// Fully-qualified method path, `/{service}/{method}`
    pub fn path(self) -> String {
        format!("/{}/{}", Self::SERVICE, self.name())
    }

    pub fn name(self) -> &'static str {
        match self {
            RpcMethod::Metadata => "Metadata",
            RpcMethod::Devices => "Devices",
            RpcMethod::Read => "Read",
            RpcMethod::Write => "WriteAsync",
            RpcMethod::Transaction => "Transaction",
            RpcMethod::Health => "Health",
        }
    }
}
