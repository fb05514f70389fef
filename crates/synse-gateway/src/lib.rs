//! synse-gateway - Plugin registry, device cache and command dispatch
//!
//! This crate holds the state of a synse gateway: the plugins it knows,
//! what they last reported, and the writes it has forwarded to them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Gateway                               │
//! │                                                                │
//! │   transport layer ──▶ Dispatcher                               │
//! │                        │    │    │                             │
//! │          ┌─────────────┘    │    └──────────────┐              │
//! │          ▼                  ▼                   ▼              │
//! │   ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │   │ DeviceCache │   │PluginRegistry│   │TransactionTracker│    │
//! │   │  + TagIndex │   │  PluginLink  │   └──────────────────┘    │
//! │   └──────▲──────┘   └──────┬───────┘                           │
//! │          │  refresh loop   │ Instrumentation                   │
//! │          └─────────────────┤                                   │
//! │                            ▼                                   │
//! │                   plugins (PluginClient)                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use synse_gateway::{Gateway, GatewayConfig, TracingMetrics};
//!
//! let gateway = Gateway::new(config, connector, Arc::new(TracingMetrics))?;
//! gateway.start();
//!
//! let dispatcher = gateway.dispatcher();
//! let txn = dispatcher.write("led-1", WritePayload::new("state"))?;
//! let status = dispatcher.transaction(&txn.id)?;
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
mod gateway;
pub mod link;
pub mod metrics;
pub mod registry;
pub mod tags;
pub mod testing;
pub mod transactions;

pub use cache::{DeviceCache, DeviceFilter, RefreshReport};
pub use config::{CacheConfig, GatewayConfig, HealthConfig, RpcConfig, TransactionConfig};
pub use dispatcher::Dispatcher;
pub use gateway::Gateway;
pub use link::{MemoryConnector, PluginLink, TransportConnector};
pub use metrics::{InMemoryMetrics, Instrumentation, MetricsSink, TracingMetrics};
pub use registry::{PluginRegistry, Registration};
pub use tags::TagIndex;
pub use transactions::{SweepReport, TransactionTracker};

// Re-export core types for convenience
pub use synse_core::{GatewayError, GatewayResult};
