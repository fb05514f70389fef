//! Plugin models

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the gateway reaches a plugin process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP/JSON over TCP
    Http,
    /// In-process client handed to the gateway by embedding code
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::Memory => f.write_str("memory"),
        }
    }
}

/// A capability a plugin declares during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Device enumeration and reads
    Read,
    /// Device writes with transaction tracking
    Write,
}

/// Set of declared capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Capabilities of a plugin that can both read and write
    pub fn read_write() -> Self {
        [Capability::Read, Capability::Write].into_iter().collect()
    }

    /// Capabilities of a read-only plugin
    pub fn read_only() -> Self {
        [Capability::Read].into_iter().collect()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything the gateway needs to know to reach a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Stable plugin identity
    pub id: String,
    /// Network address (base URL for HTTP plugins)
    pub address: String,
    /// Transport used to reach the plugin
    pub transport: TransportKind,
    /// Declared capabilities
    #[serde(default = "Capabilities::read_write")]
    pub capabilities: Capabilities,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            transport,
            capabilities: Capabilities::read_write(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Metadata a plugin reports about itself during capability negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Identity the plugin registers under
    pub id: String,
    /// Human-readable name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Health state of a registered plugin
///
/// ```text
/// Online ──failures >= degraded_after──▶ Degraded ──failures >= offline_after──▶ Offline
///   ▲                                        │                                     │
///   └──────────────── any successful call ───┴─────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginHealth {
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for PluginHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginHealth::Online => "online",
            PluginHealth::Degraded => "degraded",
            PluginHealth::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Health check answer from a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether the plugin considers itself healthy
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Registry view of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub address: String,
    pub transport: TransportKind,
    pub capabilities: Capabilities,
    pub health: PluginHealth,
    /// Consecutive failed calls since the last success
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_contact: Option<DateTime<Utc>>,
}
