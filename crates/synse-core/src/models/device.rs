//! Device and reading models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device as enumerated by its owning plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Globally unique device identifier
    pub id: String,
    /// Device kind (e.g., "temperature", "led", "fan")
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque metadata (model, manufacturer, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Tags as reported by the plugin (`[namespace/]label[:annotation]`)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the device accepts writes
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            metadata: BTreeMap::new(),
            tags: Vec::new(),
            writable: true,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One reading value reported for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Reading type (e.g., "temperature", "state")
    #[serde(rename = "type")]
    pub kind: String,
    /// The value (JSON value to support various types)
    pub value: serde_json::Value,
    /// Unit of measurement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// When the plugin took the reading
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a new reading with the current timestamp
    pub fn new(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            value,
            unit: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// A device record as held by the gateway cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Identity of the owning plugin
    pub plugin: String,
    /// Last known readings; empty when the device has not reported yet
    #[serde(default)]
    pub readings: Vec<Reading>,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.info.id
    }
}

/// A cached device together with its freshness
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    #[serde(flatten)]
    pub device: Device,
    /// When the entry was inserted by a refresh cycle
    pub cached_at: DateTime<Utc>,
    /// Whether the entry is older than the cache TTL
    pub stale: bool,
}

/// Payload of a device write, forwarded to the plugin unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WritePayload {
    /// Action to perform (e.g., "state", "color")
    pub action: String,
    /// Action data
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl WritePayload {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}
