//! In-process plugin for tests
//!
//! [`MockPlugin`] implements [`PluginClient`] with scripted devices and
//! readings, failure injection, artificial latency and a per-transaction
//! status feed the test drives by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use synse_core::{
    Capabilities, DeviceInfo, GatewayError, GatewayResult, HealthReport, PluginClient,
    PluginMetadata, Reading, StatusStream, TransactionUpdate, WriteAck, WritePayload,
};
use tokio::sync::mpsc;

/// Scriptable in-process plugin
pub struct MockPlugin {
    id: String,
    capabilities: RwLock<Capabilities>,
    devices: RwLock<Vec<DeviceInfo>>,
    readings: RwLock<HashMap<String, Vec<Reading>>>,
    failing: AtomicBool,
    /// Message sent with `ok = false` from health checks
    unhealthy: RwLock<Option<String>>,
    latency: RwLock<Option<Duration>>,
    /// Error returned by the next writes instead of an acknowledgement
    write_error: RwLock<Option<GatewayError>>,
    write_seq: AtomicU64,
    writes: Mutex<Vec<(String, WritePayload)>>,
    feeds: Mutex<HashMap<String, mpsc::UnboundedReceiver<TransactionUpdate>>>,
}

impl MockPlugin {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: RwLock::new(Capabilities::read_write()),
            devices: RwLock::new(Vec::new()),
            readings: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
            unhealthy: RwLock::new(None),
            latency: RwLock::new(None),
            write_error: RwLock::new(None),
            write_seq: AtomicU64::new(0),
            writes: Mutex::new(Vec::new()),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a device, replacing one with the same id
    pub fn add_device(&self, device: DeviceInfo) {
        let mut devices = self.devices.write();
        devices.retain(|d| d.id != device.id);
        devices.push(device);
    }

    pub fn remove_device(&self, device_id: &str) {
        self.devices.write().retain(|d| d.id != device_id);
        self.readings.write().remove(device_id);
    }

    /// Answer health checks with `ok = false` and this message; `None` restores
    pub fn set_unhealthy(&self, message: Option<&str>) {
        *self.unhealthy.write() = message.map(str::to_string);
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *self.devices.write() = devices;
    }

    pub fn set_reading(&self, device_id: &str, readings: Vec<Reading>) {
        self.readings.write().insert(device_id.to_string(), readings);
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.write() = capabilities;
    }

    /// While failing, every call returns `UpstreamUnavailable`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay applied before every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    /// Reject writes with `error` until cleared with `None`
    pub fn set_write_error(&self, error: Option<GatewayError>) {
        *self.write_error.write() = error;
    }

    /// Writes received so far, in order
    pub fn writes(&self) -> Vec<(String, WritePayload)> {
        self.writes.lock().clone()
    }

    /// Open the status feed for a plugin-side transaction id.
    ///
    /// Updates sent on the returned handle are delivered to the status stream
    /// opened for `transaction_id`; dropping the handle ends that stream.
    /// Acknowledged writes are numbered `txn-1`, `txn-2`, ...
    pub fn transaction_feed(
        &self,
        transaction_id: &str,
    ) -> mpsc::UnboundedSender<TransactionUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(transaction_id.to_string(), rx);
        tx
    }

    async fn enter(&self) -> GatewayResult<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "{}: connection refused",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginClient for MockPlugin {
    async fn metadata(&self) -> GatewayResult<PluginMetadata> {
        self.enter().await?;
        Ok(PluginMetadata {
            id: self.id.clone(),
            name: format!("mock plugin {}", self.id),
            version: Some("test".to_string()),
            capabilities: self.capabilities.read().clone(),
        })
    }

    async fn devices(&self) -> GatewayResult<Vec<DeviceInfo>> {
        self.enter().await?;
        Ok(self.devices.read().clone())
    }

    async fn read(&self, device_id: &str) -> GatewayResult<Vec<Reading>> {
        self.enter().await?;
        if !self.devices.read().iter().any(|d| d.id == device_id) {
            return Err(GatewayError::NotFound(format!("Device not found: {}", device_id)));
        }
        Ok(self
            .readings
            .read()
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, device_id: &str, payload: &WritePayload) -> GatewayResult<WriteAck> {
        self.enter().await?;
        if let Some(error) = self.write_error.read().clone() {
            return Err(error);
        }
        if !self.devices.read().iter().any(|d| d.id == device_id) {
            return Err(GatewayError::NotFound(format!("Device not found: {}", device_id)));
        }

        self.writes
            .lock()
            .push((device_id.to_string(), payload.clone()));
        let seq = self.write_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(WriteAck {
            transaction: format!("txn-{}", seq),
        })
    }

    async fn transaction_status(&self, transaction_id: &str) -> GatewayResult<StatusStream> {
        self.enter().await?;
        let rx = self.feeds.lock().remove(transaction_id).ok_or_else(|| {
            GatewayError::NotFound(format!("Transaction not found: {}", transaction_id))
        })?;

        let updates = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (Ok(update), rx))
        });
        Ok(Box::pin(updates))
    }

    async fn health(&self) -> GatewayResult<HealthReport> {
        self.enter().await?;
        let unhealthy = self.unhealthy.read().clone();
        Ok(HealthReport {
            ok: unhealthy.is_none(),
            message: unhealthy,
        })
    }
}
