//! Command dispatcher - the entry point for the transport layer
//!
//! Reads are answered from the device cache and tag index. Writes are
//! resolved to their owning plugin, recorded as a transaction and forwarded
//! on a background task, so abandoning the caller never cancels the plugin
//! call or loses the transaction.

use std::sync::Arc;

use futures::StreamExt;
use synse_core::tags::{validate_namespace, validate_tag};
use synse_core::{
    Capability, DeviceRecord, GatewayError, GatewayResult, PluginHealth, PluginSummary,
    Transaction, TransactionStatus, TransactionUpdate, WritePayload,
};
use tracing::{debug, info, warn};

use crate::cache::{DeviceCache, DeviceFilter};
use crate::registry::PluginRegistry;
use crate::transactions::TransactionTracker;

/// Entry point used by the transport layer
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    cache: Arc<DeviceCache>,
    transactions: Arc<TransactionTracker>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        cache: Arc<DeviceCache>,
        transactions: Arc<TransactionTracker>,
    ) -> Self {
        Self {
            registry,
            cache,
            transactions,
        }
    }

    /// Cached state of one device, flagged stale when past the cache TTL
    pub fn read(&self, device_id: &str) -> GatewayResult<DeviceRecord> {
        self.cache.get(device_id)
    }

    /// All cached devices matching `filter`, ordered by device id
    pub fn scan(&self, filter: &DeviceFilter) -> GatewayResult<Vec<DeviceRecord>> {
        self.cache.list(filter)
    }

    /// Distinct tags visible under the namespace/identity filter
    pub fn tags(&self, namespaces: &[String], include_identity_tags: bool) -> GatewayResult<Vec<String>> {
        for namespace in namespaces {
            validate_namespace(namespace)?;
        }
        Ok(self
            .cache
            .view()
            .tags()
            .query(namespaces, include_identity_tags))
    }

    /// Ids of the devices carrying `tag`
    pub fn devices_for_tag(&self, tag: &str) -> GatewayResult<Vec<String>> {
        validate_tag(tag)?;
        Ok(self.cache.view().tags().devices(tag).into_iter().collect())
    }

    pub fn transaction(&self, transaction_id: &str) -> GatewayResult<Transaction> {
        self.transactions.get(transaction_id)
    }

    /// Ids of all transactions still tracked
    pub fn transactions(&self) -> Vec<String> {
        self.transactions.ids()
    }

    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.registry.summaries()
    }

    pub fn plugin(&self, plugin_id: &str) -> GatewayResult<PluginSummary> {
        Ok(self.registry.get(plugin_id)?.summary())
    }

    /// Forward a write to the device's plugin.
    ///
    /// Returns the new transaction in `pending` as soon as it is recorded;
    /// the plugin call and the status stream are driven in the background.
    pub fn write(&self, device_id: &str, payload: WritePayload) -> GatewayResult<Transaction> {
        if payload.action.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "Write payload requires an action".to_string(),
            ));
        }

        let record = self.cache.get(device_id)?;
        if !record.device.info.writable {
            return Err(GatewayError::InvalidRequest(format!(
                "Device {} is not writable",
                device_id
            )));
        }

        let plugin_id = record.device.plugin;
        let entry = self.registry.get(&plugin_id)?;
        if entry.health() == PluginHealth::Offline {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "Plugin {} is offline",
                plugin_id
            )));
        }
        if !entry.descriptor().capabilities.supports(Capability::Write) {
            return Err(GatewayError::UpstreamProtocol(format!(
                "Plugin {} does not support writes",
                plugin_id
            )));
        }

        let transaction = self.transactions.create(device_id, &plugin_id);
        info!(
            transaction_id = %transaction.id,
            device_id = %device_id,
            plugin_id = %plugin_id,
            action = %payload.action,
            "Forwarding write"
        );

        tokio::spawn(drive_write(
            self.registry.clone(),
            self.transactions.clone(),
            transaction.id.clone(),
            plugin_id,
            device_id.to_string(),
            payload,
        ));

        Ok(transaction)
    }
}

/// Issue the write and follow the plugin's status stream to a terminal state
async fn drive_write(
    registry: Arc<PluginRegistry>,
    transactions: Arc<TransactionTracker>,
    transaction_id: String,
    plugin_id: String,
    device_id: String,
    payload: WritePayload,
) {
    let fail = |context: String| {
        if let Err(e) = transactions.update(&transaction_id, TransactionUpdate::failed(context)) {
            debug!(transaction_id = %transaction_id, error = %e, "Transaction gone before failure was recorded");
        }
    };

    let ack = match registry
        .forward(&plugin_id, |link| async move {
            link.write(&device_id, &payload).await
        })
        .await
    {
        Ok(ack) => ack,
        Err(e) => {
            warn!(transaction_id = %transaction_id, plugin_id = %plugin_id, error = %e, "Write rejected");
            fail(e.to_string());
            return;
        }
    };

    if transactions
        .set_plugin_transaction(&transaction_id, &ack.transaction)
        .is_err()
    {
        return;
    }
    if let Err(e) = transactions.update(
        &transaction_id,
        TransactionUpdate::new(TransactionStatus::Writing),
    ) {
        debug!(transaction_id = %transaction_id, error = %e, "Transaction gone after acknowledgement");
        return;
    }

    let mut updates = match registry
        .forward(&plugin_id, |link| async move {
            link.transaction_status(&ack.transaction).await
        })
        .await
    {
        Ok(updates) => updates,
        Err(e) => {
            warn!(transaction_id = %transaction_id, plugin_id = %plugin_id, error = %e, "Could not follow write status");
            fail(e.to_string());
            return;
        }
    };

    let deadline = match transactions.deadline(&transaction_id) {
        Ok(deadline) => deadline,
        Err(_) => return,
    };

    loop {
        let item = match tokio::time::timeout_at(deadline, updates.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                // Past the deadline the tracker fails it; stop holding the stream
                debug!(transaction_id = %transaction_id, "No terminal status before deadline, closing status stream");
                return;
            }
        };
        match item {
            Ok(update) => match transactions.update(&transaction_id, update) {
                Ok(current) if current.status.is_terminal() => return,
                Ok(_) => {}
                Err(_) => return,
            },
            Err(e) => {
                if e.is_upstream_failure() {
                    if let Ok(entry) = registry.get(&plugin_id) {
                        registry.record_failure(&entry, &e);
                    }
                }
                warn!(transaction_id = %transaction_id, plugin_id = %plugin_id, error = %e, "Write status stream failed");
                fail(e.to_string());
                return;
            }
        }
    }

    // Stream closed early; the tracker's deadline settles it
    debug!(transaction_id = %transaction_id, "Write status stream ended before a terminal status");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::HealthConfig;
    use crate::link::MemoryConnector;
    use crate::metrics::{InMemoryMetrics, Instrumentation};
    use crate::testing::MockPlugin;
    use pretty_assertions::assert_eq;
    use synse_core::{Capabilities, DeviceInfo, PluginDescriptor, TransportKind};

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<PluginRegistry>,
        cache: Arc<DeviceCache>,
        mock: Arc<MockPlugin>,
    }

    async fn fixture_with(descriptor: PluginDescriptor) -> Fixture {
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("led-1", "led").with_tag("default/rack-1"));
        let mut locked = DeviceInfo::new("sensor-1", "temperature");
        locked.writable = false;
        mock.add_device(locked);

        let connector = Arc::new(MemoryConnector::new());
        connector.insert("emulator", mock.clone());
        let registry = Arc::new(PluginRegistry::new(
            connector,
            Instrumentation::new(Arc::new(InMemoryMetrics::new())),
            HealthConfig {
                degraded_after: 1,
                offline_after: 2,
                remove_after: None,
            },
            Duration::from_secs(5),
        ));
        registry.register(descriptor);

        let cache = Arc::new(DeviceCache::new(Duration::from_secs(20)));
        cache.refresh(&registry).await;

        let transactions = Arc::new(TransactionTracker::new(
            Duration::from_secs(20),
            Duration::from_secs(30),
        ));
        Fixture {
            dispatcher: Dispatcher::new(registry.clone(), cache.clone(), transactions),
            registry,
            cache,
            mock,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(PluginDescriptor::new(
            "emulator",
            "memory://emulator",
            TransportKind::Memory,
        ))
        .await
    }

    async fn wait_for(dispatcher: &Dispatcher, id: &str, status: TransactionStatus) -> Transaction {
        for _ in 0..100 {
            let txn = dispatcher.transaction(id).unwrap();
            if txn.status == status {
                return txn;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transaction {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn write_follows_status_stream() {
        let fx = fixture().await;
        let feed = fx.mock.transaction_feed("txn-1");

        let txn = fx
            .dispatcher
            .write("led-1", WritePayload::new("state").with("value", serde_json::json!("on")))
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);

        let writing = wait_for(&fx.dispatcher, &txn.id, TransactionStatus::Writing).await;
        assert_eq!(writing.plugin_transaction.as_deref(), Some("txn-1"));

        feed.send(TransactionUpdate::new(TransactionStatus::Writing)).unwrap();
        feed.send(TransactionUpdate::new(TransactionStatus::Success)).unwrap();
        wait_for(&fx.dispatcher, &txn.id, TransactionStatus::Success).await;

        let writes = fx.mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "led-1");
        assert_eq!(writes[0].1.action, "state");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_status_stream_is_closed_at_deadline() {
        let fx = fixture().await;
        let feed = fx.mock.transaction_feed("txn-1");
        let txn = fx.dispatcher.write("led-1", WritePayload::new("state")).unwrap();
        wait_for(&fx.dispatcher, &txn.id, TransactionStatus::Writing).await;
        assert!(!feed.is_closed());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(feed.is_closed());
        let failed = fx.dispatcher.transaction(&txn.id).unwrap();
        assert_eq!(failed.status, TransactionStatus::Failure);
    }

    #[tokio::test]
    async fn rejected_write_fails_transaction() {
        let fx = fixture().await;
        fx.mock
            .set_write_error(Some(GatewayError::InvalidRequest("bad color".to_string())));

        let txn = fx.dispatcher.write("led-1", WritePayload::new("color")).unwrap();
        let failed = wait_for(&fx.dispatcher, &txn.id, TransactionStatus::Failure).await;
        assert!(failed.context.unwrap().contains("bad color"));
    }

    #[tokio::test]
    async fn plugin_failure_update_is_recorded() {
        let fx = fixture().await;
        let feed = fx.mock.transaction_feed("txn-1");
        let txn = fx.dispatcher.write("led-1", WritePayload::new("state")).unwrap();

        feed.send(TransactionUpdate::failed("device busy")).unwrap();
        let failed = wait_for(&fx.dispatcher, &txn.id, TransactionStatus::Failure).await;
        assert_eq!(failed.context.as_deref(), Some("device busy"));
    }

    #[tokio::test]
    async fn write_refused_for_offline_plugin() {
        let fx = fixture().await;
        fx.mock.set_failing(true);
        for _ in 0..2 {
            let _ = fx
                .registry
                .forward("emulator", |link| async move { link.health().await })
                .await;
        }
        assert_eq!(fx.registry.health("emulator").unwrap(), PluginHealth::Offline);

        let result = fx.dispatcher.write("led-1", WritePayload::new("state"));
        assert!(matches!(result, Err(GatewayError::UpstreamUnavailable(_))));
        assert!(fx.dispatcher.transactions().is_empty());
    }

    #[tokio::test]
    async fn write_validation() {
        let fx = fixture().await;
        assert!(matches!(
            fx.dispatcher.write("nope", WritePayload::new("state")),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            fx.dispatcher.write("sensor-1", WritePayload::new("state")),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            fx.dispatcher.write("led-1", WritePayload::default()),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn write_requires_write_capability() {
        let fx = fixture_with(
            PluginDescriptor::new("emulator", "memory://emulator", TransportKind::Memory)
                .with_capabilities(Capabilities::read_only()),
        )
        .await;
        assert!(matches!(
            fx.dispatcher.write("led-1", WritePayload::new("state")),
            Err(GatewayError::UpstreamProtocol(_))
        ));
    }

    #[tokio::test]
    async fn read_scan_and_tags() {
        let fx = fixture().await;

        let record = fx.dispatcher.read("led-1").unwrap();
        assert_eq!(record.device.plugin, "emulator");

        let all = fx.dispatcher.scan(&DeviceFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(fx.dispatcher.tags(&[], false).unwrap(), vec!["default/rack-1"]);
        assert_eq!(
            fx.dispatcher.tags(&["system".to_string()], true).unwrap(),
            vec!["system/id:led-1", "system/id:sensor-1"]
        );
        assert!(matches!(
            fx.dispatcher.tags(&["".to_string()], false),
            Err(GatewayError::InvalidRequest(_))
        ));

        assert_eq!(fx.dispatcher.devices_for_tag("rack-1").unwrap(), vec!["led-1"]);
        assert_eq!(fx.cache.view().len(), 2);
    }

    #[tokio::test]
    async fn plugin_summaries() {
        let fx = fixture().await;
        let plugins = fx.dispatcher.plugins();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].id, "emulator");
        assert_eq!(plugins[0].health, PluginHealth::Online);
        assert!(plugins[0].last_contact.is_some());
        assert!(matches!(
            fx.dispatcher.plugin("ghost"),
            Err(GatewayError::NotFound(_))
        ));
    }
}
