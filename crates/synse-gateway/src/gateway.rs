//! Gateway - owns the registry, cache and tracker and runs their background loops
//!
//! One refresh cycle:
//!
//! ```text
//!   probe offline plugins (health) ──▶ refresh cache from every
//!   non-offline plugin ──▶ publish devices + tag index ──▶ prune plugins
//!   past `remove_after`
//! ```
//!
//! A second loop sweeps the transaction tracker.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use synse_core::{
    Capabilities, Connector, GatewayError, GatewayResult, PluginDescriptor, PluginHealth,
    TransportKind,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{DeviceCache, RefreshReport};
use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::link::PluginLink;
use crate::metrics::{Instrumentation, MetricsSink};
use crate::registry::{PluginRegistry, Registration};
use crate::transactions::{SweepReport, TransactionTracker};

/// The gateway core
pub struct Gateway {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    instrumentation: Instrumentation,
    registry: Arc<PluginRegistry>,
    cache: Arc<DeviceCache>,
    transactions: Arc<TransactionTracker>,
    /// Background loop handles
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway and register the plugins listed in the config
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let instrumentation = Instrumentation::new(metrics);
        let registry = Arc::new(PluginRegistry::new(
            connector.clone(),
            instrumentation.clone(),
            config.health,
            config.rpc.timeout(),
        ));
        let cache = Arc::new(DeviceCache::new(config.cache.ttl()));
        let transactions = Arc::new(TransactionTracker::from_config(&config.transaction));

        for descriptor in &config.plugins {
            registry.register(descriptor.clone());
        }

        Ok(Self {
            config,
            connector,
            instrumentation,
            registry,
            cache,
            transactions,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn transactions(&self) -> &Arc<TransactionTracker> {
        &self.transactions
    }

    /// Dispatcher over this gateway's state, for the transport layer
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.cache.clone(),
            self.transactions.clone(),
        )
    }

    pub fn register(&self, descriptor: PluginDescriptor) -> Registration {
        self.registry.register(descriptor)
    }

    /// Remove a plugin together with its devices and tags
    pub fn deregister(&self, plugin_id: &str) -> GatewayResult<PluginDescriptor> {
        remove_plugin(&self.registry, &self.cache, plugin_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Plugin not found: {}", plugin_id)))
    }

    /// Ask the plugin at `address` who it is and register it under that identity
    pub async fn discover(
        &self,
        address: &str,
        transport: TransportKind,
    ) -> GatewayResult<PluginDescriptor> {
        let probe = PluginLink::new(
            PluginDescriptor::new(address, address, transport),
            self.connector.clone(),
            self.instrumentation.clone(),
            self.config.rpc.timeout(),
        );
        let metadata = probe.metadata().await?;
        if metadata.id.is_empty() {
            return Err(GatewayError::UpstreamProtocol(format!(
                "Plugin at {} reported an empty identity",
                address
            )));
        }

        let capabilities = if metadata.capabilities == Capabilities::default() {
            debug!(plugin_id = %metadata.id, "Plugin declared no capabilities, assuming read/write");
            Capabilities::read_write()
        } else {
            metadata.capabilities
        };

        let descriptor =
            PluginDescriptor::new(metadata.id, address, transport).with_capabilities(capabilities);
        info!(
            plugin_id = %descriptor.id,
            address = %address,
            name = %metadata.name,
            version = metadata.version.as_deref().unwrap_or("unknown"),
            "Discovered plugin"
        );
        self.registry.register(descriptor.clone());
        Ok(descriptor)
    }

    /// Run one refresh cycle now
    pub async fn refresh(&self) -> RefreshReport {
        refresh_cycle(&self.registry, &self.cache).await
    }

    /// Run one transaction sweep now
    pub fn sweep(&self) -> SweepReport {
        self.transactions.sweep()
    }

    /// Start the refresh and sweep loops.
    ///
    /// The first refresh runs immediately. Calling `start` again restarts
    /// the loops.
    pub fn start(&self) {
        self.shutdown();

        let refresh_every = self.config.cache.refresh_interval();
        let sweep_every = self.config.transaction.sweep_interval();

        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let refresh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = refresh_cycle(&registry, &cache).await;
                debug!(
                    devices = report.devices,
                    failed = report.failed.len(),
                    "Refresh cycle complete"
                );
            }
        });

        let transactions = self.transactions.clone();
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                transactions.sweep();
            }
        });

        self.tasks.lock().extend([refresh, sweep]);
        info!(
            refresh_interval_secs = refresh_every.as_secs(),
            sweep_interval_secs = sweep_every.as_secs(),
            plugins = self.registry.len(),
            "Gateway started"
        );
    }

    /// Stop the background loops. In-flight writes keep running.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.abort();
        }
        info!("Gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|h| !h.is_finished())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn remove_plugin(
    registry: &PluginRegistry,
    cache: &DeviceCache,
    plugin_id: &str,
) -> Option<PluginDescriptor> {
    let removed = registry.deregister(plugin_id)?;
    cache.evict_plugin(plugin_id);
    Some(removed)
}

async fn refresh_cycle(registry: &PluginRegistry, cache: &DeviceCache) -> RefreshReport {
    let offline: Vec<String> = registry
        .entries()
        .iter()
        .filter(|entry| entry.health() == PluginHealth::Offline)
        .map(|entry| entry.id().to_string())
        .collect();

    let probes = join_all(offline.iter().map(|plugin_id| async move {
        let result = registry
            .forward(plugin_id, |link| async move {
                let report = link.health().await?;
                if report.ok {
                    Ok(())
                } else {
                    // Counts as a failed contact so pruning still applies
                    Err(GatewayError::UpstreamUnavailable(format!(
                        "Plugin {} reports unhealthy: {}",
                        plugin_id,
                        report.message.as_deref().unwrap_or("no reason given")
                    )))
                }
            })
            .await;
        (plugin_id.clone(), result)
    }))
    .await;

    let mut restored = Vec::new();
    for (plugin_id, result) in probes {
        match result {
            Ok(()) => restored.push(plugin_id),
            Err(e) => {
                debug!(plugin_id = %plugin_id, error = %e, "Offline plugin still unreachable");
            }
        }
    }

    let mut report = cache.refresh(registry).await;
    report.restored = restored;

    for entry in registry.entries() {
        if registry.should_remove(&entry) {
            warn!(
                plugin_id = %entry.id(),
                failures = entry.consecutive_failures(),
                "Removing unreachable plugin"
            );
            if remove_plugin(registry, cache, entry.id()).is_some() {
                report.pruned.push(entry.id().to_string());
            }
        }
    }
    report
}
