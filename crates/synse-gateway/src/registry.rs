//! Plugin registry
//!
//! Tracks known plugins, owns one [`PluginLink`] per plugin, and keeps the
//! consecutive-failure counter that drives each plugin's health.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use synse_core::{
    Connector, GatewayError, GatewayResult, PluginDescriptor, PluginHealth, PluginSummary,
};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::link::PluginLink;
use crate::metrics::Instrumentation;

/// Outcome of [`PluginRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// The descriptor changed; the plugin got a fresh link and health
    Updated,
    Unchanged,
}

/// A health change caused by a recorded call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: PluginHealth,
    pub to: PluginHealth,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct HealthState {
    health: PluginHealth,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_contact: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            health: PluginHealth::Online,
            consecutive_failures: 0,
            last_error: None,
            last_contact: None,
        }
    }
}

/// A registered plugin
pub struct PluginEntry {
    descriptor: PluginDescriptor,
    link: Arc<PluginLink>,
    state: Mutex<HealthState>,
}

impl PluginEntry {
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn link(&self) -> &Arc<PluginLink> {
        &self.link
    }

    pub fn health(&self) -> PluginHealth {
        self.state.lock().health
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn summary(&self) -> PluginSummary {
        let state = self.state.lock();
        PluginSummary {
            id: self.descriptor.id.clone(),
            address: self.descriptor.address.clone(),
            transport: self.descriptor.transport,
            capabilities: self.descriptor.capabilities.clone(),
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            last_contact: state.last_contact,
        }
    }
}

/// Registry of known plugins and their health
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<PluginEntry>>>,
    connector: Arc<dyn Connector>,
    instrumentation: Instrumentation,
    thresholds: HealthConfig,
    rpc_timeout: Duration,
}

impl PluginRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        instrumentation: Instrumentation,
        thresholds: HealthConfig,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            connector,
            instrumentation,
            thresholds,
            rpc_timeout,
        }
    }

    /// Add or update a plugin. The link connects on first use.
    pub fn register(&self, descriptor: PluginDescriptor) -> Registration {
        let mut plugins = self.plugins.write();

        let outcome = match plugins.get(&descriptor.id) {
            Some(existing) if existing.descriptor == descriptor => return Registration::Unchanged,
            Some(_) => Registration::Updated,
            None => Registration::Added,
        };

        let link = Arc::new(PluginLink::new(
            descriptor.clone(),
            self.connector.clone(),
            self.instrumentation.clone(),
            self.rpc_timeout,
        ));
        let entry = Arc::new(PluginEntry {
            descriptor: descriptor.clone(),
            link,
            state: Mutex::new(HealthState::default()),
        });
        plugins.insert(descriptor.id.clone(), entry);

        info!(
            plugin_id = %descriptor.id,
            address = %descriptor.address,
            transport = %descriptor.transport,
            ?outcome,
            "Registered plugin"
        );
        outcome
    }

    /// Remove a plugin. Evicting its devices is the caller's job
    /// (see [`Gateway::deregister`](crate::Gateway::deregister)).
    pub fn deregister(&self, plugin_id: &str) -> Option<PluginDescriptor> {
        let removed = self.plugins.write().remove(plugin_id);
        if removed.is_some() {
            info!(plugin_id = %plugin_id, "Deregistered plugin");
        }
        removed.map(|entry| entry.descriptor.clone())
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.read().contains_key(plugin_id)
    }

    pub fn get(&self, plugin_id: &str) -> GatewayResult<Arc<PluginEntry>> {
        self.plugins
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Plugin not found: {}", plugin_id)))
    }

    /// Current health of a plugin
    pub fn health(&self, plugin_id: &str) -> GatewayResult<PluginHealth> {
        Ok(self.get(plugin_id)?.health())
    }

    /// Snapshot of all entries, sorted by id
    pub fn entries(&self) -> Vec<Arc<PluginEntry>> {
        let mut entries: Vec<_> = self.plugins.read().values().cloned().collect();
        entries.sort_by(|a, b| a.id().cmp(b.id()));
        entries
    }

    pub fn summaries(&self) -> Vec<PluginSummary> {
        self.entries().iter().map(|e| e.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Execute a call through a plugin's link and record its outcome.
    ///
    /// Works for unary calls and for opening streams alike; failures in
    /// the middle of a stream are reported with [`record_failure`](Self::record_failure).
    pub async fn forward<T, F, Fut>(&self, plugin_id: &str, call: F) -> GatewayResult<T>
    where
        F: FnOnce(Arc<PluginLink>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let entry = self.get(plugin_id)?;
        let result = call(entry.link.clone()).await;
        match &result {
            Ok(_) => {
                self.record_success(&entry);
            }
            Err(e) if e.is_upstream_failure() => {
                self.record_failure(&entry, e);
            }
            Err(_) => {}
        }
        result
    }

    /// Reset the failure counter; restores the plugin to online
    pub fn record_success(&self, entry: &PluginEntry) -> Option<HealthTransition> {
        let mut state = entry.state.lock();
        state.consecutive_failures = 0;
        state.last_contact = Some(Utc::now());

        let from = state.health;
        if from == PluginHealth::Online {
            return None;
        }
        state.health = PluginHealth::Online;
        info!(plugin_id = %entry.id(), from = %from, "Plugin back online");
        Some(HealthTransition {
            from,
            to: PluginHealth::Online,
            consecutive_failures: 0,
        })
    }

    /// Count one failure and move health along online → degraded → offline
    pub fn record_failure(
        &self,
        entry: &PluginEntry,
        error: &GatewayError,
    ) -> Option<HealthTransition> {
        let mut state = entry.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());

        let failures = state.consecutive_failures;
        let target = if failures >= self.thresholds.offline_after {
            PluginHealth::Offline
        } else if failures >= self.thresholds.degraded_after {
            PluginHealth::Degraded
        } else {
            state.health
        };

        debug!(plugin_id = %entry.id(), failures, error = %error, "Plugin call failed");

        let from = state.health;
        if target == from {
            return None;
        }
        state.health = target;
        drop(state);

        warn!(
            plugin_id = %entry.id(),
            from = %from,
            to = %target,
            failures,
            error = %error,
            "Plugin health changed"
        );
        if target == PluginHealth::Offline {
            entry.link.reset();
        }
        Some(HealthTransition {
            from,
            to: target,
            consecutive_failures: failures,
        })
    }

    /// Whether a plugin has failed often enough to be pruned
    pub fn should_remove(&self, entry: &PluginEntry) -> bool {
        self.thresholds
            .remove_after
            .is_some_and(|limit| entry.consecutive_failures() >= limit)
    }
}
