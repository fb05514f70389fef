//! Device & reading cache
//!
//! The cache publishes immutable [`CacheView`] snapshots: a refresh builds a
//! new device map and its [`TagIndex`] together, then swaps the visible
//! reference. Readers holding a view never observe a half-applied refresh,
//! and the tag index in a view only ever references devices in that view.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use synse_core::tags::validate_tag;
use synse_core::{
    Capability, Device, DeviceRecord, GatewayError, GatewayResult, PluginHealth,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::{PluginEntry, PluginRegistry};
use crate::tags::TagIndex;

/// A device together with the moment it entered the cache
#[derive(Debug, Clone)]
pub struct CachedDevice {
    pub device: Device,
    pub cached_at: DateTime<Utc>,
    inserted: Instant,
}

impl CachedDevice {
    fn new(device: Device) -> Self {
        Self {
            device,
            cached_at: Utc::now(),
            inserted: Instant::now(),
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() > ttl
    }

    fn record(&self, ttl: Duration) -> DeviceRecord {
        DeviceRecord {
            device: self.device.clone(),
            cached_at: self.cached_at,
            stale: self.is_stale(ttl),
        }
    }
}

/// One published, immutable cache snapshot
#[derive(Debug, Default)]
pub struct CacheView {
    devices: BTreeMap<String, CachedDevice>,
    tags: TagIndex,
    generation: u64,
}

impl CacheView {
    fn new(devices: BTreeMap<String, CachedDevice>, generation: u64) -> Self {
        let tags = TagIndex::rebuild(devices.values().map(|c| &c.device));
        Self {
            devices,
            tags,
            generation,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&CachedDevice> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &CachedDevice> {
        self.devices.values()
    }

    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    /// Number of publishes that led to this view
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Scan filter; all set criteria must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Tags the device must all carry; unqualified tags mean `default/`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning plugin
    #[serde(default)]
    pub plugin: Option<String>,
    /// Device kind
    #[serde(default)]
    pub kind: Option<String>,
}

impl DeviceFilter {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn validate(&self) -> GatewayResult<()> {
        for tag in &self.tags {
            validate_tag(tag)?;
        }
        Ok(())
    }

    fn matches(&self, device: &Device) -> bool {
        self.plugin.as_deref().map_or(true, |p| p == device.plugin)
            && self.kind.as_deref().map_or(true, |k| k == device.info.kind)
    }
}

/// What one refresh cycle did
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Plugins whose device entries were replaced
    pub refreshed: Vec<String>,
    /// Plugins whose refresh failed; their previous entries were kept
    pub failed: Vec<(String, GatewayError)>,
    /// Plugins whose entries were evicted because they are offline
    pub evicted: Vec<String>,
    /// Offline plugins that answered the health probe and came back
    pub restored: Vec<String>,
    /// Plugins removed from the registry after too many failures
    pub pruned: Vec<String>,
    /// Devices in the published view
    pub devices: usize,
}

/// TTL-bounded snapshot of every plugin's devices and readings
pub struct DeviceCache {
    view: RwLock<Arc<CacheView>>,
    /// Serializes the mutate-then-publish step
    publish: Mutex<()>,
    /// Serializes whole refresh cycles
    cycle: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl DeviceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            view: RwLock::new(Arc::new(CacheView::default())),
            publish: Mutex::new(()),
            cycle: tokio::sync::Mutex::new(()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The currently published snapshot
    pub fn view(&self) -> Arc<CacheView> {
        self.view.read().clone()
    }

    /// Look up a cached device; stale entries are served with `stale` set
    pub fn get(&self, device_id: &str) -> GatewayResult<DeviceRecord> {
        self.view()
            .get(device_id)
            .map(|cached| cached.record(self.ttl))
            .ok_or_else(|| GatewayError::NotFound(format!("Device not found: {}", device_id)))
    }

    /// All cached devices matching the filter, ordered by device id
    pub fn list(&self, filter: &DeviceFilter) -> GatewayResult<Vec<DeviceRecord>> {
        filter.validate()?;
        let view = self.view();

        let candidates: Option<BTreeSet<String>> =
            filter.tags.iter().fold(None, |acc, tag| {
                let tagged = view.tags().devices(tag);
                Some(match acc {
                    None => tagged,
                    Some(acc) => acc.intersection(&tagged).cloned().collect(),
                })
            });

        let records = view
            .devices()
            .filter(|cached| {
                candidates
                    .as_ref()
                    .map_or(true, |ids| ids.contains(cached.device.id()))
            })
            .filter(|cached| filter.matches(&cached.device))
            .map(|cached| cached.record(self.ttl))
            .collect();
        Ok(records)
    }

    /// Pull devices and readings from every registered, non-offline plugin.
    ///
    /// Plugins are refreshed concurrently. A plugin whose refresh fails keeps
    /// its previous entries unless it has gone offline, in which case they are
    /// evicted. The new view, tag index included, is published once after all
    /// plugins have answered.
    pub async fn refresh(&self, registry: &PluginRegistry) -> RefreshReport {
        let _cycle = self.cycle.lock().await;

        let targets: Vec<Arc<PluginEntry>> = registry
            .entries()
            .into_iter()
            .filter(|entry| entry.health() != PluginHealth::Offline)
            .collect();

        let results = join_all(targets.iter().map(|entry| async move {
            let outcome = fetch_plugin(registry, entry).await;
            (entry.id().to_string(), outcome)
        }))
        .await;

        let mut report = RefreshReport::default();
        let mut replaced: BTreeMap<String, Vec<Device>> = BTreeMap::new();
        for (plugin_id, outcome) in results {
            match outcome {
                Ok(devices) => {
                    replaced.insert(plugin_id.clone(), devices);
                    report.refreshed.push(plugin_id);
                }
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "Plugin refresh failed, keeping previous snapshot");
                    report.failed.push((plugin_id, e));
                }
            }
        }

        let offline: HashSet<String> = registry
            .entries()
            .iter()
            .filter(|entry| entry.health() == PluginHealth::Offline)
            .map(|entry| entry.id().to_string())
            .collect();

        let mut evicted = BTreeSet::new();
        let view = self.publish_with(|current| {
            // Ids held by a live plugin that still reports them stay with that plugin
            let held: HashMap<&str, &str> = current
                .devices
                .iter()
                .filter_map(|(id, cached)| {
                    let owner = cached.device.plugin.as_str();
                    let live = registry.contains(owner) && !offline.contains(owner);
                    let still_reported = replaced
                        .get(owner)
                        .map_or(true, |reported| reported.iter().any(|d| d.id() == id.as_str()));
                    (live && still_reported).then_some((id.as_str(), owner))
                })
                .collect();

            let mut devices = BTreeMap::new();
            for (id, cached) in current.devices.iter() {
                let owner = cached.device.plugin.as_str();
                if offline.contains(owner) {
                    evicted.insert(owner.to_string());
                } else if registry.contains(owner) && !replaced.contains_key(owner) {
                    devices.insert(id.clone(), cached.clone());
                }
            }

            for (plugin_id, plugin_devices) in &replaced {
                if !registry.contains(plugin_id) || offline.contains(plugin_id) {
                    continue;
                }
                for device in plugin_devices {
                    if let Some(owner) = held.get(device.id()).filter(|o| **o != plugin_id.as_str()) {
                        warn!(
                            device_id = %device.id(),
                            plugin_id = %plugin_id,
                            owner = %owner,
                            "Duplicate device id reported by another plugin, ignoring"
                        );
                        continue;
                    }
                    if let Some(existing) = devices.get(device.id()) {
                        warn!(
                            device_id = %device.id(),
                            plugin_id = %plugin_id,
                            owner = %existing.device.plugin,
                            "Duplicate device id reported by another plugin, ignoring"
                        );
                        continue;
                    }
                    devices.insert(device.id().to_string(), CachedDevice::new(device.clone()));
                }
            }
            devices
        });

        if !evicted.is_empty() {
            info!(plugins = ?evicted, "Evicted offline plugins from cache");
        }
        report.evicted = evicted.into_iter().collect();
        report.devices = view.len();
        debug!(
            generation = view.generation(),
            devices = view.len(),
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "Device cache refreshed"
        );
        report
    }

    /// Drop every device owned by a plugin; returns how many were removed
    pub fn evict_plugin(&self, plugin_id: &str) -> usize {
        let mut removed = 0;
        self.publish_with(|current| {
            let devices: BTreeMap<_, _> = current
                .devices
                .iter()
                .filter(|(_, cached)| cached.device.plugin != plugin_id)
                .map(|(id, cached)| (id.clone(), cached.clone()))
                .collect();
            removed = current.devices.len() - devices.len();
            devices
        });
        if removed > 0 {
            info!(plugin_id = %plugin_id, removed, "Evicted plugin devices from cache");
        }
        removed
    }

    /// Build the next device map from the current view and publish it
    fn publish_with<F>(&self, build: F) -> Arc<CacheView>
    where
        F: FnOnce(&CacheView) -> BTreeMap<String, CachedDevice>,
    {
        let _guard = self.publish.lock();
        let current = self.view();
        let next = Arc::new(CacheView::new(build(&current), current.generation + 1));
        *self.view.write() = next.clone();
        next
    }
}

/// Enumerate one plugin's devices and read each of them
async fn fetch_plugin(registry: &PluginRegistry, entry: &PluginEntry) -> GatewayResult<Vec<Device>> {
    let plugin_id = entry.id();
    if !entry.descriptor().capabilities.supports(Capability::Read) {
        debug!(plugin_id = %plugin_id, "Plugin does not declare read capability, skipping");
        return Ok(Vec::new());
    }

    let infos = registry
        .forward(plugin_id, |link| async move { link.devices().await })
        .await?;

    let mut devices = Vec::with_capacity(infos.len());
    for info in infos {
        let readings = match registry
            .forward(plugin_id, |link| {
                let device_id = info.id.clone();
                async move { link.read(&device_id).await }
            })
            .await
        {
            Ok(readings) => readings,
            Err(e) if e.is_upstream_failure() => return Err(e),
            Err(e) => {
                debug!(plugin_id = %plugin_id, device_id = %info.id, error = %e, "No reading for device");
                Vec::new()
            }
        };
        devices.push(Device {
            info,
            plugin: plugin_id.to_string(),
            readings,
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::link::MemoryConnector;
    use crate::metrics::{InMemoryMetrics, Instrumentation};
    use crate::testing::MockPlugin;
    use pretty_assertions::assert_eq;
    use synse_core::{DeviceInfo, PluginDescriptor, Reading, TransportKind};

    struct Fixture {
        registry: PluginRegistry,
        cache: DeviceCache,
        connector: Arc<MemoryConnector>,
    }

    impl Fixture {
        fn new() -> Self {
            let connector = Arc::new(MemoryConnector::new());
            let registry = PluginRegistry::new(
                connector.clone(),
                Instrumentation::new(Arc::new(InMemoryMetrics::new())),
                HealthConfig {
                    degraded_after: 1,
                    offline_after: 2,
                    remove_after: None,
                },
                Duration::from_secs(5),
            );
            Self {
                registry,
                cache: DeviceCache::new(Duration::from_secs(20)),
                connector,
            }
        }

        fn add(&self, mock: Arc<MockPlugin>) {
            self.connector.insert(mock.id(), mock.clone());
            self.registry.register(PluginDescriptor::new(
                mock.id(),
                format!("memory://{}", mock.id()),
                TransportKind::Memory,
            ));
        }
    }

    fn snapshot(cache: &DeviceCache) -> (Vec<Device>, TagIndex) {
        let view = cache.view();
        (
            view.devices().map(|c| c.device.clone()).collect(),
            view.tags().clone(),
        )
    }

    #[tokio::test]
    async fn refresh_populates_devices_and_tags() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "temperature").with_tag("default/rack-1"));
        mock.set_reading("d1", vec![Reading::new("temperature", serde_json::json!(21.5))]);
        fx.add(mock);

        let report = fx.cache.refresh(&fx.registry).await;
        assert_eq!(report.refreshed, vec!["emulator"]);
        assert_eq!(report.devices, 1);

        let record = fx.cache.get("d1").unwrap();
        assert!(!record.stale);
        assert_eq!(record.device.plugin, "emulator");
        assert_eq!(record.device.readings.len(), 1);
        assert_eq!(
            fx.cache.view().tags().query(&[], true),
            vec!["default/rack-1", "system/id:d1"]
        );
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led").with_tag("vapor/rack"));
        mock.add_device(DeviceInfo::new("d2", "fan"));
        fx.add(mock);

        fx.cache.refresh(&fx.registry).await;
        let first = snapshot(&fx.cache);
        fx.cache.refresh(&fx.registry).await;
        let second = snapshot(&fx.cache);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_plugin_keeps_snapshot_until_offline() {
        let fx = Fixture::new();
        let flaky = Arc::new(MockPlugin::new("flaky"));
        flaky.add_device(DeviceInfo::new("f1", "led"));
        let steady = Arc::new(MockPlugin::new("steady"));
        steady.add_device(DeviceInfo::new("s1", "led"));
        fx.add(flaky.clone());
        fx.add(steady);

        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.view().len(), 2);

        // First failure: degraded, previous entries retained
        flaky.set_failing(true);
        let report = fx.cache.refresh(&fx.registry).await;
        assert_eq!(report.failed.len(), 1);
        assert!(fx.cache.get("f1").is_ok());
        assert!(fx.cache.get("s1").is_ok());

        // Second failure: offline, entries evicted along with their tags
        let report = fx.cache.refresh(&fx.registry).await;
        assert_eq!(report.evicted, vec!["flaky"]);
        assert!(matches!(fx.cache.get("f1"), Err(GatewayError::NotFound(_))));
        assert!(fx.cache.get("s1").is_ok());
        assert!(fx.cache.view().tags().devices("system/id:f1").is_empty());
    }

    #[tokio::test]
    async fn device_dropped_when_plugin_stops_reporting_it() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led"));
        mock.add_device(DeviceInfo::new("d2", "led"));
        fx.add(mock.clone());

        fx.cache.refresh(&fx.registry).await;
        mock.remove_device("d2");
        fx.cache.refresh(&fx.registry).await;

        assert!(fx.cache.get("d1").is_ok());
        assert!(fx.cache.get("d2").is_err());
    }

    #[tokio::test]
    async fn duplicate_device_ids_keep_first_owner() {
        let fx = Fixture::new();
        let a = Arc::new(MockPlugin::new("a"));
        a.add_device(DeviceInfo::new("shared", "led"));
        let b = Arc::new(MockPlugin::new("b"));
        b.add_device(DeviceInfo::new("shared", "fan"));
        fx.add(a);
        fx.add(b);

        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.get("shared").unwrap().device.plugin, "a");
        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.get("shared").unwrap().device.plugin, "a");
    }

    #[tokio::test]
    async fn duplicate_device_id_stays_with_earlier_plugin() {
        let fx = Fixture::new();
        let b = Arc::new(MockPlugin::new("b"));
        b.add_device(DeviceInfo::new("shared", "fan"));
        fx.add(b.clone());
        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.get("shared").unwrap().device.plugin, "b");

        let a = Arc::new(MockPlugin::new("a"));
        a.add_device(DeviceInfo::new("shared", "led"));
        a.add_device(DeviceInfo::new("a1", "led"));
        fx.add(a);
        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.get("shared").unwrap().device.plugin, "b");
        assert_eq!(fx.cache.get("a1").unwrap().device.plugin, "a");

        // Once the owner stops reporting it, the id moves on
        b.remove_device("shared");
        fx.cache.refresh(&fx.registry).await;
        assert_eq!(fx.cache.get("shared").unwrap().device.plugin, "a");
    }

    #[tokio::test]
    async fn held_view_is_unaffected_by_later_publishes() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led").with_tag("default/rack-1"));
        fx.add(mock.clone());
        fx.cache.refresh(&fx.registry).await;

        let held = fx.cache.view();
        mock.remove_device("d1");
        mock.add_device(DeviceInfo::new("d2", "led").with_tag("default/rack-1"));
        fx.cache.refresh(&fx.registry).await;

        let current = fx.cache.view();
        assert!(current.generation() > held.generation());
        assert_eq!(
            current.tags().devices("default/rack-1").into_iter().collect::<Vec<_>>(),
            vec!["d2"]
        );

        fx.cache.evict_plugin("emulator");
        assert!(fx.cache.view().is_empty());

        // The earlier snapshot still agrees with itself
        assert_eq!(held.len(), 1);
        assert!(held.get("d1").is_some());
        for tag in held.tags().query(&[], true) {
            for id in held.tags().devices(&tag) {
                assert!(held.get(&id).is_some(), "{} tagged {} but not in view", id, tag);
            }
        }
        assert_eq!(
            held.tags().devices("default/rack-1").into_iter().collect::<Vec<_>>(),
            vec!["d1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_flagged_not_dropped() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led"));
        fx.add(mock);

        fx.cache.refresh(&fx.registry).await;
        tokio::time::advance(Duration::from_secs(21)).await;

        let record = fx.cache.get("d1").unwrap();
        assert!(record.stale);
    }

    #[tokio::test]
    async fn list_filters_by_tag_plugin_and_kind() {
        let fx = Fixture::new();
        let a = Arc::new(MockPlugin::new("a"));
        a.add_device(DeviceInfo::new("a1", "led").with_tag("rack-1"));
        a.add_device(DeviceInfo::new("a2", "fan").with_tag("default/rack-1").with_tag("vapor/x"));
        let b = Arc::new(MockPlugin::new("b"));
        b.add_device(DeviceInfo::new("b1", "led").with_tag("vapor/x"));
        fx.add(a);
        fx.add(b);
        fx.cache.refresh(&fx.registry).await;

        let ids = |filter: DeviceFilter| -> Vec<String> {
            fx.cache
                .list(&filter)
                .unwrap()
                .into_iter()
                .map(|r| r.device.info.id)
                .collect()
        };

        assert_eq!(ids(DeviceFilter::default()), vec!["a1", "a2", "b1"]);
        assert_eq!(ids(DeviceFilter::default().with_tag("rack-1")), vec!["a1", "a2"]);
        assert_eq!(
            ids(DeviceFilter::default().with_tag("rack-1").with_tag("vapor/x")),
            vec!["a2"]
        );
        assert_eq!(ids(DeviceFilter::default().with_plugin("b")), vec!["b1"]);
        assert_eq!(ids(DeviceFilter::default().with_kind("led")), vec!["a1", "b1"]);
        assert!(matches!(
            fx.cache.list(&DeviceFilter::default().with_tag("vapor/")),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn evict_plugin_removes_devices_and_tags() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led").with_tag("default/rack-1"));
        fx.add(mock);
        fx.cache.refresh(&fx.registry).await;

        assert_eq!(fx.cache.evict_plugin("emulator"), 1);
        assert!(fx.cache.view().is_empty());
        assert!(fx.cache.view().tags().is_empty());
    }

    #[tokio::test]
    async fn deregistered_plugin_is_not_reinserted() {
        let fx = Fixture::new();
        let mock = Arc::new(MockPlugin::new("emulator"));
        mock.add_device(DeviceInfo::new("d1", "led"));
        fx.add(mock);
        fx.cache.refresh(&fx.registry).await;

        fx.registry.deregister("emulator");
        fx.cache.refresh(&fx.registry).await;
        assert!(fx.cache.view().is_empty());
    }
}
