//! Gateway configuration
//!
//! Deserialized from the `[cache]`, `[transaction]`, `[rpc]`, `[health]` and
//! `[[plugin]]` sections of the daemon config file. Health thresholds and the
//! transaction timeout have no defaults and must be configured explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use synse_core::{GatewayError, GatewayResult, PluginDescriptor};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Transaction tracking settings
    pub transaction: TransactionConfig,
    /// Remote call settings
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Plugin health thresholds
    pub health: HealthConfig,
    /// Statically configured plugins
    #[serde(default, rename = "plugin", skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginDescriptor>,
}

impl GatewayConfig {
    /// Build a config with default cache/rpc settings
    pub fn new(health: HealthConfig, transaction: TransactionConfig) -> Self {
        Self {
            cache: CacheConfig::default(),
            transaction,
            rpc: RpcConfig::default(),
            health,
            plugins: Vec::new(),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> GatewayResult<()> {
        self.health.validate()?;
        if self.transaction.timeout_secs == 0 {
            return Err(GatewayError::InvalidRequest(
                "transaction.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache.refresh_interval_secs == 0 {
            return Err(GatewayError::InvalidRequest(
                "cache.refresh_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.transaction.sweep_interval_secs == 0 {
            return Err(GatewayError::InvalidRequest(
                "transaction.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.id.as_str()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "Duplicate plugin id in config: {}",
                    plugin.id
                )));
            }
        }
        Ok(())
    }
}

/// Device cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age after which a cached entry is flagged stale
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Period of the background refresh loop
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_cache_ttl() -> u64 {
    20
}

fn default_refresh_interval() -> u64 {
    20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Transaction tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// How long terminal transactions stay queryable
    #[serde(default = "default_transaction_ttl")]
    pub ttl_secs: u64,
    /// Deadline after creation before an unfinished transaction is failed
    pub timeout_secs: u64,
    /// Period of the background sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_transaction_ttl() -> u64 {
    20
}

fn default_sweep_interval() -> u64 {
    5
}

impl TransactionConfig {
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            ttl_secs: default_transaction_ttl(),
            timeout_secs,
            sweep_interval_secs: default_sweep_interval(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Remote call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-call deadline for unary calls
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

fn default_rpc_timeout() -> u64 {
    20
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_rpc_timeout(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Consecutive-failure thresholds driving plugin health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Failures before a plugin is marked degraded
    pub degraded_after: u32,
    /// Failures before a plugin is marked offline and its devices are evicted
    pub offline_after: u32,
    /// Failures before a plugin is removed from the registry; `None` keeps it forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_after: Option<u32>,
}

impl HealthConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.degraded_after == 0 {
            return Err(GatewayError::InvalidRequest(
                "health.degraded_after must be greater than zero".to_string(),
            ));
        }
        if self.offline_after < self.degraded_after {
            return Err(GatewayError::InvalidRequest(format!(
                "health.offline_after ({}) must not be below health.degraded_after ({})",
                self.offline_after, self.degraded_after
            )));
        }
        if let Some(remove_after) = self.remove_after {
            if remove_after < self.offline_after {
                return Err(GatewayError::InvalidRequest(format!(
                    "health.remove_after ({}) must not be below health.offline_after ({})",
                    remove_after, self.offline_after
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synse_core::TransportKind;

    #[test]
    fn parse_full_config() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [cache]
            ttl_secs = 30

            [transaction]
            timeout_secs = 60

            [health]
            degraded_after = 2
            offline_after = 5
            remove_after = 20

            [[plugin]]
            id = "emulator"
            address = "http://127.0.0.1:5001"
            transport = "http"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.cache.refresh_interval(), Duration::from_secs(20));
        assert_eq!(config.transaction.ttl(), Duration::from_secs(20));
        assert_eq!(config.transaction.timeout(), Duration::from_secs(60));
        assert_eq!(config.rpc.timeout(), Duration::from_secs(20));
        assert_eq!(config.health.remove_after, Some(20));
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].transport, TransportKind::Http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn thresholds_are_required() {
        let result: Result<GatewayConfig, _> = toml::from_str(
            r#"
            [transaction]
            timeout_secs = 60
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let health = HealthConfig {
            degraded_after: 5,
            offline_after: 2,
            remove_after: None,
        };
        assert!(health.validate().is_err());

        let health = HealthConfig {
            degraded_after: 1,
            offline_after: 3,
            remove_after: Some(2),
        };
        assert!(health.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_plugins() {
        let mut config = GatewayConfig::new(
            HealthConfig {
                degraded_after: 1,
                offline_after: 3,
                remove_after: None,
            },
            TransactionConfig::with_timeout(30),
        );
        let desc = PluginDescriptor::new("a", "http://127.0.0.1:5001", TransportKind::Http);
        config.plugins = vec![desc.clone(), desc];
        assert!(config.validate().is_err());
    }
}
