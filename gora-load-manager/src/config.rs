use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{LoadManagerError, Result};

/// How the allocator picks a worker among those of the requested kind
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// First worker of the first group, in table order, serving the kind
    #[default]
    FirstMatch,
    /// Lowest composite score of group cpu/mem and worker connections/items
    LeastLoaded,
}

/// Weights of the composite score used by `AllocationStrategy::LeastLoaded`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadWeights {
    pub items: f64,
    pub connections: f64,
    /// Applied to cpu usage expressed in percent
    pub cpu: f64,
    /// Applied to memory usage expressed in percent
    pub mem: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        LoadWeights {
            items: 1.0,
            connections: 0.5,
            cpu: 0.5,
            mem: 0.5,
        }
    }
}

/// Load manager configuration, shared by the cluster manager and the agents
/// reporting to it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadManagerConfig {
    /// Load reports are published on `<prefix>.<group>`
    pub load_topic_prefix: String,
    /// Name of the cluster manager RPC queue
    pub rpc_server_name: String,
    /// Interval between two load reports of an agent
    pub report_interval_ms: u64,
    /// Decimal places kept for cpu and memory usage
    pub report_decimals: u32,
    pub allocation_strategy: AllocationStrategy,
    pub weights: LoadWeights,
    /// Records older than this are ignored by allocation and evicted by
    /// `prune_stale`. Disabled when absent.
    pub stale_after_ms: Option<u64>,
    /// Realtime gateway endpoints handed out by `allocPortal`
    pub portals: Vec<String>,
}

impl Default for LoadManagerConfig {
    fn default() -> Self {
        LoadManagerConfig {
            load_topic_prefix: "cluster.load".to_string(),
            rpc_server_name: crate::rpc::CLUSTER_MANAGER_RPC_SERVER_NAME.to_string(),
            report_interval_ms: 3000,
            report_decimals: 2,
            allocation_strategy: AllocationStrategy::default(),
            weights: LoadWeights::default(),
            stale_after_ms: None,
            portals: Vec::new(),
        }
    }
}

impl LoadManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.report_interval_ms == 0 {
            return Err(LoadManagerError::InvalidConfig(
                "report_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.load_topic_prefix.is_empty()
            || self.load_topic_prefix.contains('*')
            || self.load_topic_prefix.contains('#')
        {
            return Err(LoadManagerError::InvalidConfig(format!(
                "invalid load topic prefix: {:?}",
                self.load_topic_prefix
            )));
        }
        if self.stale_after_ms == Some(0) {
            return Err(LoadManagerError::InvalidConfig(
                "stale_after_ms must be greater than zero when set".to_string(),
            ));
        }
        if self.rpc_server_name.is_empty() {
            return Err(LoadManagerError::InvalidConfig(
                "rpc_server_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }

    /// Routing key an agent of `group` publishes its reports on.
    pub fn load_topic(&self, group: &str) -> String {
        format!("{}.{}", self.load_topic_prefix, group)
    }

    /// Binding pattern matching the reports of every group.
    pub fn load_topic_pattern(&self) -> String {
        format!("{}.#", self.load_topic_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoadManagerConfig::default();
        assert_eq!(config.report_interval(), Duration::from_millis(3000));
        assert_eq!(config.rpc_server_name, "rpc.cm");
        assert_eq!(config.allocation_strategy, AllocationStrategy::FirstMatch);
        assert_eq!(config.stale_after(), None);
        assert_eq!(config.load_topic("agentA"), "cluster.load.agentA");
        assert_eq!(config.load_topic_pattern(), "cluster.load.#");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: LoadManagerConfig = serde_json::from_str(
            r#"{"allocation_strategy": "least_loaded", "stale_after_ms": 9000}"#,
        )
        .unwrap();
        assert_eq!(config.allocation_strategy, AllocationStrategy::LeastLoaded);
        assert_eq!(config.stale_after(), Some(Duration::from_secs(9)));
        assert_eq!(config.report_interval_ms, 3000);
        assert_eq!(config.weights, LoadWeights::default());
    }

    #[test]
    fn test_validation() {
        let config = LoadManagerConfig {
            report_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LoadManagerError::InvalidConfig(_))
        ));

        let config = LoadManagerConfig {
            load_topic_prefix: "cluster.#".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
