use anyhow::{bail, Context, Result};
use gora_load_manager::LoadManagerConfig;
use gora_mq::MqConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Cluster name, added as a label to every exported metric
    pub(crate) cluster_name: String,
    /// Broker connection and messaging client settings
    pub(crate) mq: MqConfig,
    /// Load manager settings, defaults apply when absent
    #[serde(default)]
    pub(crate) load_manager: Option<LoadManagerConfig>,
    /// Prometheus exporter (optional)
    #[serde(default)]
    pub(crate) prometheus: Option<PrometheusConfig>,
    /// Runs the cluster manager in this process, off for agent-only nodes
    #[serde(default = "default_cluster_manager")]
    pub(crate) cluster_manager: bool,
    /// Media agents run alongside the cluster manager
    #[serde(default)]
    pub(crate) agents: Vec<AgentConfig>,
}

fn default_cluster_manager() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PrometheusConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// A media agent as written in the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AgentConfig {
    /// Worker group name, a `media@<uuid>` name is generated when absent
    #[serde(default)]
    pub(crate) group: Option<String>,
    #[serde(default = "default_workers")]
    pub(crate) producer_workers: usize,
    #[serde(default = "default_workers")]
    pub(crate) consumer_workers: usize,
}

fn default_workers() -> usize {
    1
}

/// validated settings the service runs with
#[derive(Debug)]
pub(crate) struct ServiceConfiguration {
    pub(crate) cluster_name: String,
    pub(crate) mq: MqConfig,
    pub(crate) load_manager: LoadManagerConfig,
    pub(crate) prom_exporter: Option<SocketAddr>,
    pub(crate) cluster_manager: bool,
    pub(crate) agents: Vec<AgentSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentSettings {
    pub(crate) group: String,
    pub(crate) producer_workers: usize,
    pub(crate) consumer_workers: usize,
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        if config.mq.broker.url.is_empty() {
            bail!("mq.broker.url must not be empty");
        }

        let load_manager = config.load_manager.unwrap_or_default();
        load_manager
            .validate()
            .context("invalid load_manager configuration")?;

        let prom_exporter = match config.prometheus {
            Some(prom) => Some(
                format!("{}:{}", prom.host, prom.port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            ),
            None => None,
        };

        let mut agents: Vec<AgentSettings> = Vec::with_capacity(config.agents.len());
        for agent in config.agents {
            let group = agent
                .group
                .unwrap_or_else(|| format!("media@{}", Uuid::new_v4()));
            if group == load_manager.rpc_server_name {
                bail!("agent group {} collides with the cluster manager queue", group);
            }
            if agents.iter().any(|a| a.group == group) {
                bail!("agent group {} is configured twice", group);
            }
            if agent.producer_workers + agent.consumer_workers == 0 {
                bail!("agent group {} has no workers", group);
            }
            agents.push(AgentSettings {
                group,
                producer_workers: agent.producer_workers,
                consumer_workers: agent.consumer_workers,
            });
        }

        if !config.cluster_manager && agents.is_empty() {
            bail!("cluster_manager is off and no agents are configured");
        }

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            mq: config.mq,
            load_manager,
            prom_exporter,
            cluster_manager: config.cluster_manager,
            agents,
        })
    }
}
