mod args_parse;
mod cluster_metrics;
mod media_agent;
mod service_configuration;

use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use crate::{
    args_parse::Args,
    cluster_metrics::init_metrics,
    media_agent::MediaAgent,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
};

use anyhow::{Context, Result};
use clap::Parser;
use gora_core::broker::{AmqpBroker, Broker, BrokerConfig, BrokerKind, MemoryBroker};
use gora_load_manager::{
    ClusterManager, ClusterManagerClient, NativeResourceMonitor, ResourceMonitor, WorkerKind,
};
use gora_mq::{BrokerConnection, RpcClient, TopicClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .with_context(|| format!("Failed to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    if let Some(broker_url) = args.broker_url {
        service_config.mq.broker.url = broker_url;
    }

    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    init_metrics(service_config.prom_exporter, &service_config.cluster_name)?;

    let broker = new_broker(&service_config.mq.broker)?;
    info!(cluster = %service_config.cluster_name, url = %service_config.mq.broker.url, "broker selected");

    // cluster manager, absent in agent-only processes
    let manager = if service_config.cluster_manager {
        let conn = BrokerConnection::connect(service_config.mq.broker.clone(), broker.as_ref()).await?;
        let topic = Arc::new(
            TopicClient::builder(Arc::clone(&conn))
                .with_options(service_config.mq.topic.clone())
                .init()
                .await?,
        );
        let manager = ClusterManager::start(
            Arc::clone(&conn),
            topic,
            service_config.load_manager.clone(),
        )
        .await?;
        let rpc = Arc::new(
            RpcClient::builder(Arc::clone(&conn))
                .with_options(service_config.mq.rpc.clone())
                .init()
                .await?,
        );
        Some((conn, manager, rpc))
    } else {
        info!("cluster manager disabled, running media agents only");
        None
    };

    // media agents, one broker connection each
    let monitor: Arc<dyn ResourceMonitor> = Arc::new(NativeResourceMonitor::new());
    let mut agents = Vec::with_capacity(service_config.agents.len());
    for settings in &service_config.agents {
        let agent_conn = BrokerConnection::connect(service_config.mq.broker.clone(), broker.as_ref()).await?;
        let agent = MediaAgent::start(
            agent_conn,
            &service_config.mq,
            &service_config.load_manager,
            settings,
            Arc::clone(&monitor),
        )
        .await
        .with_context(|| format!("Failed to start media agent {}", settings.group))?;
        info!(group = %agent.group(), "media agent registered");
        agents.push(agent);
    }

    if let Some((_, manager, rpc)) = &manager {
        if args.smoke_test {
            smoke_test(manager, rpc, agents.len()).await;
        }
    } else if args.smoke_test {
        warn!("smoke test needs the cluster manager, skipped");
    }

    info!("gora cluster running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("shutting down");

    for agent in &agents {
        agent.close().await;
    }
    if let Some((conn, manager, rpc)) = manager {
        rpc.close().await;
        manager.close().await;
        conn.close().await;
    }

    Ok(())
}

/// Picks the broker from the url scheme. An in-process broker only
/// connects clients of this process, so a multi-process cluster needs AMQP.
fn new_broker(config: &BrokerConfig) -> Result<Box<dyn Broker>> {
    let broker: Box<dyn Broker> = match config.kind()? {
        BrokerKind::Memory => match (&config.username, &config.password) {
            (Some(username), Some(password)) => Box::new(MemoryBroker::with_credentials(
                config.url.clone(),
                username.clone(),
                password.clone(),
            )),
            _ => Box::new(MemoryBroker::new(config.url.clone())),
        },
        BrokerKind::Amqp => Box::new(AmqpBroker::new()),
    };
    Ok(broker)
}

/// Waits for the agents' first reports, then allocates one worker of each
/// kind and a portal, logging every outcome.
async fn smoke_test(manager: &ClusterManager, rpc: &Arc<RpcClient>, agents: usize) {
    let deadline = tokio::time::Instant::now() + manager.config().report_interval() * 2;
    while manager.tracker().len().await < agents && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let client = ClusterManagerClient::with_server(
        Arc::clone(rpc),
        manager.config().rpc_server_name.clone(),
    );
    for kind in [WorkerKind::Producer, WorkerKind::Consumer] {
        match client.alloc_media("smoke", kind).await {
            Ok(worker) => {
                info!(kind = %kind, group = %worker.group_name, worker = %worker.worker_id, "smoke test allocation");
                match client.router_capabilities(&worker, "smoke").await {
                    Ok(caps) => info!(worker = %worker.worker_id, capabilities = %caps, "smoke test capabilities"),
                    Err(e) => warn!(worker = %worker.worker_id, error = %e, "smoke test capabilities failed"),
                }
            }
            Err(e) => warn!(kind = %kind, error = %e, "smoke test allocation failed"),
        }
    }
    match client.alloc_portal().await {
        Ok(portal) => info!(portal = %portal, "smoke test portal"),
        Err(e) => warn!(error = %e, "smoke test portal failed"),
    }
}
