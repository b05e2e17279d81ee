use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Installs the Prometheus recorder when an exporter address is configured
/// and describes the metrics of the messaging and load manager layers.
pub(crate) fn init_metrics(prom_addr: Option<SocketAddr>, cluster_name: &str) -> Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("cluster", cluster_name.to_string())
            .install()
            .context("failed to install Prometheus recorder")?;
        info!(%addr, "prometheus exporter listening");
    }

    gora_mq::mq_metrics::describe_metrics();
    gora_load_manager::lm_metrics::describe_metrics();
    Ok(())
}
