use crate::config::LoadManagerConfig;
use crate::lm_metrics::LOAD_REPORTS_PUBLISHED_TOTAL;
use crate::load_report::{LoadReport, SystemLoad, WorkerLoad};
use crate::resource_monitor::ResourceMonitor;
use crate::tracker::LOAD_MESSAGE_TYPE;

use async_trait::async_trait;
use gora_mq::TopicClient;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Per-worker counters of the process running a `LoadReporter`.
#[async_trait]
pub trait LoadSource: Send + Sync {
    async fn worker_loads(&self) -> Vec<WorkerLoad>;
}

/// Builds the load report of `group` from the host figures and the workers' counters.
/// Host figures that cannot be read are reported as zero.
pub async fn generate_load_report(
    group: &str,
    monitor: &dyn ResourceMonitor,
    source: &dyn LoadSource,
    decimals: u32,
) -> LoadReport {
    let cpu = monitor.get_cpu_usage().await.unwrap_or_else(|e| {
        warn!(error = %e, "unable to read cpu usage");
        0.0
    });
    let mem = monitor.get_memory_usage().await.unwrap_or_else(|e| {
        warn!(error = %e, "unable to read memory usage");
        0.0
    });

    LoadReport::new(
        group,
        SystemLoad::rounded(cpu, mem, decimals),
        source.worker_loads().await,
    )
}

/// Periodically publishes the load report of a worker group on the load topic.
pub struct LoadReporter {
    group: String,
    topic: Arc<TopicClient>,
    monitor: Arc<dyn ResourceMonitor>,
    source: Arc<dyn LoadSource>,
    config: LoadManagerConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadReporter {
    pub fn new(
        group: impl Into<String>,
        topic: Arc<TopicClient>,
        monitor: Arc<dyn ResourceMonitor>,
        source: Arc<dyn LoadSource>,
        config: LoadManagerConfig,
    ) -> Self {
        LoadReporter {
            group: group.into(),
            topic,
            monitor,
            source,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Publishes one report right away.
    pub async fn report_load(&self) {
        post_load_report(
            &self.group,
            &self.topic,
            self.monitor.as_ref(),
            self.source.as_ref(),
            &self.config,
        )
        .await;
    }

    /// Publishes a report now and then once per configured interval, until
    /// `stop`. Starting a running reporter is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!(group = %self.group, "load reporter already running");
            return;
        }

        let interval = self.config.report_interval();
        info!(group = %self.group, interval_ms = interval.as_millis() as u64, "load reporter started");

        let group = self.group.clone();
        let topic = Arc::clone(&self.topic);
        let monitor = Arc::clone(&self.monitor);
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        *task = Some(tokio::spawn(async move {
            report_periodically(group, topic, monitor, source, config, interval).await
        }));
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!(group = %self.group, "load reporter stopped");
        }
    }
}

async fn report_periodically(
    group: String,
    topic: Arc<TopicClient>,
    monitor: Arc<dyn ResourceMonitor>,
    source: Arc<dyn LoadSource>,
    config: LoadManagerConfig,
    period: Duration,
) {
    let mut interval = time::interval(period);
    loop {
        interval.tick().await;
        post_load_report(&group, &topic, monitor.as_ref(), source.as_ref(), &config).await;
    }
}

async fn post_load_report(
    group: &str,
    topic: &TopicClient,
    monitor: &dyn ResourceMonitor,
    source: &dyn LoadSource,
    config: &LoadManagerConfig,
) {
    let load_report = generate_load_report(group, monitor, source, config.report_decimals).await;
    topic
        .publish_data(&config.load_topic(group), LOAD_MESSAGE_TYPE, &load_report)
        .await;
    counter!(LOAD_REPORTS_PUBLISHED_TOTAL.name).increment(1);
    debug!(group = %group, "agent posted a new load report: {:?}", &load_report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::WorkerKind;
    use crate::resource_monitor::StaticResourceMonitor;

    struct Fixed(Vec<WorkerLoad>);

    #[async_trait]
    impl LoadSource for Fixed {
        async fn worker_loads(&self) -> Vec<WorkerLoad> {
            self.0.clone()
        }
    }

    struct Broken;

    #[async_trait]
    impl ResourceMonitor for Broken {
        async fn get_cpu_usage(&self) -> anyhow::Result<f64> {
            Err(anyhow::anyhow!("no /proc"))
        }

        async fn get_memory_usage(&self) -> anyhow::Result<f64> {
            Ok(0.5)
        }
    }

    #[tokio::test]
    async fn test_report_is_rounded() {
        let source = Fixed(vec![WorkerLoad::new("w1", WorkerKind::Producer).with_counts(1, 2)]);
        let report =
            generate_load_report("agentA", &StaticResourceMonitor::new(0.12345, 0.6789), &source, 2)
                .await;

        assert_eq!(report.name, "agentA");
        assert_eq!(report.sys, SystemLoad { cpu: 0.12, mem: 0.68 });
        assert_eq!(report.workers, source.0);
    }

    #[tokio::test]
    async fn test_unreadable_figures_are_zero() {
        let report = generate_load_report("agentA", &Broken, &Fixed(vec![]), 2).await;
        assert_eq!(report.sys, SystemLoad { cpu: 0.0, mem: 0.5 });
    }
}
