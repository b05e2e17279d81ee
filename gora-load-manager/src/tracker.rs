use crate::load_report::LoadReport;
use crate::lm_metrics::{LOAD_REPORTS_RECEIVED_TOTAL, TRACKED_GROUPS};

use gora_mq::TopicClient;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Message type of load reports on the topic exchange.
pub const LOAD_MESSAGE_TYPE: &str = "load";

#[derive(Debug, Clone)]
struct TrackedReport {
    report: LoadReport,
    updated_at: Instant,
}

// group names in first-insertion order, so scans are deterministic
#[derive(Debug, Default)]
struct LoadTable {
    order: Vec<String>,
    records: HashMap<String, TrackedReport>,
}

/// In-memory table of the latest load report of every worker group.
///
/// The table is written only by the load subscription and read by the
/// allocator. The latest report of a group always replaces the previous one.
#[derive(Debug, Clone)]
pub struct ClusterLoadTracker {
    table: Arc<Mutex<LoadTable>>,
    stale_after: Option<Duration>,
}

impl ClusterLoadTracker {
    /// `stale_after` bounds the age of reports considered live. `None` keeps
    /// every report forever.
    pub fn new(stale_after: Option<Duration>) -> Self {
        ClusterLoadTracker {
            table: Arc::new(Mutex::new(LoadTable::default())),
            stale_after,
        }
    }

    pub async fn update(&self, report: LoadReport) {
        let mut table = self.table.lock().await;
        let name = report.name.clone();
        let tracked = TrackedReport {
            report,
            updated_at: Instant::now(),
        };

        if table.records.insert(name.clone(), tracked).is_none() {
            info!(group = %name, "worker group joined the cluster");
            table.order.push(name);
        } else {
            debug!(group = %name, "load report updated");
        }
        gauge!(TRACKED_GROUPS.name).set(table.order.len() as f64);
    }

    pub async fn get(&self, name: &str) -> Option<LoadReport> {
        let table = self.table.lock().await;
        table.records.get(name).map(|t| t.report.clone())
    }

    /// Every report, in table order.
    pub async fn reports(&self) -> Vec<LoadReport> {
        let table = self.table.lock().await;
        table
            .order
            .iter()
            .filter_map(|name| table.records.get(name))
            .map(|t| t.report.clone())
            .collect()
    }

    /// Reports younger than the staleness window, in table order.
    pub async fn live_reports(&self) -> Vec<LoadReport> {
        let now = Instant::now();
        let table = self.table.lock().await;
        table
            .order
            .iter()
            .filter_map(|name| table.records.get(name))
            .filter(|t| !self.is_stale(t, now))
            .map(|t| t.report.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.order.is_empty()
    }

    /// Evicts stale groups and returns their names. No-op when staleness is
    /// disabled.
    pub async fn prune_stale(&self) -> Vec<String> {
        if self.stale_after.is_none() {
            return Vec::new();
        }

        let now = Instant::now();
        let mut table = self.table.lock().await;
        let stale: Vec<String> = table
            .order
            .iter()
            .filter(|name| {
                table
                    .records
                    .get(name.as_str())
                    .is_some_and(|t| self.is_stale(t, now))
            })
            .cloned()
            .collect();

        for name in &stale {
            table.records.remove(name);
            info!(group = %name, "stale worker group evicted");
        }
        table.order.retain(|name| !stale.contains(name));
        gauge!(TRACKED_GROUPS.name).set(table.order.len() as f64);

        stale
    }

    fn is_stale(&self, tracked: &TrackedReport, now: Instant) -> bool {
        match self.stale_after {
            Some(window) => now.saturating_duration_since(tracked.updated_at) > window,
            None => false,
        }
    }

    /// Binds `pattern` on `topic` and feeds every `load` message into the
    /// table. The returned task ends when the subscription callback is dropped.
    pub async fn subscribe(&self, topic: &TopicClient, pattern: &str) -> gora_mq::Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LoadReport>();

        topic
            .subscribe_typed(pattern, LOAD_MESSAGE_TYPE, move |report: LoadReport| {
                counter!(LOAD_REPORTS_RECEIVED_TOTAL.name).increment(1);
                let _ = tx.send(report);
            })
            .await?;

        let tracker = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                tracker.update(report).await;
            }
            debug!("load subscription closed");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::{SystemLoad, WorkerKind, WorkerLoad};

    fn report(name: &str, worker: &str) -> LoadReport {
        LoadReport::new(
            name,
            SystemLoad::default(),
            vec![WorkerLoad::new(worker, WorkerKind::Consumer)],
        )
    }

    #[tokio::test]
    async fn test_update_replaces_and_keeps_position() {
        let tracker = ClusterLoadTracker::new(None);
        tracker.update(report("a", "w1")).await;
        tracker.update(report("b", "w2")).await;
        tracker.update(report("a", "w3")).await;

        let names: Vec<String> = tracker.reports().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(tracker.get("a").await.unwrap().workers[0].worker_id, "w3");
        assert_eq!(tracker.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_disabled_keeps_everything() {
        let tracker = ClusterLoadTracker::new(None);
        tracker.update(report("a", "w1")).await;
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(tracker.live_reports().await.len(), 1);
        assert!(tracker.prune_stale().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reports_are_skipped_and_pruned() {
        let tracker = ClusterLoadTracker::new(Some(Duration::from_secs(10)));
        tracker.update(report("old", "w1")).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        tracker.update(report("fresh", "w2")).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let live: Vec<String> = tracker.live_reports().await.into_iter().map(|r| r.name).collect();
        assert_eq!(live, vec!["fresh"]);
        assert_eq!(tracker.reports().await.len(), 2);

        assert_eq!(tracker.prune_stale().await, vec!["old"]);
        assert_eq!(tracker.len().await, 1);

        // a new report revives the group at the end of the table
        tracker.update(report("old", "w1")).await;
        let names: Vec<String> = tracker.reports().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["fresh", "old"]);
    }
}
