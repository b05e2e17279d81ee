use crate::config::{AllocationStrategy, LoadManagerConfig, LoadWeights};
use crate::errors::AllocationError;
use crate::lm_metrics::ALLOCATIONS_TOTAL;
use crate::load_report::WorkerKind;
use crate::rankings::rankings_composite;
use crate::tracker::ClusterLoadTracker;

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Worker chosen for a caller: `{groupName, workerId}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedWorker {
    pub group_name: String,
    pub worker_id: String,
}

/// Answers allocation requests from the load table.
#[derive(Debug)]
pub struct Allocator {
    tracker: ClusterLoadTracker,
    strategy: AllocationStrategy,
    weights: LoadWeights,
    portals: Vec<String>,
    next_portal: AtomicUsize,
}

impl Allocator {
    pub fn new(tracker: ClusterLoadTracker, config: &LoadManagerConfig) -> Self {
        Allocator {
            tracker,
            strategy: config.allocation_strategy,
            weights: config.weights,
            portals: config.portals.clone(),
            next_portal: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Picks a worker of `kind`.
    ///
    /// Fails with `NoAgentsRegistered` if no live group is known and with
    /// `NoAvailableWorker` if none of them runs a worker of `kind`.
    pub async fn allocate(&self, kind: WorkerKind) -> Result<AllocatedWorker, AllocationError> {
        let result = self.select(kind).await;

        match &result {
            Ok(worker) => {
                debug!(kind = %kind, group = %worker.group_name, worker_id = %worker.worker_id, "worker allocated");
                counter!(ALLOCATIONS_TOTAL.name, "kind" => kind.as_str(), "result" => "success")
                    .increment(1);
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "allocation failed");
                counter!(ALLOCATIONS_TOTAL.name, "kind" => kind.as_str(), "result" => "failure")
                    .increment(1);
            }
        }
        result
    }

    async fn select(&self, kind: WorkerKind) -> Result<AllocatedWorker, AllocationError> {
        let reports = self.tracker.live_reports().await;
        if reports.is_empty() {
            return Err(AllocationError::NoAgentsRegistered);
        }

        match self.strategy {
            AllocationStrategy::FirstMatch => reports
                .iter()
                .find_map(|report| {
                    report.workers_of(kind).next().map(|worker| AllocatedWorker {
                        group_name: report.name.clone(),
                        worker_id: worker.worker_id.clone(),
                    })
                })
                .ok_or(AllocationError::NoAvailableWorker),
            AllocationStrategy::LeastLoaded => rankings_composite(&reports, kind, &self.weights)
                .into_iter()
                .next()
                .map(|ranked| AllocatedWorker {
                    group_name: ranked.group_name,
                    worker_id: ranked.worker_id,
                })
                .ok_or(AllocationError::NoAvailableWorker),
        }
    }

    /// Hands out the configured portal endpoints in round-robin order.
    pub fn alloc_portal(&self) -> Result<String, AllocationError> {
        if self.portals.is_empty() {
            return Err(AllocationError::NoPortalAvailable);
        }
        let index = self.next_portal.fetch_add(1, Ordering::Relaxed) % self.portals.len();
        Ok(self.portals[index].clone())
    }
}

#[cfg(test)]
#[path = "allocator_test.rs"]
mod allocator_test;
