//! # gora load manager
//!
//! Cluster-wide view of the media agents' load and the allocation of their
//! workers to callers.
//!
//! - **Load reporting**: every agent runs a [`LoadReporter`] that publishes a
//!   [`LoadReport`] of its group on the load topic at a fixed interval
//! - **Load tracking**: the [`ClusterLoadTracker`] keeps the latest report of
//!   every group, in arrival order
//! - **Allocation**: the [`Allocator`] answers `allocMedia` / `allocPortal`
//!   requests served by the [`ClusterManager`] on its RPC queue

mod allocator;
mod cluster_manager;
mod config;
mod errors;
pub mod lm_metrics;
pub mod load_report;
pub mod rankings;
mod reporter;
pub mod resource_monitor;
pub mod rpc;
mod tracker;

pub use allocator::{AllocatedWorker, Allocator};
pub use cluster_manager::ClusterManager;
pub use config::{AllocationStrategy, LoadManagerConfig, LoadWeights};
pub use errors::{AllocationError, LoadManagerError, Result};
pub use load_report::{LoadReport, SystemLoad, WorkerKind, WorkerLoad};
pub use rankings::{rankings_composite, RankedWorker};
pub use reporter::{generate_load_report, LoadReporter, LoadSource};
pub use resource_monitor::{NativeResourceMonitor, ResourceMonitor, StaticResourceMonitor};
pub use rpc::ClusterManagerClient;
pub use tracker::{ClusterLoadTracker, LOAD_MESSAGE_TYPE};
