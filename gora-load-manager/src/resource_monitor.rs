//! Host resource monitoring for load reports.

mod native;

pub use native::NativeResourceMonitor;

use anyhow::Result;
use async_trait::async_trait;

/// Source of the host usage figures put in a load report.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// CPU usage as a fraction of total capacity (0.0-1.0)
    async fn get_cpu_usage(&self) -> Result<f64>;

    /// Memory usage as a fraction of total memory (0.0-1.0)
    async fn get_memory_usage(&self) -> Result<f64>;
}

/// Monitor returning fixed figures.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticResourceMonitor {
    pub cpu: f64,
    pub mem: f64,
}

impl StaticResourceMonitor {
    pub fn new(cpu: f64, mem: f64) -> Self {
        StaticResourceMonitor { cpu, mem }
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn get_cpu_usage(&self) -> Result<f64> {
        Ok(self.cpu)
    }

    async fn get_memory_usage(&self) -> Result<f64> {
        Ok(self.mem)
    }
}
