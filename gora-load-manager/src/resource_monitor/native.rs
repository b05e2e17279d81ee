//! Host cpu and memory figures of an agent, read with sysinfo.

use super::ResourceMonitor;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::Mutex;

/// Reports the load of the host the agent runs on.
pub struct NativeResourceMonitor {
    system: Arc<Mutex<System>>,
}

impl NativeResourceMonitor {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for NativeResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceMonitor for NativeResourceMonitor {
    async fn get_cpu_usage(&self) -> Result<f64> {
        let mut system = self.system.lock().await;

        // usage is computed between two refreshes
        system.refresh_cpu_all();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_all();

        if system.cpus().is_empty() {
            return Ok(0.0);
        }
        Ok((system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0))
    }

    async fn get_memory_usage(&self) -> Result<f64> {
        let mut system = self.system.lock().await;
        system.refresh_memory();

        match system.total_memory() {
            0 => Ok(0.0),
            total => Ok(system.used_memory() as f64 / total as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_usage_is_a_fraction() {
        let monitor = NativeResourceMonitor::new();

        let cpu = monitor.get_cpu_usage().await.unwrap();
        let mem = monitor.get_memory_usage().await.unwrap();

        assert!((0.0..=1.0).contains(&cpu));
        assert!((0.0..=1.0).contains(&mem));
    }
}
