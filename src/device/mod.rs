// Device memory monitoring
//
// Each snapshot is a fresh query: free memory moves underneath us as
// transcriber processes (ours and third-party ones) allocate and release.
// - Nvml: queries the NVIDIA driver through NVML (default)
// - NvidiaSmi: parses the CSV output of nvidia-smi

pub mod nvidia_smi;
pub mod nvml;

use async_trait::async_trait;
use std::collections::BTreeMap;

pub use nvidia_smi::NvidiaSmiMonitor;
pub use nvml::NvmlMonitor;

use crate::config::{DeviceConfig, MonitorBackend};
use crate::error::Result;

/// Stable index of a compute device
pub type DeviceId = u32;

/// Memory figures for one device at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Memory of every visible device, ordered by device id
pub type DeviceSnapshot = BTreeMap<DeviceId, DeviceMemory>;

/// Source of live device memory information
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceMonitor: Send + Sync {
    /// Query total and free memory of every device.
    ///
    /// Fails with `DispatchError::DeviceQuery` when the driver cannot be reached.
    async fn snapshot(&self) -> Result<DeviceSnapshot>;
}

/// Factory for creating device monitor instances
pub struct DeviceMonitorFactory;

impl DeviceMonitorFactory {
    /// Create the monitor selected by `config.backend`
    pub fn create_monitor(config: DeviceConfig) -> Box<dyn DeviceMonitor> {
        match config.backend {
            MonitorBackend::Nvml => Box::new(NvmlMonitor::new()),
            MonitorBackend::NvidiaSmi => Box::new(NvidiaSmiMonitor::new(config)),
        }
    }
}
