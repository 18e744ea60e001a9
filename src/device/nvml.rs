use async_trait::async_trait;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::{debug, warn};

use crate::error::{Result, DispatchError};
use super::{DeviceMemory, DeviceMonitor, DeviceSnapshot};

/// Device monitor backed by NVML.
///
/// Each snapshot initializes NVML, reads the device count and the memory of
/// every device, then shuts NVML down, so no driver handle outlives a call.
#[derive(Debug, Default)]
pub struct NvmlMonitor;

impl NvmlMonitor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceMonitor for NvmlMonitor {
    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        // NVML calls block on the driver
        let snapshot = tokio::task::spawn_blocking(query_devices)
            .await
            .map_err(|e| DispatchError::DeviceQuery(format!("NVML query task failed: {}", e)))??;

        debug!("Device snapshot: {:?}", snapshot);
        Ok(snapshot)
    }
}

fn query_devices() -> Result<DeviceSnapshot> {
    let nvml = Nvml::init().map_err(|e| nvml_error("initialize NVML", e))?;
    let count = nvml
        .device_count()
        .map_err(|e| nvml_error("count devices", e))?;

    let mut snapshot = DeviceSnapshot::new();
    for index in 0..count {
        let memory = nvml
            .device_by_index(index)
            .and_then(|device| device.memory_info())
            .map_err(|e| nvml_error(&format!("read memory of GPU {}", index), e))?;

        snapshot.insert(
            index,
            DeviceMemory {
                total_bytes: memory.total,
                free_bytes: memory.free,
            },
        );
    }

    if let Err(e) = nvml.shutdown() {
        warn!("NVML shutdown failed: {}", e);
    }
    Ok(snapshot)
}

fn nvml_error(action: &str, error: NvmlError) -> DispatchError {
    DispatchError::DeviceQuery(format!("Failed to {}: {}", action, error))
}
