use async_trait::async_trait;
use tracing::debug;

use crate::command::ToolCommand;
use crate::config::DeviceConfig;
use crate::error::{Result, DispatchError};
use super::{DeviceMemory, DeviceMonitor, DeviceSnapshot};

const MIB: u64 = 1024 * 1024;

/// Device monitor backed by `nvidia-smi`.
///
/// Every call starts a new nvidia-smi process, which initializes NVML,
/// reads the device count and memory info, and shuts NVML down again, so
/// no driver handle outlives a single snapshot.
pub struct NvidiaSmiMonitor {
    config: DeviceConfig,
}

impl NvidiaSmiMonitor {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    fn query_command(&self) -> ToolCommand {
        ToolCommand::new(&self.config.monitor_binary, "GPU memory query")
            .arg("--query-gpu=index,memory.total,memory.free")
            .arg("--format=csv,noheader,nounits")
    }
}

#[async_trait]
impl DeviceMonitor for NvidiaSmiMonitor {
    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        let output = self
            .query_command()
            .execute_with(DispatchError::DeviceQuery)
            .await?;

        let snapshot = parse_memory_query(&output.stdout)?;
        debug!("Device snapshot: {:?}", snapshot);
        Ok(snapshot)
    }
}

/// Parse `index, total MiB, free MiB` lines into a snapshot
pub fn parse_memory_query(stdout: &str) -> Result<DeviceSnapshot> {
    let mut snapshot = DeviceSnapshot::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(DispatchError::DeviceQuery(format!(
                "Unexpected nvidia-smi line: '{}'",
                line
            )));
        }

        let parse = |field: &str| {
            field.parse::<u64>().map_err(|_| {
                DispatchError::DeviceQuery(format!("Invalid number '{}' in line '{}'", field, line))
            })
        };
        let parse_mib = |field: &str| {
            parse(field)?.checked_mul(MIB).ok_or_else(|| {
                DispatchError::DeviceQuery(format!("Memory size out of range in line '{}'", line))
            })
        };
        let index = parse(fields[0])?;
        let id = u32::try_from(index)
            .map_err(|_| DispatchError::DeviceQuery(format!("Device index out of range: {}", index)))?;

        snapshot.insert(
            id,
            DeviceMemory {
                total_bytes: parse_mib(fields[1])?,
                free_bytes: parse_mib(fields[2])?,
            },
        );
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_devices() {
        let stdout = "0, 24576, 20000\n1, 11264, 512\n";
        let snapshot = parse_memory_query(stdout).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&0].total_bytes, 24576 * MIB);
        assert_eq!(snapshot[&0].free_bytes, 20000 * MIB);
        assert_eq!(snapshot[&1].free_bytes, 512 * MIB);
    }

    #[test]
    fn test_parse_empty_output_means_no_devices() {
        assert!(parse_memory_query("\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_driver_error_text() {
        let stdout = "NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver.";
        assert!(matches!(
            parse_memory_query(stdout),
            Err(DispatchError::DeviceQuery(_))
        ));
    }

    #[test]
    fn test_parse_rejects_not_supported_fields() {
        assert!(parse_memory_query("0, [N/A], [N/A]").is_err());
    }

    #[test]
    fn test_parse_rejects_overflowing_sizes() {
        let stdout = format!("0, {}, 1", u64::MAX);
        assert!(matches!(
            parse_memory_query(&stdout),
            Err(DispatchError::DeviceQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_device_query_error() {
        let monitor = NvidiaSmiMonitor::new(DeviceConfig {
            monitor_binary: "nvidia-smi-does-not-exist-here".to_string(),
            ..DeviceConfig::default()
        });
        assert!(matches!(
            monitor.snapshot().await,
            Err(DispatchError::DeviceQuery(_))
        ));
    }
}
