#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use subdispatch::config::Config;
use subdispatch::device::{DeviceId, DeviceMemory, DeviceMonitor, DeviceSnapshot};
use subdispatch::error::{DispatchError, Result};
use subdispatch::transcribe::TranscriptionWorker;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Monitor reporting the same free memory for every device on every call
pub struct FixedMonitor {
    pub devices: Vec<(DeviceId, u64)>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FixedMonitor {
    pub fn new(devices: Vec<(DeviceId, u64)>) -> Self {
        Self {
            devices,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(devices: Vec<(DeviceId, u64)>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(devices)
        }
    }
}

#[async_trait]
impl DeviceMonitor for FixedMonitor {
    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .devices
            .iter()
            .map(|&(id, free)| {
                (
                    id,
                    DeviceMemory {
                        total_bytes: 24 * GIB,
                        free_bytes: free,
                    },
                )
            })
            .collect())
    }
}

/// Monitor whose driver is never reachable
pub struct UnreachableMonitor;

#[async_trait]
impl DeviceMonitor for UnreachableMonitor {
    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        Err(DispatchError::DeviceQuery("NVML Shared Library Not Found".to_string()))
    }
}

/// Monitor that answers the first `healthy_calls` queries, then loses the driver
pub struct FailingAfterMonitor {
    inner: FixedMonitor,
    healthy_calls: usize,
}

impl FailingAfterMonitor {
    pub fn new(devices: Vec<(DeviceId, u64)>, healthy_calls: usize) -> Self {
        Self {
            inner: FixedMonitor::new(devices),
            healthy_calls,
        }
    }
}

#[async_trait]
impl DeviceMonitor for FailingAfterMonitor {
    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        if self.inner.calls.load(Ordering::SeqCst) >= self.healthy_calls {
            return Err(DispatchError::DeviceQuery("GPU is lost".to_string()));
        }
        self.inner.snapshot().await
    }
}

/// In-process stand-in for the transcriber that writes a small transcript,
/// failing for inputs whose name starts with `fail_prefix`
pub struct FakeTranscriber {
    pub fail_prefix: Option<String>,
    pub duration: Duration,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub runs: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new() -> Self {
        Self {
            fail_prefix: None,
            duration: Duration::from_millis(20),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(prefix: &str) -> Self {
        Self {
            fail_prefix: Some(prefix.to_string()),
            ..Self::new()
        }
    }
}

#[async_trait]
impl TranscriptionWorker for FakeTranscriber {
    async fn run(&self, staged_input: &Path, _device: DeviceId, transcript_path: &Path) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.duration).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let name = staged_input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_prefix.as_ref().is_some_and(|p| name.starts_with(p.as_str())) {
            return Err(DispatchError::Transcription("exit status: 1".to_string()));
        }

        tokio::fs::write(
            transcript_path,
            r#"{"chunks":[{"timestamp":[0.0,1.5],"text":" Hello."}],"text":"Hello."}"#,
        )
        .await?;
        Ok(())
    }
}

/// Default config tuned for fast tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.dispatch.required_memory_bytes = 4 * GIB;
    config.dispatch.admission_retry_ms = 5;
    config.dispatch.max_admission_attempts = 0;
    config
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
