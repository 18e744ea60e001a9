use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use crate::error::{Result, DispatchError};

const GIB: u64 = 1024 * 1024 * 1024;

// Default values for optional dispatch settings
fn default_admission_retry_ms() -> u64 {
    500
}

fn default_max_admission_attempts() -> u32 {
    7200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub devices: DeviceConfig,
    pub dispatch: DispatchConfig,
    pub layout: LayoutConfig,
    pub transcriber: TranscriberConfig,
    pub postprocess: PostprocessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// How device memory is queried
    pub backend: MonitorBackend,
    /// Path to the nvidia-smi binary, used by the `nvidia-smi` backend
    pub monitor_binary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorBackend {
    /// NVML, loaded from the driver's libnvidia-ml at runtime
    #[default]
    Nvml,
    /// Parse the CSV output of nvidia-smi
    NvidiaSmi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum concurrent jobs admitted on one device
    pub max_jobs_per_device: usize,
    /// Free device memory (bytes) a job needs before it may be admitted
    pub required_memory_bytes: u64,
    /// Optional cap on worker count; never exceeds the total admission slots
    pub workers: Option<usize>,
    /// Pause between admission retries when no device qualifies
    pub admission_retry_ms: u64,
    /// Admission attempts that find no device with enough free memory before
    /// a job is abandoned (0 = retry forever). Waiting for a device busy with
    /// our own jobs does not count.
    pub max_admission_attempts: u32,
    /// Kill the transcriber after this many seconds (None = no timeout)
    pub job_timeout_secs: Option<u64>,
    /// Device selection policy among admissible devices
    pub selection_policy: SelectionPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Fewest in-flight jobs first, ties broken by most free memory
    #[default]
    LeastLoaded,
    /// Most free memory first
    MostFreeMemory,
    /// Lowest device id that qualifies
    FirstFit,
    /// Rotate through qualifying devices
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Directory holding unclaimed input files
    pub pending_dir: String,
    /// Directory holding per-job staging directories
    pub staging_dir: String,
    /// Root directory for finished job directories
    pub finished_dir: String,
    /// Extensions (without dot) recognised as job inputs
    pub input_extensions: Vec<String>,
    /// Extensions (without dot) of derived artifacts removed by the recovery sweep
    pub artifact_extensions: Vec<String>,
    /// Prefix of finished job directory names, followed by the sequence number
    pub job_dir_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Path to transcriber binary (e.g., insanely-fast-whisper)
    pub binary_path: String,
    /// Model passed to the transcriber
    pub model: String,
    /// Transcriber task (transcribe or translate)
    pub task: String,
    /// Source language hint
    pub language: String,
    /// Additional arguments appended to every invocation
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessConfig {
    /// Rename finished job directories after their largest file
    pub rename_finished: bool,
    /// Convert JSON transcripts in finished directories to SRT
    pub convert_srt: bool,
}

impl DispatchConfig {
    pub fn admission_retry_interval(&self) -> Duration {
        Duration::from_millis(self.admission_retry_ms)
    }

    pub fn admission_attempt_limit(&self) -> Option<u32> {
        (self.max_admission_attempts > 0).then_some(self.max_admission_attempts)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            dispatch: DispatchConfig::default(),
            layout: LayoutConfig::default(),
            transcriber: TranscriberConfig::default(),
            postprocess: PostprocessConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: MonitorBackend::Nvml,
            monitor_binary: "nvidia-smi".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_device: 1,
            // 5.5 GiB
            required_memory_bytes: GIB * 11 / 2,
            workers: None,
            admission_retry_ms: default_admission_retry_ms(),
            max_admission_attempts: default_max_admission_attempts(),
            job_timeout_secs: None,
            selection_policy: SelectionPolicy::LeastLoaded,
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            pending_dir: "Input-Videos".to_string(),
            staging_dir: ".staging".to_string(),
            finished_dir: "Videos".to_string(),
            input_extensions: vec!["mp4".to_string()],
            artifact_extensions: ["json", "srt", "tsv", "txt", "vtt"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            job_dir_prefix: "Video - ".to_string(),
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            binary_path: "insanely-fast-whisper".to_string(),
            model: "openai/whisper-large-v3".to_string(),
            task: "transcribe".to_string(),
            language: "en".to_string(),
            extra_args: vec![],
        }
    }
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            rename_finished: true,
            convert_srt: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| DispatchError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DispatchError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DispatchError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_jobs_per_device == 0 {
            return Err(DispatchError::Config(
                "dispatch.max_jobs_per_device must be at least 1".to_string(),
            ));
        }
        if self.dispatch.workers == Some(0) {
            return Err(DispatchError::Config("dispatch.workers must be at least 1".to_string()));
        }
        if self.layout.input_extensions.is_empty() {
            return Err(DispatchError::Config("layout.input_extensions is empty".to_string()));
        }
        let overlapping = self
            .layout
            .input_extensions
            .iter()
            .find(|ext| self.layout.artifact_extensions.contains(ext));
        if let Some(ext) = overlapping {
            return Err(DispatchError::Config(format!(
                "extension '{}' is listed both as input and as artifact",
                ext
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        Config::default().save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded.dispatch.max_jobs_per_device, 1);
        assert_eq!(loaded.dispatch.selection_policy, SelectionPolicy::LeastLoaded);
        assert_eq!(loaded.layout.pending_dir, "Input-Videos");
    }

    #[test]
    fn test_optional_dispatch_fields_fall_back_to_defaults() {
        let mut text = toml::to_string_pretty(&Config::default()).unwrap();
        text = text
            .lines()
            .filter(|line| {
                !line.starts_with("admission_retry_ms")
                    && !line.starts_with("max_admission_attempts")
                    && !line.starts_with("selection_policy")
            })
            .collect::<Vec<_>>()
            .join("\n");

        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.dispatch.admission_retry_ms, 500);
        assert_eq!(config.dispatch.max_admission_attempts, 7200);
        assert_eq!(config.dispatch.selection_policy, SelectionPolicy::LeastLoaded);
    }

    #[test]
    fn test_partial_file_keeps_other_sections() {
        let config: Config = toml::from_str(
            "[dispatch]\nmax_jobs_per_device = 2\n\n[transcriber]\nlanguage = \"ja\"\n",
        )
        .unwrap();
        assert_eq!(config.dispatch.max_jobs_per_device, 2);
        assert_eq!(config.dispatch.required_memory_bytes, GIB * 11 / 2);
        assert_eq!(config.transcriber.language, "ja");
        assert_eq!(config.transcriber.binary_path, "insanely-fast-whisper");
        assert_eq!(config.layout.finished_dir, "Videos");
    }

    #[test]
    fn test_monitor_backend_defaults_to_nvml() {
        assert_eq!(Config::default().devices.backend, MonitorBackend::Nvml);
        let config: Config = toml::from_str("[devices]\nbackend = \"nvidia-smi\"\n").unwrap();
        assert_eq!(config.devices.backend, MonitorBackend::NvidiaSmi);
        assert_eq!(config.devices.monitor_binary, "nvidia-smi");
    }

    #[test]
    fn test_policy_names_are_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: SelectionPolicy,
        }
        let parsed: Wrapper = toml::from_str("policy = \"most-free-memory\"").unwrap();
        assert_eq!(parsed.policy, SelectionPolicy::MostFreeMemory);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.dispatch.max_jobs_per_device = 0;
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_input_listed_as_artifact() {
        let mut config = Config::default();
        config.layout.artifact_extensions.push("mp4".to_string());
        assert!(config.validate().is_err());
    }
}
