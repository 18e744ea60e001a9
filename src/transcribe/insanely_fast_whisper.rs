use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::command::ToolCommand;
use crate::config::TranscriberConfig;
use crate::device::DeviceId;
use crate::error::{Result, DispatchError};
use super::TranscriptionWorker;

/// insanely-fast-whisper CLI, one process per job, pinned to one GPU
pub struct InsanelyFastWhisper {
    config: TranscriberConfig,
}

impl InsanelyFastWhisper {
    pub fn new(config: TranscriberConfig) -> Self {
        Self { config }
    }

    /// Build the invocation as an argument vector; paths are never shell-quoted
    pub fn command(&self, staged_input: &Path, device: DeviceId, transcript_path: &Path) -> ToolCommand {
        ToolCommand::new(&self.config.binary_path, "Transcription")
            .path_flag("--file-name", staged_input)
            .flag("--model-name", &self.config.model)
            .flag("--task", &self.config.task)
            .flag("--language", &self.config.language)
            .flag("--device-id", device.to_string())
            .path_flag("--transcript-path", transcript_path)
            .args(self.config.extra_args.iter().cloned())
    }
}

#[async_trait]
impl TranscriptionWorker for InsanelyFastWhisper {
    async fn run(&self, staged_input: &Path, device: DeviceId, transcript_path: &Path) -> Result<()> {
        info!("Transcribing {} on GPU {}", staged_input.display(), device);

        let output = self
            .command(staged_input, device, transcript_path)
            .execute_with(DispatchError::Transcription)
            .await?;

        debug!("Transcriber stdout: {}", output.stdout.trim());
        Ok(())
    }
}
