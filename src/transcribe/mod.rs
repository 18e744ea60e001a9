// External transcription workers
//
// The dispatcher treats the transcriber as an opaque process: it gets a
// staged input, a device and an output path, and either leaves the expected
// artifacts behind or fails.
// - InsanelyFastWhisper: the insanely-fast-whisper CLI
//
// To add another transcriber, implement TranscriptionWorker and add it to
// TranscriberImplementation and the factory.

pub mod insanely_fast_whisper;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use insanely_fast_whisper::InsanelyFastWhisper;

use crate::config::TranscriberConfig;
use crate::device::DeviceId;
use crate::error::Result;

/// Contract of an external transcription worker
#[async_trait]
pub trait TranscriptionWorker: Send + Sync {
    /// Where the transcript for `staged_input` is written
    fn transcript_path(&self, staged_input: &Path) -> PathBuf {
        staged_input.with_extension("json")
    }

    /// Every artifact a successful run leaves behind, transcript first
    fn expected_artifacts(&self, staged_input: &Path) -> Vec<PathBuf> {
        vec![self.transcript_path(staged_input)]
    }

    /// Transcribe `staged_input` on `device`, writing to `transcript_path`.
    ///
    /// Resolves when the process exits. Callers must still check that the
    /// expected artifacts exist, as a zero exit status alone proves nothing.
    async fn run(&self, staged_input: &Path, device: DeviceId, transcript_path: &Path) -> Result<()>;
}

/// Transcriber implementation type
#[derive(Debug, Clone)]
pub enum TranscriberImplementation {
    InsanelyFastWhisper,
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    /// Create a transcriber based on implementation type
    pub fn create_transcriber(
        implementation: TranscriberImplementation,
        config: TranscriberConfig,
    ) -> Box<dyn TranscriptionWorker> {
        match implementation {
            TranscriberImplementation::InsanelyFastWhisper => {
                Box::new(InsanelyFastWhisper::new(config))
            }
        }
    }

    /// Create with default implementation
    pub fn create_default(config: TranscriberConfig) -> Box<dyn TranscriptionWorker> {
        Self::create_transcriber(TranscriberImplementation::InsanelyFastWhisper, config)
    }
}
