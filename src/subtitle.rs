use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;

/// Transcript JSON as written by the transcriber
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub chunks: Vec<TranscriptChunk>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptChunk {
    pub text: String,
    /// Start and end in seconds; either side may be null
    #[serde(default)]
    pub timestamp: (Option<f64>, Option<f64>),
}

/// Convert a transcript JSON file into an SRT file.
///
/// Chunks missing a start or end timestamp are skipped with a warning.
/// Returns the number of subtitle entries written.
pub async fn convert_transcript<P: AsRef<Path>, Q: AsRef<Path>>(json_path: P, srt_path: Q) -> Result<usize> {
    let json_path = json_path.as_ref();
    let srt_path = srt_path.as_ref();
    info!("Generating SRT file: {}", srt_path.display());

    let content = fs::read_to_string(json_path).await?;
    let transcript: Transcript = serde_json::from_str(&content)?;

    let (srt_content, entries) = render_srt(&transcript);
    fs::write(srt_path, srt_content).await?;

    info!("Converted {} to {}", json_path.display(), srt_path.display());
    Ok(entries)
}

/// Render SRT text. Each entry keeps its chunk's 1-based position, so
/// skipped chunks leave gaps in the numbering.
pub fn render_srt(transcript: &Transcript) -> (String, usize) {
    let mut srt_content = String::new();
    let mut entries = 0;

    for (index, chunk) in transcript.chunks.iter().enumerate() {
        let number = index + 1;
        let (Some(start), Some(end)) = chunk.timestamp else {
            warn!("Chunk {} has missing timestamps. Skipping...", number);
            continue;
        };

        entries += 1;
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            number,
            format_srt_time(start),
            format_srt_time(end),
            chunk.text.trim()
        ));
    }

    (srt_content, entries)
}

/// Format time in seconds to SRT time format (HH:MM:SS,mmm)
fn format_srt_time(seconds: f64) -> String {
    let total_milliseconds = (seconds.max(0.0) * 1000.0) as u64;
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
