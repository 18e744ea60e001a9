use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;
use crate::layout::{WorkingDirectories, INCOMPLETE_PREFIX};
use crate::subtitle::convert_transcript;

/// Completed job directories under the finished root, sorted by name
async fn finished_job_dirs(dirs: &WorkingDirectories) -> Result<Vec<PathBuf>> {
    let mut job_dirs = Vec::new();
    if !dirs.finished_root.exists() {
        return Ok(job_dirs);
    }

    let mut entries = fs::read_dir(&dirs.finished_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_incomplete = entry.file_name().to_string_lossy().starts_with(INCOMPLETE_PREFIX);
        if entry.file_type().await?.is_dir() && !is_incomplete {
            job_dirs.push(entry.path());
        }
    }
    job_dirs.sort();
    Ok(job_dirs)
}

async fn largest_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut largest: Option<(u64, PathBuf)> = None;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && largest.as_ref().is_none_or(|(size, _)| metadata.len() > *size) {
            largest = Some((metadata.len(), entry.path()));
        }
    }
    Ok(largest.map(|(_, path)| path))
}

/// Rename every finished job directory after the stem of its largest file,
/// which is the source video. Returns the new directory paths.
pub async fn rename_finished_dirs(dirs: &WorkingDirectories) -> Result<Vec<PathBuf>> {
    let mut renamed = Vec::new();

    for job_dir in finished_job_dirs(dirs).await? {
        let Some(largest) = largest_file(&job_dir).await? else {
            continue;
        };
        let Some(stem) = largest.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };

        let target = dirs.finished_root.join(&stem);
        if target == job_dir {
            continue;
        }
        if target.exists() {
            warn!("Not renaming {}: {} already exists", job_dir.display(), target.display());
            continue;
        }

        info!("Renaming {} -> {}", job_dir.display(), target.display());
        fs::rename(&job_dir, &target).await?;
        renamed.push(target);
    }

    Ok(renamed)
}

/// Write an SRT next to every JSON transcript in the finished job directories.
/// Returns the number of transcripts converted.
pub async fn convert_finished_transcripts(dirs: &WorkingDirectories) -> Result<usize> {
    let mut converted = 0;

    for job_dir in finished_job_dirs(dirs).await? {
        let mut entries = fs::read_dir(&job_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let json_path = entry.path();
            if json_path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let srt_path = json_path.with_extension("srt");
            match convert_transcript(&json_path, &srt_path).await {
                Ok(_) => converted += 1,
                Err(e) => warn!("Failed to convert {}: {}", json_path.display(), e),
            }
        }
    }

    Ok(converted)
}
