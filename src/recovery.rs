use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::layout::{move_file, WorkingDirectories, INCOMPLETE_PREFIX};

/// Why the sweep runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// End of a normal batch: completed jobs stay where they are
    Normal,
    /// After a batch-level failure: the finished root is cleared as well
    Error,
}

/// What a sweep changed
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Inputs moved back into the pending directory (new locations)
    pub restored: Vec<PathBuf>,
    /// Derived artifacts deleted
    pub removed_artifacts: Vec<PathBuf>,
    /// Staging and incomplete job directories deleted
    pub removed_dirs: Vec<PathBuf>,
    pub finished_root_removed: bool,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty()
            && self.removed_artifacts.is_empty()
            && self.removed_dirs.is_empty()
            && !self.finished_root_removed
    }
}

/// Restores the pre-batch filesystem state for every job that did not
/// complete, so the next run can start from the pending directory again.
/// Running it twice in a row changes nothing the second time.
pub struct RecoverySweep {
    dirs: WorkingDirectories,
}

impl RecoverySweep {
    pub fn new(dirs: WorkingDirectories) -> Self {
        Self { dirs }
    }

    pub async fn sweep(&self, mode: SweepMode) -> Result<SweepReport> {
        info!("Running recovery sweep ({:?})", mode);
        fs::create_dir_all(&self.dirs.pending_dir).await?;
        let mut report = SweepReport::default();

        for file in self.stray_files(mode) {
            if self.dirs.is_input(&file) {
                let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                let target = self.dirs.pending_destination(&name);
                info!("Moving {} to {}", self.display(&file), self.display(&target));
                move_file(&file, &target).await?;
                report.restored.push(target);
            } else if self.dirs.is_artifact(&file) {
                info!("Removing file {}", self.display(&file));
                match fs::remove_file(&file).await {
                    Ok(()) => report.removed_artifacts.push(file),
                    Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
                }
            }
        }

        for dir in self.abandoned_dirs() {
            info!("Removing directory {}", self.display(&dir));
            fs::remove_dir_all(&dir).await?;
            report.removed_dirs.push(dir);
        }
        // Only succeeds when empty, which is the point
        let _ = fs::remove_dir(&self.dirs.staging_root).await;

        if mode == SweepMode::Error && self.dirs.finished_root.exists() {
            info!("Removing directory {}", self.display(&self.dirs.finished_root));
            fs::remove_dir_all(&self.dirs.finished_root).await?;
            report.finished_root_removed = true;
        }

        info!(
            "Recovery sweep restored {} inputs, removed {} artifacts and {} directories",
            report.restored.len(),
            report.removed_artifacts.len(),
            report.removed_dirs.len()
        );
        Ok(report)
    }

    /// Files that belong to no completed job: loose files in the working
    /// root, everything under staging, and everything under the finished
    /// root except completed job directories (all of it in error mode)
    fn stray_files(&self, mode: SweepMode) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dirs.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        files.extend(walk_files(&self.dirs.staging_root, |_| true));
        files.extend(walk_files(&self.dirs.finished_root, |path| {
            mode == SweepMode::Error || !self.is_completed_job_dir(path)
        }));
        files
    }

    /// Staging directories and incomplete finished directories
    fn abandoned_dirs(&self) -> Vec<PathBuf> {
        let staging = subdirectories(&self.dirs.staging_root);
        let incomplete = subdirectories(&self.dirs.finished_root).into_iter().filter(|dir| {
            dir.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(INCOMPLETE_PREFIX))
        });
        staging.into_iter().chain(incomplete).collect()
    }

    fn is_completed_job_dir(&self, path: &Path) -> bool {
        path.parent() == Some(self.dirs.finished_root.as_path())
            && path.is_dir()
            && !path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(INCOMPLETE_PREFIX))
    }

    fn display(&self, path: &Path) -> String {
        pathdiff::diff_paths(path, &self.dirs.root)
            .unwrap_or_else(|| path.to_path_buf())
            .display()
            .to_string()
    }
}

fn walk_files<F>(root: &Path, mut descend: F) -> Vec<PathBuf>
where
    F: FnMut(&Path) -> bool,
{
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_type().is_dir() || descend(e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn subdirectories(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}
