use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::config::LayoutConfig;
use crate::error::Result;

/// Name prefix of finished-job directories that are still being filled
pub const INCOMPLETE_PREFIX: &str = ".incomplete-";

/// Filesystem state shared by the dispatcher.
///
/// The directories are the state machine: a file in `pending_dir` is
/// unclaimed work, a `job-N` directory under `staging_root` belongs to the
/// executor running job N, and every non-hidden directory under
/// `finished_root` is a completed job.
#[derive(Debug, Clone)]
pub struct WorkingDirectories {
    pub root: PathBuf,
    pub pending_dir: PathBuf,
    pub staging_root: PathBuf,
    pub finished_root: PathBuf,
    input_extensions: Vec<String>,
    artifact_extensions: Vec<String>,
    job_dir_prefix: String,
}

impl WorkingDirectories {
    /// Resolve the configured layout relative to `root`
    pub fn new<P: AsRef<Path>>(root: P, layout: &LayoutConfig) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            pending_dir: root.join(&layout.pending_dir),
            staging_root: root.join(&layout.staging_dir),
            finished_root: root.join(&layout.finished_dir),
            input_extensions: lowercase_all(&layout.input_extensions),
            artifact_extensions: lowercase_all(&layout.artifact_extensions),
            job_dir_prefix: layout.job_dir_prefix.clone(),
            root,
        }
    }

    /// Create the pending, staging and finished directories if missing
    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.pending_dir).await?;
        fs::create_dir_all(&self.staging_root).await?;
        fs::create_dir_all(&self.finished_root).await?;
        Ok(())
    }

    /// Staging directory owned by job `sequence`
    pub fn staging_dir(&self, sequence: u64) -> PathBuf {
        self.staging_root.join(format!("job-{}", sequence))
    }

    /// Temporary name of job `sequence`'s finished directory
    pub fn incomplete_job_dir(&self, sequence: u64) -> PathBuf {
        self.finished_root.join(format!("{}{}", INCOMPLETE_PREFIX, sequence))
    }

    /// Final directory name for job `sequence`
    pub fn job_dir_name(&self, sequence: u64) -> String {
        format!("{}{}", self.job_dir_prefix, sequence)
    }

    pub fn is_input(&self, path: &Path) -> bool {
        has_extension(path, &self.input_extensions)
    }

    pub fn is_artifact(&self, path: &Path) -> bool {
        has_extension(path, &self.artifact_extensions)
    }

    /// Whether `path` lies inside a completed finished-job directory
    pub fn is_in_finished_job(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.finished_root) else {
            return false;
        };
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(job_dir), Some(_)) => {
                !job_dir.as_os_str().to_string_lossy().starts_with(INCOMPLETE_PREFIX)
            }
            _ => false,
        }
    }

    /// Input files waiting in the pending directory, sorted by name
    pub async fn pending_inputs(&self) -> Result<Vec<PathBuf>> {
        let mut inputs = Vec::new();
        let mut entries = fs::read_dir(&self.pending_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && self.is_input(&path) {
                inputs.push(path);
            }
        }
        inputs.sort();
        Ok(inputs)
    }

    /// Path in the pending directory a file named `file_name` can return to
    pub fn pending_destination(&self, file_name: &str) -> PathBuf {
        unique_destination(&self.pending_dir, file_name)
    }
}

fn lowercase_all(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .collect()
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.contains(&ext.to_lowercase()))
        .unwrap_or(false)
}

/// `dir/file_name`, or `dir/stem (N).ext` when that name is taken
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let extension = name.extension().map(|e| e.to_string_lossy().to_string());

    (2..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Move a file, falling back to copy and delete across filesystems
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    debug!("Moving {} -> {}", from.display(), to.display());
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if from.exists() && e.kind() == std::io::ErrorKind::CrossesDevices => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
