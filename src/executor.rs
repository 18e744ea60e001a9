use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

use crate::device::DeviceId;
use crate::error::{Result, DispatchError};
use crate::job::{Job, JobState};
use crate::layout::{move_file, unique_destination, WorkingDirectories};
use crate::transcribe::TranscriptionWorker;

/// Result of one execution attempt
#[derive(Debug)]
pub enum JobOutcome {
    /// Paths of the input and every artifact inside the finished directory
    Completed(Vec<PathBuf>),
    Failed(DispatchError),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Filesystem changes made so far by one attempt, used for rollback
#[derive(Debug, Default)]
struct Progress {
    /// Current location of the input once it left the pending directory
    input_location: Option<PathBuf>,
    /// Finished directory under its temporary name
    incomplete_dir: Option<PathBuf>,
}

/// Runs one job on one device and owns its staging and finished entries
/// for the duration of the call.
pub struct JobExecutor {
    dirs: WorkingDirectories,
    transcriber: Arc<dyn TranscriptionWorker>,
    timeout: Option<Duration>,
}

impl JobExecutor {
    pub fn new(
        dirs: WorkingDirectories,
        transcriber: Arc<dyn TranscriptionWorker>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            dirs,
            transcriber,
            timeout,
        }
    }

    pub fn dirs(&self) -> &WorkingDirectories {
        &self.dirs
    }

    /// Stage, transcribe and relocate `job` on `device`.
    ///
    /// Never returns an error: failures are rolled back and reported as
    /// `JobOutcome::Failed`. The job ends `Completed`, `RolledBack`, or
    /// `Failed` when the rollback itself could not finish.
    pub async fn execute(&self, job: &mut Job, device: DeviceId) -> JobOutcome {
        let mut progress = Progress::default();

        match self.attempt(job, device, &mut progress).await {
            Ok(outputs) => {
                job.state = JobState::Completed;
                info!(job = job.sequence, device, "Completed {}", job.file_name());
                JobOutcome::Completed(outputs)
            }
            Err(e) => {
                job.state = JobState::Failed;
                warn!(
                    job = job.sequence,
                    device,
                    kind = e.kind(),
                    "Processing {} failed: {}",
                    job.file_name(),
                    e
                );
                if self.rollback(job, &progress).await {
                    job.state = JobState::RolledBack;
                }
                JobOutcome::Failed(e)
            }
        }
    }

    async fn attempt(&self, job: &mut Job, device: DeviceId, progress: &mut Progress) -> Result<Vec<PathBuf>> {
        let staged = self.stage(job, progress).await?;
        job.state = JobState::Staged;

        let transcript = self.transcriber.transcript_path(&staged);
        job.state = JobState::Running;
        info!(job = job.sequence, device, "Processing file: {} on GPU {}", job.file_name(), device);
        self.run_transcriber(&staged, device, &transcript).await?;

        let artifacts = self.transcriber.expected_artifacts(&staged);
        if let Some(missing) = artifacts.iter().find(|path| !path.exists()) {
            return Err(DispatchError::ArtifactMissing(missing.display().to_string()));
        }

        self.relocate(job, &staged, &artifacts, progress).await
    }

    async fn stage(&self, job: &Job, progress: &mut Progress) -> Result<PathBuf> {
        if !job.source_path.is_file() {
            return Err(DispatchError::Staging(format!(
                "{} is no longer in the pending directory",
                job.source_path.display()
            )));
        }

        let staging_dir = self.dirs.staging_dir(job.sequence);
        fs::create_dir_all(&staging_dir).await.map_err(|e| {
            DispatchError::Staging(format!("Failed to create {}: {}", staging_dir.display(), e))
        })?;

        let staged = staging_dir.join(job.file_name());
        move_file(&job.source_path, &staged).await.map_err(|e| {
            DispatchError::Staging(format!("Failed to claim {}: {}", job.source_path.display(), e))
        })?;
        progress.input_location = Some(staged.clone());

        Ok(staged)
    }

    async fn run_transcriber(&self, staged: &Path, device: DeviceId, transcript: &Path) -> Result<()> {
        let run = self.transcriber.run(staged, device, transcript);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| DispatchError::Timeout(limit))?,
            None => run.await,
        }
    }

    /// Move input and artifacts into the job's finished directory, then
    /// publish it under its final name
    async fn relocate(
        &self,
        job: &Job,
        staged: &Path,
        artifacts: &[PathBuf],
        progress: &mut Progress,
    ) -> Result<Vec<PathBuf>> {
        let incomplete = self.dirs.incomplete_job_dir(job.sequence);
        if incomplete.exists() {
            warn!(job = job.sequence, "Removing leftover {}", incomplete.display());
            fs::remove_dir_all(&incomplete).await?;
        }
        fs::create_dir_all(&self.dirs.finished_root).await?;
        fs::create_dir(&incomplete).await?;
        progress.incomplete_dir = Some(incomplete.clone());

        let input_target = incomplete.join(job.file_name());
        move_file(staged, &input_target).await?;
        progress.input_location = Some(input_target);

        let mut names = vec![job.file_name()];
        for artifact in artifacts {
            let name = artifact
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| DispatchError::ArtifactMissing(artifact.display().to_string()))?;
            move_file(artifact, &incomplete.join(&name)).await?;
            names.push(name);
        }

        // Earlier runs may already own the plain name
        let finished = unique_destination(&self.dirs.finished_root, &self.dirs.job_dir_name(job.sequence));
        fs::rename(&incomplete, &finished).await?;
        progress.incomplete_dir = None;
        progress.input_location = None;

        let staging_dir = self.dirs.staging_dir(job.sequence);
        if let Err(e) = fs::remove_dir_all(&staging_dir).await {
            warn!(job = job.sequence, "Failed to remove {}: {}", staging_dir.display(), e);
        }

        Ok(names.into_iter().map(|name| finished.join(name)).collect())
    }

    /// Undo the attempt's filesystem changes; returns false if anything was left behind.
    ///
    /// When the input cannot be moved back, the directory holding it is kept
    /// for the recovery sweep instead of being deleted.
    async fn rollback(&self, job: &Job, progress: &Progress) -> bool {
        info!(job = job.sequence, "Reversing the file operations for {}", job.file_name());
        let mut clean = true;
        let mut stranded_input = None;

        if let Some(location) = progress.input_location.as_ref().filter(|p| p.exists()) {
            let target = self.dirs.pending_destination(&job.file_name());
            if let Err(e) = move_file(location, &target).await {
                error!(job = job.sequence, "Failed to restore {}: {}", location.display(), e);
                clean = false;
                stranded_input = Some(location.as_path());
            }
        }

        let staging_dir = self.dirs.staging_dir(job.sequence);
        let dirs = progress.incomplete_dir.iter().chain(std::iter::once(&staging_dir));
        for dir in dirs.filter(|d| d.exists()) {
            if stranded_input.is_some_and(|input| input.starts_with(dir)) {
                warn!(job = job.sequence, "Keeping {} for the recovery sweep", dir.display());
                continue;
            }
            if let Err(e) = fs::remove_dir_all(dir).await {
                error!(job = job.sequence, "Failed to remove {}: {}", dir.display(), e);
                clean = false;
            }
        }

        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use assert_fs::prelude::*;
    use async_trait::async_trait;

    enum Behavior {
        WriteTranscript,
        ExitWithoutOutput,
        Fail,
        Hang,
        /// Leave the pending directory unusable, then fail
        BlockPendingThenFail,
        /// Also report a directory named like the input as an artifact
        CollidingArtifact,
    }

    struct ScriptedWorker(Behavior);

    fn colliding_artifact(staged: &Path) -> PathBuf {
        let name = staged.file_name().unwrap();
        staged.with_file_name("extra").join(name)
    }

    #[async_trait]
    impl TranscriptionWorker for ScriptedWorker {
        fn expected_artifacts(&self, staged: &Path) -> Vec<PathBuf> {
            let mut artifacts = vec![self.transcript_path(staged)];
            if let Behavior::CollidingArtifact = self.0 {
                artifacts.push(colliding_artifact(staged));
            }
            artifacts
        }

        async fn run(&self, staged: &Path, _device: DeviceId, transcript: &Path) -> Result<()> {
            match self.0 {
                Behavior::BlockPendingThenFail => {
                    // <root>/.staging/job-N/<input>
                    let pending = staged.ancestors().nth(3).unwrap().join("Input-Videos");
                    fs::remove_dir_all(&pending).await?;
                    fs::write(&pending, "not a directory").await?;
                    Err(DispatchError::Transcription("exit status 1".to_string()))
                }
                Behavior::CollidingArtifact => {
                    fs::create_dir_all(colliding_artifact(staged)).await?;
                    fs::write(transcript, r#"{"chunks":[]}"#).await?;
                    Ok(())
                }
                Behavior::WriteTranscript => {
                    fs::write(transcript, r#"{"chunks":[]}"#).await?;
                    Ok(())
                }
                Behavior::ExitWithoutOutput => Ok(()),
                Behavior::Fail => {
                    fs::write(transcript, "partial").await?;
                    Err(DispatchError::Transcription("exit status 1".to_string()))
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }
        }
    }

    fn setup(behavior: Behavior, timeout: Option<Duration>) -> (assert_fs::TempDir, JobExecutor, Job) {
        let temp = assert_fs::TempDir::new().unwrap();
        let dirs = WorkingDirectories::new(temp.path(), &Config::default().layout);
        std::fs::create_dir_all(&dirs.pending_dir).unwrap();
        temp.child("Input-Videos/talk.mp4").write_str("video").unwrap();

        let job = Job::new(dirs.pending_dir.join("talk.mp4"), 1);
        let executor = JobExecutor::new(dirs, Arc::new(ScriptedWorker(behavior)), timeout);
        (temp, executor, job)
    }

    #[tokio::test]
    async fn test_successful_job_lands_in_finished_dir() {
        let (temp, executor, mut job) = setup(Behavior::WriteTranscript, None);

        let outcome = executor.execute(&mut job, 0).await;

        let outputs = match outcome {
            JobOutcome::Completed(outputs) => outputs,
            JobOutcome::Failed(e) => panic!("expected completion, got {}", e),
        };
        let finished = temp.path().join("Videos/Video - 1");
        assert_eq!(outputs, vec![finished.join("talk.mp4"), finished.join("talk.json")]);
        assert!(outputs.iter().all(|p| p.exists()));
        assert_eq!(std::fs::read_dir(&finished).unwrap().count(), 2);
        assert!(!executor.dirs().staging_dir(1).exists());
        assert!(!temp.path().join("Input-Videos/talk.mp4").exists());
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_failed_transcription_rolls_back() {
        let (temp, executor, mut job) = setup(Behavior::Fail, None);

        let outcome = executor.execute(&mut job, 0).await;

        assert!(matches!(outcome, JobOutcome::Failed(DispatchError::Transcription(_))));
        assert_eq!(job.state, JobState::RolledBack);
        assert!(temp.path().join("Input-Videos/talk.mp4").exists());
        assert!(!executor.dirs().staging_dir(1).exists());
        assert_eq!(std::fs::read_dir(temp.path().join("Videos")).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_zero_exit_without_transcript_is_artifact_missing() {
        let (temp, executor, mut job) = setup(Behavior::ExitWithoutOutput, None);

        let outcome = executor.execute(&mut job, 0).await;

        assert!(matches!(outcome, JobOutcome::Failed(DispatchError::ArtifactMissing(_))));
        assert!(temp.path().join("Input-Videos/talk.mp4").exists());
    }

    #[tokio::test]
    async fn test_hung_transcriber_times_out() {
        let (temp, executor, mut job) = setup(Behavior::Hang, Some(Duration::from_millis(50)));

        let outcome = executor.execute(&mut job, 0).await;

        match outcome {
            JobOutcome::Failed(e @ DispatchError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(50));
                assert_eq!(e.to_string(), "Transcription timed out after 50ms");
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(temp.path().join("Input-Videos/talk.mp4").exists());
    }

    #[tokio::test]
    async fn test_vanished_input_is_staging_error() {
        let (temp, executor, mut job) = setup(Behavior::WriteTranscript, None);
        std::fs::remove_file(temp.path().join("Input-Videos/talk.mp4")).unwrap();

        let outcome = executor.execute(&mut job, 0).await;

        assert!(matches!(outcome, JobOutcome::Failed(DispatchError::Staging(_))));
        assert!(!executor.dirs().staging_dir(1).exists());
    }

    #[tokio::test]
    async fn test_existing_job_dir_name_is_not_overwritten() {
        let (temp, executor, mut job) = setup(Behavior::WriteTranscript, None);
        temp.child("Videos/Video - 1/old.mp4").touch().unwrap();

        let outcome = executor.execute(&mut job, 0).await;

        assert!(outcome.is_completed());
        assert!(temp.path().join("Videos/Video - 1/old.mp4").exists());
        assert!(temp.path().join("Videos/Video - 1 (2)/talk.mp4").exists());
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_staged_input() {
        let (temp, executor, mut job) = setup(Behavior::BlockPendingThenFail, None);

        let outcome = executor.execute(&mut job, 0).await;

        assert!(matches!(outcome, JobOutcome::Failed(DispatchError::Transcription(_))));
        assert_eq!(job.state, JobState::Failed);
        let staged = executor.dirs().staging_dir(1).join("talk.mp4");
        assert!(staged.exists());

        // Once the pending directory is usable again the sweep brings it back
        std::fs::remove_file(temp.path().join("Input-Videos")).unwrap();
        let report = crate::recovery::RecoverySweep::new(executor.dirs().clone())
            .sweep(crate::recovery::SweepMode::Normal)
            .await
            .unwrap();
        assert_eq!(report.restored, vec![temp.path().join("Input-Videos/talk.mp4")]);
        assert!(!executor.dirs().staging_dir(1).exists());
    }

    #[tokio::test]
    async fn test_relocation_failure_removes_incomplete_dir() {
        let (temp, executor, mut job) = setup(Behavior::CollidingArtifact, None);

        let outcome = executor.execute(&mut job, 0).await;

        assert!(matches!(outcome, JobOutcome::Failed(DispatchError::Io(_))));
        assert_eq!(job.state, JobState::RolledBack);
        assert!(temp.path().join("Input-Videos/talk.mp4").exists());
        assert!(!executor.dirs().incomplete_job_dir(1).exists());
        assert!(!temp.path().join("Videos/Video - 1").exists());
        assert!(!executor.dirs().staging_dir(1).exists());
    }
}
