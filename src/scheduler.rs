use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, DeviceAdmissionTable, Refusal};
use crate::config::DispatchConfig;
use crate::device::{DeviceId, DeviceSnapshot};
use crate::error::{Result, DispatchError};
use crate::executor::{JobExecutor, JobOutcome};
use crate::job::{Job, JobQueue, JobState};

/// Scheduling knobs taken from `[dispatch]`
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub required_memory_bytes: u64,
    pub max_jobs_per_device: usize,
    pub workers: Option<usize>,
    pub admission_retry_interval: Duration,
    pub max_admission_attempts: Option<u32>,
    /// Requeues granted to a job whose staging failed
    pub max_requeues: u32,
}

impl From<&DispatchConfig> for SchedulerSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            required_memory_bytes: config.required_memory_bytes,
            max_jobs_per_device: config.max_jobs_per_device,
            workers: config.workers,
            admission_retry_interval: config.admission_retry_interval(),
            max_admission_attempts: config.admission_attempt_limit(),
            max_requeues: 1,
        }
    }
}

/// Final record of one job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub sequence: u64,
    pub source_path: PathBuf,
    pub state: JobState,
    pub device: Option<DeviceId>,
    /// Refusals because no device had the memory, counted against the limit
    pub admission_attempts: u32,
    pub outputs: Vec<PathBuf>,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

impl JobReport {
    fn new(job: &Job, device: Option<DeviceId>) -> Self {
        Self {
            sequence: job.sequence,
            source_path: job.source_path.clone(),
            state: job.state,
            device,
            admission_attempts: job.admission_attempts,
            outputs: Vec::new(),
            error_kind: None,
            error: None,
        }
    }

    fn with_error(mut self, err: &DispatchError) -> Self {
        self.error_kind = Some(err.kind());
        self.error = Some(err.to_string());
        self
    }
}

/// Number of workers for a batch: one per admission slot, at least one
pub fn pool_size(snapshot: &DeviceSnapshot, settings: &SchedulerSettings) -> usize {
    let slots = (snapshot.len() * settings.max_jobs_per_device).max(1);
    settings.workers.map_or(slots, |cap| cap.min(slots))
}

/// Fixed worker pool draining a `JobQueue` through admission and execution
#[derive(Clone)]
pub struct Scheduler {
    table: Arc<DeviceAdmissionTable>,
    executor: Arc<JobExecutor>,
    settings: SchedulerSettings,
    progress: ProgressBar,
}

impl Scheduler {
    pub fn new(
        table: Arc<DeviceAdmissionTable>,
        executor: Arc<JobExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            table,
            executor,
            settings,
            progress: ProgressBar::hidden(),
        }
    }

    /// Show a progress bar over the batch's jobs
    pub fn with_progress_bar(mut self) -> Self {
        self.progress = ProgressBar::new(0);
        self.progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} jobs {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self
    }

    pub fn table(&self) -> &Arc<DeviceAdmissionTable> {
        &self.table
    }

    /// Run every queued job to a terminal state.
    ///
    /// Per-job failures are part of the returned reports. Only device query
    /// failures and crashed workers end the run early with an error.
    pub async fn run(&self, queue: Arc<JobQueue>) -> Result<Vec<JobReport>> {
        let snapshot = self.table.snapshot().await?;
        let workers = pool_size(&snapshot, &self.settings);
        info!(
            "Dispatching {} jobs over {} devices with {} workers",
            queue.outstanding(),
            snapshot.len(),
            workers
        );
        self.progress.set_length(queue.outstanding() as u64);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(self.clone().worker_loop(worker, Arc::clone(&queue), Arc::clone(&reports)));
        }

        let mut fatal = None;
        while let Some(joined) = pool.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => DispatchError::Worker(e.to_string()),
            };
            if fatal.is_none() {
                error!("Stopping batch: {}", failure);
                pool.abort_all();
                fatal = Some(failure);
            }
        }
        self.progress.finish_and_clear();

        if let Some(e) = fatal {
            return Err(e);
        }

        let mut reports = std::mem::take(&mut *reports.lock().unwrap_or_else(|p| p.into_inner()));
        reports.sort_by_key(|r| r.sequence);
        Ok(reports)
    }

    async fn worker_loop(
        self,
        worker: usize,
        queue: Arc<JobQueue>,
        reports: Arc<Mutex<Vec<JobReport>>>,
    ) -> Result<()> {
        debug!(worker, "Worker started");
        let record = |report: JobReport| {
            self.progress.inc(1);
            reports.lock().unwrap_or_else(|p| p.into_inner()).push(report);
            queue.finish();
        };

        while let Some(mut job) = queue.dequeue().await {
            let admission = self
                .table
                .admit(self.settings.required_memory_bytes, self.settings.max_jobs_per_device)
                .await?;

            let slot = match admission {
                Admission::Granted(slot) => slot,
                Admission::Refused(refusal) => {
                    // Waiting on our own running jobs never uses up the budget
                    if refusal == Refusal::OutOfMemory {
                        job.admission_attempts += 1;
                    }
                    if self
                        .settings
                        .max_admission_attempts
                        .is_some_and(|limit| job.admission_attempts >= limit)
                    {
                        warn!(
                            job = job.sequence,
                            "Abandoning {} after {} admission attempts",
                            job.file_name(),
                            job.admission_attempts
                        );
                        job.state = JobState::Abandoned;
                        record(JobReport::new(&job, None));
                        continue;
                    }
                    debug!(worker, job = job.sequence, ?refusal, "No device available, requeueing");
                    queue.requeue(job);
                    tokio::time::sleep(self.settings.admission_retry_interval).await;
                    continue;
                }
            };

            let device = slot.device();
            self.progress.set_message(format!("{} on GPU {}", job.file_name(), device));
            let outcome = self.executor.execute(&mut job, device).await;
            drop(slot);

            match outcome {
                JobOutcome::Completed(outputs) => {
                    let mut report = JobReport::new(&job, Some(device));
                    report.outputs = outputs;
                    record(report);
                }
                JobOutcome::Failed(e @ DispatchError::Staging(_))
                    if job.requeues < self.settings.max_requeues =>
                {
                    job.requeues += 1;
                    info!(job = job.sequence, "Requeueing {} after staging failure: {}", job.file_name(), e);
                    queue.requeue(job);
                }
                JobOutcome::Failed(e) => {
                    if matches!(e, DispatchError::Staging(_)) {
                        job.state = JobState::Abandoned;
                    }
                    record(JobReport::new(&job, Some(device)).with_error(&e));
                }
            }
        }

        debug!(worker, "Worker finished, queue drained");
        Ok(())
    }
}
