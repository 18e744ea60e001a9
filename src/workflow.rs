use chrono::{DateTime, Local};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::DeviceAdmissionTable;
use crate::config::Config;
use crate::device::{DeviceMonitor, DeviceMonitorFactory};
use crate::error::Result;
use crate::executor::JobExecutor;
use crate::job::{JobQueue, JobState};
use crate::layout::WorkingDirectories;
use crate::postprocess::{convert_finished_transcripts, rename_finished_dirs};
use crate::recovery::{RecoverySweep, SweepMode, SweepReport};
use crate::scheduler::{JobReport, Scheduler, SchedulerSettings};
use crate::transcribe::{TranscriberFactory, TranscriptionWorker};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Outcome of one batch run
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    /// One report per job, by sequence number. Output paths refer to the
    /// finished directories before the naming pass.
    pub reports: Vec<JobReport>,
    pub renamed_dirs: usize,
    pub subtitles_written: usize,
    pub sweep: SweepReport,
}

impl BatchSummary {
    fn count(&self, states: &[JobState]) -> usize {
        self.reports.iter().filter(|r| states.contains(&r.state)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(&[JobState::Completed])
    }

    /// Jobs that failed, whether or not their rollback finished
    pub fn failed(&self) -> usize {
        self.count(&[JobState::Failed, JobState::RolledBack])
    }

    pub fn rolled_back(&self) -> usize {
        self.count(&[JobState::RolledBack])
    }

    pub fn abandoned(&self) -> usize {
        self.count(&[JobState::Abandoned])
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch {} started {}",
            self.batch_id,
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(
            f,
            "{} completed, {} failed ({} rolled back), {} abandoned",
            self.completed(),
            self.failed(),
            self.rolled_back(),
            self.abandoned()
        )?;
        for report in self.reports.iter().filter(|r| r.state != JobState::Completed) {
            let name = report
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            writeln!(
                f,
                "  #{} {}: {} {}",
                report.sequence,
                name,
                report.state,
                report.error.as_deref().unwrap_or("")
            )?;
        }
        write!(f, "Script completed in {:.2} seconds", self.elapsed.as_secs_f64())
    }
}

/// Full batch: dispatch every pending input, post-process the finished
/// directories and sweep up whatever did not complete.
pub struct BatchWorkflow {
    config: Config,
    dirs: WorkingDirectories,
    monitor: Arc<dyn DeviceMonitor>,
    transcriber: Arc<dyn TranscriptionWorker>,
    show_progress: bool,
}

impl BatchWorkflow {
    /// Workflow rooted at `root` using the configured device monitor and transcriber
    pub fn new<P: AsRef<Path>>(config: Config, root: P) -> Result<Self> {
        config.validate()?;
        let monitor: Arc<dyn DeviceMonitor> =
            Arc::from(DeviceMonitorFactory::create_monitor(config.devices.clone()));
        let transcriber: Arc<dyn TranscriptionWorker> =
            Arc::from(TranscriberFactory::create_default(config.transcriber.clone()));
        Ok(Self::with_components(config, root, monitor, transcriber))
    }

    pub fn with_components<P: AsRef<Path>>(
        config: Config,
        root: P,
        monitor: Arc<dyn DeviceMonitor>,
        transcriber: Arc<dyn TranscriptionWorker>,
    ) -> Self {
        let dirs = WorkingDirectories::new(root, &config.layout);
        Self {
            config,
            dirs,
            monitor,
            transcriber,
            show_progress: false,
        }
    }

    /// Draw a progress bar while jobs run
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn dirs(&self) -> &WorkingDirectories {
        &self.dirs
    }

    /// Process everything currently in the pending directory.
    ///
    /// Per-job failures end up in the summary. Errors returned here are
    /// batch-level (no device visibility, filesystem trouble); the error-mode
    /// recovery sweep has already run when they surface.
    pub async fn run(&self) -> Result<BatchSummary> {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", id = %batch_id);

        async {
            match self.run_batch(batch_id).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    error!("Batch failed ({}): {}", e.kind(), e);
                    if let Err(sweep_error) = self.sweep(SweepMode::Error).await {
                        error!("Recovery sweep failed: {}", sweep_error);
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_batch(&self, batch_id: Uuid) -> Result<BatchSummary> {
        let started_at = Local::now();
        let start = Instant::now();

        self.dirs.ensure().await?;

        let snapshot = self.monitor.snapshot().await?;
        if snapshot.is_empty() {
            warn!("No GPU devices visible; jobs will wait for admission");
        }
        for (id, memory) in &snapshot {
            info!(
                "GPU {}: {:.1} GiB free of {:.1} GiB",
                id,
                memory.free_bytes as f64 / GIB,
                memory.total_bytes as f64 / GIB
            );
        }

        let inputs = self.dirs.pending_inputs().await?;
        info!("Found {} files in {}", inputs.len(), self.dirs.pending_dir.display());
        let queue = Arc::new(JobQueue::from_paths(inputs));
        if queue.is_empty() {
            info!("Nothing to transcribe");
        }

        let table = Arc::new(DeviceAdmissionTable::new(
            Arc::clone(&self.monitor),
            self.config.dispatch.selection_policy,
        ));
        let executor = Arc::new(JobExecutor::new(
            self.dirs.clone(),
            Arc::clone(&self.transcriber),
            self.config.dispatch.job_timeout(),
        ));
        let mut scheduler = Scheduler::new(table, executor, SchedulerSettings::from(&self.config.dispatch));
        if self.show_progress {
            scheduler = scheduler.with_progress_bar();
        }

        let reports = scheduler.run(queue).await?;

        let renamed_dirs = if self.config.postprocess.rename_finished {
            rename_finished_dirs(&self.dirs).await?.len()
        } else {
            0
        };
        let subtitles_written = if self.config.postprocess.convert_srt {
            convert_finished_transcripts(&self.dirs).await?
        } else {
            0
        };

        let sweep = self.sweep(SweepMode::Normal).await?;

        let summary = BatchSummary {
            batch_id,
            started_at,
            elapsed: start.elapsed(),
            reports,
            renamed_dirs,
            subtitles_written,
            sweep,
        };
        info!(
            "Batch finished: {} completed, {} failed, {} abandoned",
            summary.completed(),
            summary.failed(),
            summary.abandoned()
        );
        Ok(summary)
    }

    /// Run the recovery sweep over this workflow's directories
    pub async fn sweep(&self, mode: SweepMode) -> Result<SweepReport> {
        RecoverySweep::new(self.dirs.clone()).sweep(mode).await
    }
}
