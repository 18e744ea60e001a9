use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting in the queue
    Pending,
    /// Input moved into the job's staging directory
    Staged,
    /// Transcriber process spawned
    Running,
    /// Artifacts relocated into the finished directory
    Completed,
    /// Staging or transcription failed
    Failed,
    /// Failed job whose filesystem changes were undone
    RolledBack,
    /// Gave up after too many admission attempts or requeues
    Abandoned,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::RolledBack | JobState::Abandoned
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Staged => "staged",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::RolledBack => "rolled-back",
            JobState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// One input file on its way through staging, transcription and relocation
#[derive(Debug, Clone)]
pub struct Job {
    /// Input path at enqueue time
    pub source_path: PathBuf,
    /// Assigned at enqueue, starting at 1
    pub sequence: u64,
    pub state: JobState,
    /// Admission attempts that found no device with enough free memory
    pub admission_attempts: u32,
    /// Times the job went back to Pending after a failure
    pub requeues: u32,
}

impl Job {
    pub fn new(source_path: PathBuf, sequence: u64) -> Self {
        Self {
            source_path,
            sequence,
            state: JobState::Pending,
            admission_attempts: 0,
            requeues: 0,
        }
    }

    /// File name of the input, which stays stable while the file moves
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("job-{}", self.sequence))
    }
}

/// FIFO backlog shared by the worker pool.
///
/// A job counts as outstanding from enqueue until `finish` is called for it,
/// including while a worker holds it between dequeue and requeue. `dequeue`
/// only reports exhaustion once nothing is outstanding.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    next_sequence: AtomicU64,
    outstanding: AtomicUsize,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from input paths, in the given order
    pub fn from_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> Self {
        let queue = Self::new();
        for path in paths {
            queue.enqueue(path);
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a new pending job and return its sequence number
    pub fn enqueue(&self, source_path: PathBuf) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.lock().push_back(Job::new(source_path, sequence));
        self.notify.notify_one();
        sequence
    }

    /// Put a dequeued job back at the tail
    pub fn requeue(&self, mut job: Job) {
        job.state = JobState::Pending;
        self.lock().push_back(job);
        self.notify.notify_one();
    }

    /// Mark a dequeued job as terminal
    pub fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the next job; `None` once every job reached a terminal state
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.lock().pop_front() {
                return Some(job);
            }
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return None;
            }

            notified.await;
        }
    }

    /// Jobs currently waiting in the queue
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs not yet finished, queued or held by a worker
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}
