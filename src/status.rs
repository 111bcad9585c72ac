//! Status reporting toward whatever displays the batch.
//!
//! The scheduler pushes per-job transitions, aggregate progress and run-level
//! events into a [`StatusSink`]. A sink may disappear at any time (a window
//! closed, a receiver dropped); [`Reporter`] swallows those failures so they
//! never reach scheduling decisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::scheduler::job::{ColorClass, FailureKind, Job, JobStatus, ReconType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("status receiver closed")]
    Closed,

    #[error("status target unavailable: {0}")]
    Unavailable(String),
}

/// One job transition as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub job_id: Uuid,
    pub filename: String,
    pub recon_type: ReconType,
    pub status: JobStatus,
    pub text: String,
    pub color: ColorClass,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            filename: job.filename.clone(),
            recon_type: job.recon_type,
            status: job.status.clone(),
            text: status_text(job),
            color: job.status.color_class(),
            at: Utc::now(),
        }
    }
}

/// Aggregate counters of the active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub queue_depth: usize,
    pub running: usize,
}

impl Progress {
    /// Whole-number completion percentage
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed.min(self.total) * 100) / self.total) as u8
    }
}

/// Final tally of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn record(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Completed => self.succeeded += 1,
            JobStatus::Failed(_) => self.failed += 1,
            JobStatus::Skipped(_) => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Running { .. } => {}
        }
    }
}

/// Run-level lifecycle events. Each run emits exactly one of
/// `Completed` or `Stopped`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        run_id: Uuid,
        total: usize,
        slots: u32,
    },
    Merged {
        run_id: Uuid,
        added: usize,
        total: usize,
    },
    Completed {
        run_id: Uuid,
        summary: BatchSummary,
    },
    Stopped {
        run_id: Uuid,
        summary: BatchSummary,
    },
}

/// Receives scheduler output. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, update: &StatusUpdate) -> Result<(), SinkError>;

    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError>;

    fn on_batch(&self, _event: &BatchEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Error-swallowing front of a [`StatusSink`].
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn StatusSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    pub fn job(&self, job: &Job) {
        if let Err(e) = self.sink.on_status(&StatusUpdate::for_job(job)) {
            tracing::debug!(job_id = %job.id, error = %e, "Status update dropped");
        }
    }

    pub fn progress(&self, progress: &Progress) {
        if let Err(e) = self.sink.on_progress(progress) {
            tracing::debug!(error = %e, "Progress update dropped");
        }
    }

    /// Replace the `Done full` text of a finished full reconstruction with
    /// its slice range. The output folder is read on the blocking pool so a
    /// slow filesystem never holds up the scheduler loop.
    pub fn full_range(&self, job: &Job) -> Option<tokio::task::JoinHandle<()>> {
        if job.recon_type != ReconType::Full || job.status != JobStatus::Completed {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        let sink = self.sink.clone();
        let mut update = StatusUpdate::for_job(job);
        let file_path = job.file_path.clone();
        Some(runtime.spawn_blocking(move || {
            let text = full_recon_status(&file_path);
            if text == update.text {
                return;
            }
            update.text = text;
            update.at = Utc::now();
            if let Err(e) = sink.on_status(&update) {
                tracing::debug!(job_id = %update.job_id, error = %e, "Slice range update dropped");
            }
        }))
    }

    pub fn batch(&self, event: &BatchEvent) {
        if let Err(e) = self.sink.on_batch(event) {
            tracing::debug!(error = %e, "Batch event dropped");
        }
    }
}

/// Sink that only writes to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn on_status(&self, update: &StatusUpdate) -> Result<(), SinkError> {
        tracing::info!(
            job_id = %update.job_id,
            file = %update.filename,
            color = update.color.color(),
            "{}",
            update.text
        );
        Ok(())
    }

    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError> {
        tracing::debug!(
            completed = progress.completed,
            total = progress.total,
            queued = progress.queue_depth,
            running = progress.running,
            percent = progress.percent(),
            "Batch progress"
        );
        Ok(())
    }

    fn on_batch(&self, event: &BatchEvent) -> Result<(), SinkError> {
        tracing::info!(event = ?event, "Batch event");
        Ok(())
    }
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    Job(StatusUpdate),
    Progress(Progress),
    Batch(BatchEvent),
}

/// Forwards every update into an unbounded channel, for UIs that render on
/// their own task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StatusEvent) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}

impl StatusSink for ChannelSink {
    fn on_status(&self, update: &StatusUpdate) -> Result<(), SinkError> {
        self.send(StatusEvent::Job(update.clone()))
    }

    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError> {
        self.send(StatusEvent::Progress(*progress))
    }

    fn on_batch(&self, event: &BatchEvent) -> Result<(), SinkError> {
        self.send(StatusEvent::Batch(event.clone()))
    }
}

/// Text shown for a job in its current state. Never touches the
/// filesystem; see [`Reporter::full_range`] for the slice range of a
/// finished full reconstruction.
pub fn status_text(job: &Job) -> String {
    match &job.status {
        JobStatus::Queued => "Queued".to_string(),
        JobStatus::Running { slot } => format!("Running on {}", slot),
        JobStatus::Completed => match job.recon_type {
            ReconType::Try => "Done try".to_string(),
            ReconType::Full => FULL_DONE.to_string(),
        },
        JobStatus::Failed(FailureKind::SpawnFailed(_)) => "Failed to start".to_string(),
        JobStatus::Failed(_) => format!("{} Failed", job.recon_type.title()),
        JobStatus::Skipped(_) => "Skipped".to_string(),
        JobStatus::Cancelled => "Cancelled batch".to_string(),
    }
}

/// Output directory of a full reconstruction:
/// `<data_dir>_rec/<scan>_rec` for `<data_dir>/<scan>.h5`.
pub fn full_recon_dir(file_path: &Path) -> Option<PathBuf> {
    let parent = file_path.parent()?;
    let stem = file_path.file_stem()?.to_string_lossy();
    let mut rec_root = parent.as_os_str().to_owned();
    rec_root.push("_rec");
    Some(PathBuf::from(rec_root).join(format!("{}_rec", stem)))
}

const FULL_DONE: &str = "Done full";

/// `Full <first>-<last>` from the slice numbers of the written TIFF files,
/// or `Done full` when the output cannot be read. Blocking.
pub fn full_recon_status(file_path: &Path) -> String {
    const FALLBACK: &str = FULL_DONE;

    let Some(dir) = full_recon_dir(file_path) else {
        return FALLBACK.to_string();
    };
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return FALLBACK.to_string();
    };

    let mut stems: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "tiff"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    stems.sort();

    let slice_number = |stem: &String| stem.rsplit('_').next()?.parse::<u64>().ok();
    match (
        stems.first().and_then(slice_number),
        stems.last().and_then(slice_number),
    ) {
        (Some(first), Some(last)) => format!("Full {}-{}", first, last),
        _ => FALLBACK.to_string(),
    }
}
