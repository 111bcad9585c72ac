//! State of one scheduling run and the steps the scheduler loop applies to it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::{FailureKind, Job, JobStatus};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::slots::{RunningJob, RunningSet, SlotId, SlotPool};
use crate::status::{BatchSummary, Progress, Reporter};
use crate::worker::{
    terminate_all, CommandBuilder, ProcessHandle, ProcessState, ProcessSupervisor, RemoteWrapper,
    StopOutcome,
};

/// Collaborators a dispatch step needs.
pub struct DispatchContext<'a> {
    pub supervisor: &'a dyn ProcessSupervisor,
    pub builder: &'a dyn CommandBuilder,
    pub wrapper: &'a dyn RemoteWrapper,
    pub reporter: &'a Reporter,
}

/// What a `Stop()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// `None` when no run was active
    pub run_id: Option<Uuid>,
    pub cancelled_running: usize,
    pub cancelled_queued: usize,
    /// Running processes that ignored the terminate request
    pub force_killed: usize,
}

impl StopReport {
    pub fn was_active(&self) -> bool {
        self.run_id.is_some()
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub slot_count: u32,
    pub total: usize,
    pub completed: usize,
    pub queued: Vec<Uuid>,
    pub running: BTreeMap<SlotId, Uuid>,
    pub free_slots: Vec<SlotId>,
    pub jobs: Vec<Job>,
    pub summary: BatchSummary,
    pub started_at: DateTime<Utc>,
}

/// One active run. Invariant: `completed + running + queued == total`.
#[derive(Debug)]
pub struct BatchRun {
    id: Uuid,
    queue: JobQueue,
    slots: SlotPool,
    running: RunningSet,
    total: usize,
    completed: usize,
    finished: Vec<Job>,
    summary: BatchSummary,
    started_at: DateTime<Utc>,
}

impl BatchRun {
    pub fn new(jobs: Vec<Job>, num_slots: usize) -> Result<Self> {
        if jobs.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        let capacity = match u32::try_from(num_slots) {
            Ok(n) if n > 0 => n,
            _ => return Err(BatchError::InvalidSlotCount(num_slots)),
        };

        let total = jobs.len();
        let mut queue = JobQueue::new();
        queue.extend(jobs);

        Ok(Self {
            id: Uuid::new_v4(),
            queue,
            slots: SlotPool::new(capacity),
            running: RunningSet::new(),
            total,
            completed: 0,
            finished: Vec::new(),
            summary: BatchSummary {
                total,
                ..BatchSummary::default()
            },
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.capacity()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn summary(&self) -> BatchSummary {
        self.summary
    }

    /// Append jobs to the backlog of the running batch. Returns the new total.
    pub fn extend(&mut self, jobs: Vec<Job>) -> usize {
        self.total += jobs.len();
        self.summary.total = self.total;
        self.queue.extend(jobs);
        self.total
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed,
            total: self.total,
            queue_depth: self.queue.len(),
            running: self.running.len(),
        }
    }

    pub fn queued(&self) -> impl Iterator<Item = &Job> {
        self.queue.iter()
    }

    /// Nothing queued and nothing running.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Fill free slots from the head of the queue. Returns true if any job
    /// left the queue.
    pub fn dispatch(&mut self, ctx: &DispatchContext<'_>) -> bool {
        let mut changed = false;

        while self.slots.has_free() && !self.queue.is_empty() {
            let Some(slot) = self.slots.acquire() else {
                break;
            };
            let Some(mut job) = self.queue.pop() else {
                self.slots.release(slot);
                break;
            };
            changed = true;

            let cor = match job.validated_cor() {
                Ok(cor) => cor,
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        job = %job.label(),
                        reason = %e,
                        "Skipping job"
                    );
                    self.slots.release(slot);
                    job.status = JobStatus::Skipped(e.to_string());
                    self.finish(job, ctx.reporter);
                    continue;
                }
            };

            let command = ctx.builder.build(&job, slot, cor);
            let command = ctx.wrapper.wrap(command, &job.machine);

            match ctx.supervisor.spawn(&command) {
                Ok(handle) => {
                    tracing::info!(
                        job_id = %job.id,
                        job = %job.label(),
                        slot = %slot,
                        machine = %job.machine,
                        pid = ?handle.pid(),
                        command = %command.to_shell_string(),
                        "Job started"
                    );
                    job.status = JobStatus::Running { slot };
                    job.started_at = Some(Utc::now());
                    ctx.reporter.job(&job);
                    let previous = self.running.insert(
                        slot,
                        RunningJob {
                            job,
                            handle,
                            started: Instant::now(),
                        },
                    );
                    if let Some(previous) = previous {
                        tracing::error!(
                            slot = %slot,
                            job_id = %previous.job.id,
                            "Slot was handed out while occupied"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        job = %job.label(),
                        slot = %slot,
                        error = %e,
                        "Failed to start job"
                    );
                    self.slots.release(slot);
                    job.status = JobStatus::Failed(FailureKind::SpawnFailed(e.to_string()));
                    self.finish(job, ctx.reporter);
                }
            }
        }

        changed
    }

    /// Collect every process whose exit is known. Returns true if any slot
    /// was freed.
    pub fn reap(&mut self, reporter: &Reporter) -> bool {
        let mut exited = Vec::new();
        for (slot, running) in self.running.iter_mut() {
            let state = running.handle.poll();
            if !state.is_running() {
                exited.push((*slot, state));
            }
        }

        let changed = !exited.is_empty();
        for (slot, state) in exited {
            let Some(running) = self.running.remove(slot) else {
                continue;
            };
            let elapsed = running.started.elapsed();
            let mut job = running.job;

            job.status = match state {
                ProcessState::Exited { code: Some(0), .. } => {
                    job.exit_code = Some(0);
                    tracing::info!(
                        job_id = %job.id,
                        job = %job.label(),
                        slot = %slot,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Job completed"
                    );
                    JobStatus::Completed
                }
                ProcessState::Exited {
                    code: Some(code), ..
                } => {
                    job.exit_code = Some(code);
                    tracing::warn!(
                        job_id = %job.id,
                        job = %job.label(),
                        slot = %slot,
                        exit_code = code,
                        "Job failed"
                    );
                    JobStatus::Failed(FailureKind::NonZeroExit(code))
                }
                ProcessState::Exited { code: None, signal } => {
                    let reason = match signal {
                        Some(sig) => format!("killed by signal {}", sig),
                        None => "exited without status".to_string(),
                    };
                    tracing::warn!(job_id = %job.id, job = %job.label(), slot = %slot, %reason, "Job failed");
                    JobStatus::Failed(FailureKind::Terminated(reason))
                }
                ProcessState::Unknown(reason) => {
                    tracing::warn!(job_id = %job.id, job = %job.label(), slot = %slot, %reason, "Lost track of job process");
                    JobStatus::Failed(FailureKind::Terminated(reason))
                }
                ProcessState::Running => continue,
            };

            self.slots.release(slot);
            self.finish(job, reporter);
        }

        changed
    }

    /// Terminate everything that runs, then cancel the backlog without
    /// consuming slots. Leaves the run drained.
    pub async fn cancel(&mut self, grace: Duration, reporter: &Reporter) -> StopReport {
        let mut report = StopReport {
            run_id: Some(self.id),
            ..StopReport::default()
        };

        let (entries, mut handles): (Vec<(SlotId, Job)>, Vec<Box<dyn ProcessHandle>>) = self
            .running
            .drain()
            .into_iter()
            .map(|(slot, running)| ((slot, running.job), running.handle))
            .unzip();

        let outcomes = terminate_all(&mut handles, grace).await;
        for ((slot, job), outcome) in entries.into_iter().zip(outcomes) {
            if outcome != StopOutcome::Graceful {
                report.force_killed += 1;
            }
            tracing::info!(job_id = %job.id, job = %job.label(), slot = %slot, outcome = ?outcome, "Job cancelled");
            self.slots.release(slot);
            self.cancel_job(job, reporter);
            report.cancelled_running += 1;
        }

        for job in self.queue.drain() {
            self.cancel_job(job, reporter);
            report.cancelled_queued += 1;
        }

        report
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let mut jobs: Vec<Job> = self.finished.clone();
        jobs.extend(self.running.jobs().cloned());
        jobs.extend(self.queue.iter().cloned());

        RunSnapshot {
            run_id: self.id,
            slot_count: self.slots.capacity(),
            total: self.total,
            completed: self.completed,
            queued: self.queue.ids(),
            running: self.running.job_ids(),
            free_slots: self.slots.free_slots(),
            jobs,
            summary: self.summary,
            started_at: self.started_at,
        }
    }

    fn cancel_job(&mut self, mut job: Job, reporter: &Reporter) {
        job.status = JobStatus::Cancelled;
        self.finish(job, reporter);
    }

    fn finish(&mut self, mut job: Job, reporter: &Reporter) {
        debug_assert!(job.status.is_terminal(), "finished job {} is not terminal", job.id);
        job.finished_at = Some(Utc::now());
        self.completed += 1;
        self.summary.record(&job.status);
        reporter.job(&job);
        // The slice range needs a directory scan, so it arrives as a later update
        reporter.full_range(&job);
        self.finished.push(job);
    }
}
