use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ReconSettings, SchedulerConfig};
use crate::error::{BatchError, Result};
use crate::scheduler::job::{Job, JobStatus, Machine};
use crate::scheduler::run::{BatchRun, DispatchContext, RunSnapshot, StopReport};
use crate::status::{BatchEvent, Progress, Reporter, StatusSink};
use crate::worker::{
    CommandBuilder, LocalSupervisor, ProcessSupervisor, RemoteWrapper, SshWrapper,
    TomocupyCommandBuilder,
};

/// Messages handled by the scheduler task
enum SchedulerMessage {
    Submit {
        jobs: Vec<Job>,
        num_slots: usize,
        machine: String,
        response_tx: oneshot::Sender<Result<BatchHandle>>,
    },
    Stop {
        response_tx: oneshot::Sender<StopReport>,
    },
    Snapshot {
        response_tx: oneshot::Sender<SchedulerSnapshot>,
    },
}

/// Result of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchHandle {
    pub run_id: Uuid,
    /// True when the jobs joined a run that was already active
    pub merged: bool,
    /// Total jobs of the run after this submission
    pub total_jobs: usize,
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub active: bool,
    pub run: Option<RunSnapshot>,
}

/// Handle to the batch scheduler task.
///
/// The task exclusively owns the active run. Every handle method is a
/// request over a channel, so callers never touch the queue, slots or
/// running processes directly. The task exits, stopping any active run, on
/// [`BatchScheduler::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct BatchScheduler {
    message_tx: mpsc::Sender<SchedulerMessage>,
    active_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl BatchScheduler {
    /// Spawn the scheduler task. Must be called inside a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        builder: Arc<dyn CommandBuilder>,
        wrapper: Arc<dyn RemoteWrapper>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (message_tx, message_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (active_tx, active_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let actor = SchedulerActor {
            config,
            supervisor,
            builder,
            wrapper,
            reporter: Reporter::new(sink),
            run: None,
            active_tx,
            last_progress: None,
        };
        tokio::spawn(actor.run(message_rx, shutdown.clone()));

        Self {
            message_tx,
            active_rx,
            shutdown,
        }
    }

    /// Scheduler running `tomocupy` on this host, with remote jobs going
    /// through ssh.
    pub fn local(
        config: SchedulerConfig,
        settings: ReconSettings,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self::new(
            config,
            Arc::new(LocalSupervisor::new()),
            Arc::new(TomocupyCommandBuilder::new(settings)),
            Arc::new(SshWrapper::new()),
            sink,
        )
    }

    /// Start a run with `jobs`, or append them to the active run.
    ///
    /// `machine` is stamped on every job. `num_slots` only matters when a new
    /// run starts; the slot pool of an active run never changes.
    pub async fn submit(
        &self,
        jobs: Vec<Job>,
        num_slots: usize,
        machine: &str,
    ) -> Result<BatchHandle> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerMessage::Submit {
            jobs,
            num_slots,
            machine: machine.to_string(),
            response_tx,
        })
        .await?;
        response_rx
            .await
            .map_err(|_| BatchError::SchedulerUnavailable)?
    }

    /// Stop the active run. Returns once every running process has exited or
    /// been killed. A no-op when idle.
    pub async fn stop(&self) -> Result<StopReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerMessage::Stop { response_tx }).await?;
        response_rx
            .await
            .map_err(|_| BatchError::SchedulerUnavailable)
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerMessage::Snapshot { response_tx }).await?;
        response_rx
            .await
            .map_err(|_| BatchError::SchedulerUnavailable)
    }

    pub fn is_active(&self) -> bool {
        *self.active_rx.borrow()
    }

    /// Wait until no run is active.
    pub async fn wait_idle(&self) -> Result<()> {
        let mut active_rx = self.active_rx.clone();
        active_rx
            .wait_for(|active| !*active)
            .await
            .map(|_| ())
            .map_err(|_| BatchError::SchedulerUnavailable)
    }

    /// Stop any active run and end the scheduler task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.message_tx.closed().await;
    }

    async fn send(&self, message: SchedulerMessage) -> Result<()> {
        self.message_tx
            .send(message)
            .await
            .map_err(|_| BatchError::SchedulerUnavailable)
    }
}

/// The scheduler loop. Owns the active run.
struct SchedulerActor {
    config: SchedulerConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    builder: Arc<dyn CommandBuilder>,
    wrapper: Arc<dyn RemoteWrapper>,
    reporter: Reporter,
    run: Option<BatchRun>,
    active_tx: watch::Sender<bool>,
    last_progress: Option<Progress>,
}

impl SchedulerActor {
    async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<SchedulerMessage>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!("Batch scheduler started");

        loop {
            // Requests first, so a stop is seen before the next dispatch
            loop {
                match message_rx.try_recv() {
                    Ok(message) => self.handle(message).await,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.stop_run("all scheduler handles dropped").await;
                        return;
                    }
                }
            }

            if shutdown.is_cancelled() {
                self.stop_run("scheduler shutdown").await;
                break;
            }

            if self.step() {
                tokio::task::yield_now().await;
                continue;
            }

            let idle = self.run.is_none();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.stop_run("scheduler shutdown").await;
                    break;
                }
                message = message_rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        self.stop_run("all scheduler handles dropped").await;
                        break;
                    }
                },
                _ = tokio::time::sleep(self.config.poll_interval), if !idle => {}
            }
        }

        tracing::debug!("Batch scheduler exited");
    }

    async fn handle(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Submit {
                jobs,
                num_slots,
                machine,
                response_tx,
            } => {
                let result = self.submit(jobs, num_slots, &machine);
                let _ = response_tx.send(result);
            }
            SchedulerMessage::Stop { response_tx } => {
                let report = self.stop_run("stop requested").await;
                let _ = response_tx.send(report);
            }
            SchedulerMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(SchedulerSnapshot {
                    active: self.run.is_some(),
                    run: self.run.as_ref().map(BatchRun::snapshot),
                });
            }
        }
    }

    fn submit(&mut self, jobs: Vec<Job>, num_slots: usize, machine: &str) -> Result<BatchHandle> {
        if jobs.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        let machine = Machine::from_label(machine);
        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|mut job| {
                job.machine = machine.clone();
                job.status = JobStatus::Queued;
                job
            })
            .collect();
        let job_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();

        if let Some(run) = self.run.as_mut() {
            if num_slots != run.slot_count() as usize {
                tracing::info!(
                    run_id = %run.id(),
                    requested = num_slots,
                    slots = run.slot_count(),
                    "Ignoring GPU count of merged submission"
                );
            }
            for job in &jobs {
                self.reporter.job(job);
            }
            let added = jobs.len();
            let total = run.extend(jobs);
            tracing::info!(run_id = %run.id(), added, total, "Merged jobs into active batch");
            self.reporter.batch(&BatchEvent::Merged {
                run_id: run.id(),
                added,
                total,
            });
            let handle = BatchHandle {
                run_id: run.id(),
                merged: true,
                total_jobs: total,
                job_ids,
            };
            self.publish_progress();
            return Ok(handle);
        }

        let run = BatchRun::new(jobs, num_slots)?;
        for job in run.queued() {
            self.reporter.job(job);
        }
        tracing::info!(
            run_id = %run.id(),
            jobs = run.total(),
            slots = run.slot_count(),
            machine = %machine,
            "Batch started"
        );
        self.reporter.batch(&BatchEvent::Started {
            run_id: run.id(),
            total: run.total(),
            slots: run.slot_count(),
        });
        let handle = BatchHandle {
            run_id: run.id(),
            merged: false,
            total_jobs: run.total(),
            job_ids,
        };

        self.run = Some(run);
        self.last_progress = None;
        self.active_tx.send_replace(true);
        self.publish_progress();
        Ok(handle)
    }

    /// One dispatch and reap pass. Returns true if anything changed.
    fn step(&mut self) -> bool {
        let Some(run) = self.run.as_mut() else {
            return false;
        };

        let ctx = DispatchContext {
            supervisor: self.supervisor.as_ref(),
            builder: self.builder.as_ref(),
            wrapper: self.wrapper.as_ref(),
            reporter: &self.reporter,
        };
        let dispatched = run.dispatch(&ctx);
        let reaped = run.reap(&self.reporter);
        let drained = run.is_drained();

        if dispatched || reaped {
            self.publish_progress();
        }
        if drained {
            self.complete_run();
        }
        dispatched || reaped
    }

    fn complete_run(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        let summary = run.summary();
        tracing::info!(
            run_id = %run.id(),
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Batch complete"
        );
        self.reporter.progress(&run.progress());
        self.reporter.batch(&BatchEvent::Completed {
            run_id: run.id(),
            summary,
        });
        self.last_progress = None;
        self.active_tx.send_replace(false);
    }

    async fn stop_run(&mut self, reason: &str) -> StopReport {
        let Some(mut run) = self.run.take() else {
            tracing::debug!(reason, "Stop requested while idle");
            return StopReport::default();
        };

        tracing::info!(run_id = %run.id(), reason, "Stopping batch");
        // Processes that already exited keep their real outcome
        run.reap(&self.reporter);
        let report = run.cancel(self.config.stop_grace_period, &self.reporter).await;

        tracing::info!(
            run_id = %run.id(),
            cancelled_running = report.cancelled_running,
            cancelled_queued = report.cancelled_queued,
            force_killed = report.force_killed,
            "Batch stopped"
        );
        self.reporter.progress(&run.progress());
        self.reporter.batch(&BatchEvent::Stopped {
            run_id: run.id(),
            summary: run.summary(),
        });
        self.last_progress = None;
        self.active_tx.send_replace(false);
        report
    }

    fn publish_progress(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let progress = run.progress();
        if self.last_progress == Some(progress) {
            return;
        }
        tracing::debug!(
            run_id = %run.id(),
            completed = progress.completed,
            total = progress.total,
            queued = progress.queue_depth,
            running = progress.running,
            "Progress"
        );
        self.reporter.progress(&progress);
        self.last_progress = Some(progress);
    }
}
