//! GPU batch scheduling: jobs, the backlog, slot accounting and the loop
//! that ties them to process supervision.

pub mod job;
pub mod queue;
pub mod run;
pub mod runner;
pub mod slots;

pub use job::{ColorClass, CorMethod, FailureKind, Job, JobStatus, Machine, ReconType};
pub use queue::JobQueue;
pub use run::{BatchRun, RunSnapshot, StopReport};
pub use runner::{BatchHandle, BatchScheduler, SchedulerSnapshot};
pub use slots::{SlotId, SlotPool};
