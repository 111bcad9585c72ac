use std::collections::VecDeque;

use uuid::Uuid;

use crate::scheduler::job::Job;

/// Ordered backlog of jobs that have not been given a GPU slot yet.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail of the queue
    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Append a batch of jobs, preserving their order
    pub fn extend(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.jobs.extend(jobs);
    }

    /// Remove and return the oldest job
    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Remove every queued job, oldest first
    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    /// IDs of queued jobs in dispatch order
    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
