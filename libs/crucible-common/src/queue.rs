use crate::error::QueueError;
use crate::types::Job;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// FIFO job queue between the gateway and the worker pool.
///
/// `claim` hands each job to exactly one caller; a claimed job is gone from
/// the queue and will not be seen by another worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job at the tail.
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Take the oldest job, waiting up to `timeout` for one to appear.
    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Remove a still-queued job before any worker claims it. Returns
    /// whether an entry was actually removed.
    async fn remove(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Number of jobs currently waiting.
    async fn depth(&self) -> Result<usize, QueueError>;
}

/// In-process queue for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().await.push_back(job.clone());
        self.ready.notify_one();
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.lock().await.pop_front() {
                return Ok(Some(job));
            }
            let ready = self.ready.notified();
            tokio::select! {
                _ = ready => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| job.job_id != job_id);
        Ok(jobs.len() < before)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.lock().await.len())
    }
}
