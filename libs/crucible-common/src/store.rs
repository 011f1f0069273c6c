use crate::error::StoreError;
use crate::types::{Job, JobState, Submission};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable job and submission records.
///
/// `transition` is the concurrency primitive of the whole service: it moves
/// a job from `from` to `to` only if it is still in `from`, so two workers
/// racing for the same job resolve to exactly one winner.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Compare-and-set state change. Stamps `started_at` when entering
    /// `Running` and `finished_at` when entering a terminal state. Returns
    /// `false` when the job is missing, not in `from`, or the transition is
    /// not allowed.
    async fn transition(&self, job_id: Uuid, from: JobState, to: JobState)
        -> Result<bool, StoreError>;

    /// Flag a job for cancellation. Workers poll this while the job runs.
    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn get_submission(&self, job_id: Uuid) -> Result<Option<Submission>, StoreError>;

    /// Record that a worker claimed the job at `claimed_at_ms` (epoch ms).
    async fn mark_inflight(&self, job_id: Uuid, claimed_at_ms: i64) -> Result<(), StoreError>;

    async fn clear_inflight(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Jobs claimed before `claimed_before_ms` and never cleared. These are
    /// the candidates for the stale-job reaper.
    async fn stale_inflight(&self, claimed_before_ms: i64) -> Result<Vec<Uuid>, StoreError>;
}

/// In-process store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    submissions: Mutex<HashMap<Uuid, Submission>>,
    cancels: Mutex<HashSet<Uuid>>,
    inflight: Mutex<HashMap<Uuid, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.state != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        job.state = to;
        let now = Utc::now();
        if to == JobState::Running {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.cancels.lock().await.insert(job_id);
        Ok(())
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.cancels.lock().await.contains(&job_id))
    }

    async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        self.submissions
            .lock()
            .await
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_submission(&self, job_id: Uuid) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions.lock().await.get(&job_id).cloned())
    }

    async fn mark_inflight(&self, job_id: Uuid, claimed_at_ms: i64) -> Result<(), StoreError> {
        self.inflight.lock().await.insert(job_id, claimed_at_ms);
        Ok(())
    }

    async fn clear_inflight(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.inflight.lock().await.remove(&job_id);
        Ok(())
    }

    async fn stale_inflight(&self, claimed_before_ms: i64) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .inflight
            .lock()
            .await
            .iter()
            .filter(|(_, claimed_at)| **claimed_at < claimed_before_ms)
            .map(|(id, _)| *id)
            .collect())
    }
}
