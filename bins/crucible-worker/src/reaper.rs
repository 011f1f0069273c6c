//! Supervising reaper for work a crashed worker left behind.
//!
//! Two kinds of debris exist after a worker dies mid-job: the job record,
//! stuck in-flight forever, and the sandbox container, still holding its
//! resources. Each sweep settles the records first and then removes any
//! labelled container whose job is no longer running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::ListContainersOptions;
use bollard::Docker;
use chrono::Utc;
use crucible_common::queue::JobQueue;
use crucible_common::store::JobStore;
use crucible_common::types::{Job, JobEvent, JobState, Transition};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate;
use crate::docker::{remove_container, JOB_LABEL, MANAGED_LABEL};
use crate::notify;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reaper {
    docker: Docker,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    events: mpsc::Sender<JobEvent>,
    stale_after_ms: i64,
}

impl Reaper {
    pub fn new(
        docker: Docker,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        events: mpsc::Sender<JobEvent>,
        stale_after_ms: i64,
    ) -> Self {
        Self {
            docker,
            queue,
            store,
            events,
            stale_after_ms,
        }
    }

    /// Sweep periodically until shutdown. The first sweep runs immediately,
    /// which is what reclaims environments orphaned by a previous crash of
    /// this very process.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    async fn sweep(&self) {
        // Records first: a job failed here frees its container for removal
        // in the same sweep.
        let reclaimed =
            reap_stale_jobs(&self.queue, &self.store, &self.events, self.stale_after_ms).await;
        if reclaimed > 0 {
            info!(reclaimed, "settled stale jobs");
        }
        self.sweep_containers().await;
    }

    /// Remove every managed container whose job is not currently running.
    /// A running job's container belongs to a live worker and is skipped.
    async fn sweep_containers(&self) {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(err) => {
                warn!("could not list sandbox containers: {err}");
                return;
            }
        };

        for summary in containers {
            let Some(container_id) = summary.id else {
                continue;
            };
            let job_id = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_LABEL))
                .and_then(|raw| Uuid::parse_str(raw).ok());

            let live = match job_id {
                Some(job_id) => matches!(
                    self.store.get_job(job_id).await,
                    Ok(Some(job)) if job.state == JobState::Running
                ),
                // No readable job label: nothing owns this container.
                None => false,
            };
            if live {
                continue;
            }

            info!(container = %container_id, job_id = ?job_id, "removing orphaned sandbox container");
            remove_container(&self.docker, &container_id).await;
        }
    }
}

/// Settle every job whose claim went stale. A job that never left `Queued`
/// goes back on the queue; one stuck in `Running` is failed with a
/// submission, so its caller still gets a terminal answer.
pub async fn reap_stale_jobs(
    queue: &Arc<dyn JobQueue>,
    store: &Arc<dyn JobStore>,
    events: &mpsc::Sender<JobEvent>,
    stale_after_ms: i64,
) -> usize {
    let cutoff = Utc::now().timestamp_millis() - stale_after_ms;
    let stale = match store.stale_inflight(cutoff).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!("could not read in-flight jobs: {err}");
            return 0;
        }
    };

    let mut reclaimed = 0;
    for job_id in stale {
        let job = match store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Record expired; only the marker is left.
                clear_marker(store, job_id).await;
                continue;
            }
            Err(err) => {
                warn!(%job_id, "could not load stale job: {err}");
                continue;
            }
        };

        match job.state {
            JobState::Running => {
                if fail_lost_job(store, events, &job).await {
                    reclaimed += 1;
                }
                clear_marker(store, job_id).await;
            }
            JobState::Queued => {
                // The worker died between the queue pop and the running
                // transition. Nothing executed, so the job can safely go
                // around again.
                match queue.push(&job).await {
                    Ok(()) => {
                        info!(%job_id, "requeued job from a dead claim");
                        clear_marker(store, job_id).await;
                        reclaimed += 1;
                    }
                    Err(err) => warn!(%job_id, "could not requeue stale job: {err}"),
                }
            }
            _ => {
                // Terminal already; the worker died after finishing.
                clear_marker(store, job_id).await;
            }
        }
    }
    reclaimed
}

async fn fail_lost_job(
    store: &Arc<dyn JobStore>,
    events: &mpsc::Sender<JobEvent>,
    job: &Job,
) -> bool {
    match store
        .transition(job.job_id, JobState::Running, JobState::Failed)
        .await
    {
        Ok(true) => {}
        Ok(false) => return false,
        Err(err) => {
            warn!(job_id = %job.job_id, "could not fail lost job: {err}");
            return false;
        }
    }

    let event_id = Uuid::new_v4();
    let submission =
        aggregate::failed_submission(job, "worker lost while the job was running", event_id);
    if let Err(err) = store.put_submission(&submission).await {
        warn!(job_id = %job.job_id, "could not persist submission for lost job: {err}");
    }
    notify::emit(
        events,
        JobEvent {
            event_id,
            job_id: job.job_id,
            session_id: job.request.session_id.clone(),
            transition: Transition {
                from: Some(JobState::Running),
                to: JobState::Failed,
            },
            at: Utc::now(),
        },
    );
    info!(job_id = %job.job_id, "failed job from a dead worker");
    true
}

async fn clear_marker(store: &Arc<dyn JobStore>, job_id: Uuid) {
    if let Err(err) = store.clear_inflight(job_id).await {
        warn!(%job_id, "could not clear in-flight marker: {err}");
    }
}
