//! The execution pool: a fixed number of slots, each claiming jobs from the
//! queue and driving them through the sandbox to a terminal state.
//!
//! Every claimed job ends in exactly one terminal state with a persisted
//! submission, whatever the sandbox does. The store's compare-and-set
//! transition is what makes that hold under races with cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crucible_common::config::{LanguageSpec, SandboxConfig};
use crucible_common::queue::JobQueue;
use crucible_common::store::JobStore;
use crucible_common::types::{Job, JobEvent, JobState, RawRunOutput, Submission, Transition};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{self, ScorePolicy};
use crate::backoff::Backoff;
use crate::notify;
use crate::sandbox::{OutputCaps, Sandbox, SandboxError};

/// How long one claim call blocks before the slot re-checks shutdown.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed claim, so a dead queue is not hammered.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);
/// How often a running job's cancel flag is checked.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROVISION_BACKOFF_CEILING: Duration = Duration::from_secs(5);
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BASE: Duration = Duration::from_millis(200);
const PERSIST_CEILING: Duration = Duration::from_secs(2);

pub struct ExecutionPool {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    sandbox: Arc<dyn Sandbox>,
    score: Arc<dyn ScorePolicy>,
    events: mpsc::Sender<JobEvent>,
    config: Arc<SandboxConfig>,
    shutdown: watch::Receiver<bool>,
}

impl ExecutionPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        sandbox: Arc<dyn Sandbox>,
        score: Arc<dyn ScorePolicy>,
        events: mpsc::Sender<JobEvent>,
        config: Arc<SandboxConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            sandbox,
            score,
            events,
            config,
            shutdown,
        }
    }

    /// Run all slots until shutdown. Jobs already in flight finish; only
    /// claiming stops.
    pub async fn run(self: Arc<Self>) {
        let slots = self.config.max_concurrent_workers.max(1);
        info!(slots, "execution pool starting");
        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            handles.push(tokio::spawn(Arc::clone(&self).slot_loop(slot)));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!("execution slot panicked: {err}");
            }
        }
        info!("execution pool stopped");
    }

    async fn slot_loop(self: Arc<Self>, slot: usize) {
        debug!(slot, "slot started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // Claims use a short timeout instead of racing against the
            // shutdown signal; a job popped from the queue is never lost
            // to a dropped future.
            match self.queue.claim(CLAIM_TIMEOUT).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(err) => {
                    warn!(slot, "claim failed: {err}");
                    tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                }
            }
        }
        debug!(slot, "slot stopped");
    }

    /// Drive one claimed job to a terminal state. The in-flight marker
    /// brackets the whole attempt so the reaper can spot claims that died
    /// partway.
    async fn process(&self, job: Job) {
        let job_id = job.job_id;
        if let Err(err) = self
            .store
            .mark_inflight(job_id, Utc::now().timestamp_millis())
            .await
        {
            warn!(%job_id, "could not mark job in-flight: {err}");
        }

        self.execute(&job).await;

        if let Err(err) = self.store.clear_inflight(job_id).await {
            warn!(%job_id, "could not clear in-flight marker: {err}");
        }
    }

    async fn execute(&self, job: &Job) {
        let job_id = job.job_id;

        // A cancel that landed while the job sat in the queue wins before
        // any environment is provisioned.
        match self.store.cancel_requested(job_id).await {
            Ok(true) => {
                self.finish_cancelled_before_run(job).await;
                return;
            }
            Ok(false) => {}
            Err(err) => warn!(%job_id, "cancel check failed, proceeding: {err}"),
        }

        match self
            .store
            .transition(job_id, JobState::Queued, JobState::Running)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Lost the race: cancelled or claimed elsewhere after the
                // queue pop. Whoever won also finalizes the record.
                debug!(%job_id, "job no longer queued, skipping");
                return;
            }
            Err(err) => {
                error!(%job_id, "could not move job to running: {err}");
                return;
            }
        }
        notify::emit(
            &self.events,
            JobEvent::transition(job, Some(JobState::Queued), JobState::Running),
        );
        info!(%job_id, language = %job.request.language, "job started");

        let event_id = Uuid::new_v4();
        let submission = match self.config.language(&job.request.language) {
            Some(lang) => match self.run_sandbox(job, lang).await {
                Ok(outputs) => {
                    aggregate::submission(job, &outputs, lang, self.score.as_ref(), event_id)
                }
                Err(err) => {
                    error!(%job_id, "sandbox run failed: {err}");
                    aggregate::failed_submission(job, &err.to_string(), event_id)
                }
            },
            None => {
                // The gateway validates language at intake; hitting this
                // means the worker's config diverged from the gateway's.
                error!(%job_id, language = %job.request.language, "language not configured on this worker");
                aggregate::failed_submission(
                    job,
                    &format!(
                        "language {} is not configured on this worker",
                        job.request.language
                    ),
                    event_id,
                )
            }
        };

        let final_state = submission.status.terminal_job_state();

        // Submission first, then state: a caller that observes the terminal
        // state must be able to read the result.
        self.persist_with_retry(&submission).await;
        match self
            .store
            .transition(job_id, JobState::Running, final_state)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(%job_id, state = %final_state, "job was not running at completion"),
            Err(err) => error!(%job_id, "could not record terminal state: {err}"),
        }
        notify::emit(
            &self.events,
            JobEvent {
                event_id,
                job_id,
                session_id: job.request.session_id.clone(),
                transition: Transition {
                    from: Some(JobState::Running),
                    to: final_state,
                },
                at: Utc::now(),
            },
        );
        info!(
            %job_id,
            status = %submission.status,
            runtime_ms = ?submission.runtime_ms,
            "job finished"
        );
    }

    /// Finalize a job whose cancel flag was set before its container
    /// existed. Nothing ran, so the submission carries no results.
    async fn finish_cancelled_before_run(&self, job: &Job) {
        let job_id = job.job_id;
        match self
            .store
            .transition(job_id, JobState::Queued, JobState::Cancelled)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%job_id, "cancelled job already finalized elsewhere");
                return;
            }
            Err(err) => {
                error!(%job_id, "could not cancel queued job: {err}");
                return;
            }
        }
        let event = JobEvent::transition(job, Some(JobState::Queued), JobState::Cancelled);
        let submission = Submission::cancelled(job, event.event_id);
        self.persist_with_retry(&submission).await;
        notify::emit(&self.events, event);
        info!(%job_id, "job cancelled before execution");
    }

    /// Run the sandbox with provision retries, watching the cancel flag the
    /// whole time. The poller turns the stored flag into the watch signal
    /// the sandbox acts on.
    async fn run_sandbox(
        &self,
        job: &Job,
        lang: &LanguageSpec,
    ) -> Result<Vec<RawRunOutput>, SandboxError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_cancellation(
            Arc::clone(&self.store),
            job.job_id,
            cancel_tx,
        ));

        let caps = OutputCaps {
            stdout_bytes: self.config.stdout_cap_bytes,
            stderr_bytes: self.config.stderr_cap_bytes,
        };
        let attempts = self.config.provision_retries.max(1);
        let mut backoff = Backoff::new(self.config.provision_backoff, PROVISION_BACKOFF_CEILING);

        let result = loop {
            match self.sandbox.run(job, lang, caps, cancel_rx.clone()).await {
                Ok(outputs) => break Ok(outputs),
                Err(err) if err.is_retryable() && backoff.attempt + 1 < attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        job_id = %job.job_id,
                        attempt = backoff.attempt,
                        ?delay,
                        "provisioning failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        poller.abort();
        result
    }

    async fn persist_with_retry(&self, submission: &Submission) {
        let mut backoff = Backoff::new(PERSIST_BASE, PERSIST_CEILING);
        loop {
            match self.store.put_submission(submission).await {
                Ok(()) => return,
                Err(err) if backoff.attempt + 1 < PERSIST_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    warn!(id = %submission.id, ?delay, "submission persist failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // The job record still reaches a terminal state; only
                    // the detailed result is lost.
                    error!(id = %submission.id, "giving up on submission persist: {err}");
                    return;
                }
            }
        }
    }
}

/// Poll the store's cancel flag and flip the watch signal once it is set.
/// Exits when the flag fires or every receiver is gone.
async fn poll_cancellation(store: Arc<dyn JobStore>, job_id: Uuid, cancel: watch::Sender<bool>) {
    loop {
        tokio::select! {
            _ = cancel.closed() => return,
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
        }
        match store.cancel_requested(job_id).await {
            Ok(true) => {
                let _ = cancel.send(true);
                return;
            }
            Ok(false) => {}
            Err(err) => warn!(%job_id, "cancel poll failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use crucible_common::queue::MemoryQueue;
    use crucible_common::store::MemoryStore;
    use crucible_common::types::{ExecStatus, ExecutionRequest};
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;

    use crate::aggregate::NoScore;

    /// Replays a scripted sequence of sandbox outcomes.
    struct StubSandbox {
        script: Mutex<VecDeque<Result<Vec<RawRunOutput>, SandboxError>>>,
        calls: AtomicU32,
    }

    impl StubSandbox {
        fn with_script(script: Vec<Result<Vec<RawRunOutput>, SandboxError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn accepting() -> Arc<Self> {
            Self::with_script(vec![Ok(vec![ok_output()])])
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn run(
            &self,
            _job: &Job,
            _lang: &LanguageSpec,
            _caps: OutputCaps,
            _cancel: watch::Receiver<bool>,
        ) -> Result<Vec<RawRunOutput>, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(vec![ok_output()]))
        }
    }

    /// Blocks until the cancel signal flips, then reports the interrupted
    /// case.
    struct WaitForCancel;

    #[async_trait]
    impl Sandbox for WaitForCancel {
        async fn run(
            &self,
            _job: &Job,
            _lang: &LanguageSpec,
            _caps: OutputCaps,
            mut cancel: watch::Receiver<bool>,
        ) -> Result<Vec<RawRunOutput>, SandboxError> {
            while !*cancel.borrow() {
                if cancel.changed().await.is_err() {
                    break;
                }
            }
            Ok(vec![RawRunOutput {
                cancelled: true,
                ..Default::default()
            }])
        }
    }

    fn ok_output() -> RawRunOutput {
        RawRunOutput {
            exit_code: Some(0),
            stdout: "2\n".to_string(),
            wall_time_ms: 10,
            peak_memory_kb: Some(2_048),
            ..Default::default()
        }
    }

    fn make_job(language: &str) -> Job {
        Job::queued(ExecutionRequest {
            language: language.to_string(),
            code: "print(1+1)".to_string(),
            session_id: "session".to_string(),
            tests: vec![],
        })
    }

    fn test_config() -> Arc<SandboxConfig> {
        let spec: LanguageSpec = serde_json::from_str(
            r#"{
                "name": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": ["python3", "main.py"]
            }"#,
        )
        .unwrap();
        let mut config = SandboxConfig::with_languages(vec![spec]).unwrap();
        config.max_concurrent_workers = 2;
        config.provision_backoff = Duration::from_millis(10);
        Arc::new(config)
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStore>,
        events: mpsc::Receiver<JobEvent>,
        shutdown: watch::Sender<bool>,
        pool: JoinHandle<()>,
    }

    impl Harness {
        fn start(sandbox: Arc<dyn Sandbox>) -> Self {
            Self::start_with(sandbox, test_config())
        }

        fn start_with(sandbox: Arc<dyn Sandbox>, config: Arc<SandboxConfig>) -> Self {
            let queue = Arc::new(MemoryQueue::new());
            let store = Arc::new(MemoryStore::new());
            let (event_tx, events) = mpsc::channel(64);
            let (shutdown, shutdown_rx) = watch::channel(false);
            let pool = Arc::new(ExecutionPool::new(
                queue.clone() as Arc<dyn JobQueue>,
                store.clone() as Arc<dyn JobStore>,
                sandbox,
                Arc::new(NoScore),
                event_tx,
                config,
                shutdown_rx,
            ));
            let pool = tokio::spawn(pool.run());
            Harness {
                queue,
                store,
                events,
                shutdown,
                pool,
            }
        }

        async fn enqueue(&self, job: &Job) {
            self.store.put_job(job).await.unwrap();
            self.queue.push(job).await.unwrap();
        }

        async fn wait_for_state(&self, job_id: Uuid, state: JobState) -> Job {
            for _ in 0..500 {
                if let Some(job) = self.store.get_job(job_id).await.unwrap() {
                    if job.state == state {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job never reached {state}");
        }

        async fn wait_terminal(&self, job_id: Uuid) -> Job {
            for _ in 0..500 {
                if let Some(job) = self.store.get_job(job_id).await.unwrap() {
                    if job.state.is_terminal() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job never reached a terminal state");
        }

        async fn stop(mut self) -> Vec<JobEvent> {
            self.shutdown.send(true).unwrap();
            self.pool.await.unwrap();
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                seen.push(event);
            }
            seen
        }
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_to_completed_with_submission_and_events() {
        let sandbox = StubSandbox::accepting();
        let harness = Harness::start(sandbox.clone());
        let job = make_job("python");
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Completed);
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());

        let submission = harness
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .expect("submission persisted");
        assert_eq!(submission.status, ExecStatus::Accepted);
        assert_eq!(submission.results.len(), 1);
        assert_eq!(sandbox.calls(), 1);

        assert!(harness
            .store
            .stale_inflight(i64::MAX)
            .await
            .unwrap()
            .is_empty());

        let events = harness.stop().await;
        let transitions: Vec<_> = events
            .iter()
            .filter(|e| e.job_id == job.job_id)
            .map(|e| (e.transition.from, e.transition.to))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (Some(JobState::Queued), JobState::Running),
                (Some(JobState::Running), JobState::Completed),
            ]
        );
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event_id, submission.event_id);
        assert_eq!(terminal.session_id, "session");
    }

    #[tokio::test(start_paused = true)]
    async fn provision_failure_is_retried_until_it_succeeds() {
        let sandbox = StubSandbox::with_script(vec![
            Err(SandboxError::Provision("docker hiccup".to_string())),
            Ok(vec![ok_output()]),
        ]);
        let harness = Harness::start(sandbox.clone());
        let job = make_job("python");
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(sandbox.calls(), 2);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_provision_retries_fail_the_job() {
        let sandbox = StubSandbox::with_script(vec![
            Err(SandboxError::Provision("down".to_string())),
            Err(SandboxError::Provision("down".to_string())),
            Err(SandboxError::Provision("down".to_string())),
        ]);
        let harness = Harness::start(sandbox.clone());
        let job = make_job("python");
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(sandbox.calls(), 3);

        let submission = harness
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submission.status, ExecStatus::InternalError);
        assert!(submission.results.is_empty());
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crash_is_not_retried() {
        let sandbox =
            StubSandbox::with_script(vec![Err(SandboxError::Crash("oom in daemon".to_string()))]);
        let harness = Harness::start(sandbox.clone());
        let job = make_job("python");
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(sandbox.calls(), 1);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_claim_skips_the_sandbox() {
        let sandbox = StubSandbox::accepting();
        let harness = Harness::start(sandbox.clone());
        let job = make_job("python");
        harness.store.request_cancel(job.job_id).await.unwrap();
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Cancelled);
        assert_eq!(sandbox.calls(), 0);

        let submission = harness
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submission.status, ExecStatus::Cancelled);
        assert!(submission.results.is_empty());
        assert_eq!(
            submission.error.as_deref(),
            Some("cancelled before execution")
        );

        let events = harness.stop().await;
        let transitions: Vec<_> = events
            .iter()
            .map(|e| (e.transition.from, e.transition.to))
            .collect();
        assert_eq!(
            transitions,
            vec![(Some(JobState::Queued), JobState::Cancelled)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_run_interrupts_and_finalizes_as_cancelled() {
        let harness = Harness::start(Arc::new(WaitForCancel));
        let job = make_job("python");
        harness.enqueue(&job).await;

        harness.wait_for_state(job.job_id, JobState::Running).await;
        harness.store.request_cancel(job.job_id).await.unwrap();

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Cancelled);

        let submission = harness
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submission.status, ExecStatus::Cancelled);
        assert_eq!(submission.error.as_deref(), Some("cancelled while running"));
        assert!(submission.results.is_empty());
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_language_fails_without_touching_the_sandbox() {
        let sandbox = StubSandbox::accepting();
        let harness = Harness::start(sandbox.clone());
        let job = make_job("ruby");
        harness.enqueue(&job).await;

        let done = harness.wait_terminal(job.job_id).await;
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(sandbox.calls(), 0);

        let submission = harness
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submission.status, ExecStatus::InternalError);
        assert!(submission.error.as_deref().unwrap().contains("ruby"));
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_claiming_but_leaves_the_queue_intact() {
        let sandbox = StubSandbox::accepting();
        let harness = Harness::start(sandbox.clone());

        harness.shutdown.send(true).unwrap();
        harness.pool.await.unwrap();

        let job = make_job("python");
        harness.store.put_job(&job).await.unwrap();
        harness.queue.push(&job).await.unwrap();

        assert_eq!(harness.queue.depth().await.unwrap(), 1);
        assert_eq!(sandbox.calls(), 0);
        let stored = harness.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_process_jobs_concurrently() {
        let sandbox = StubSandbox::with_script(vec![
            Ok(vec![ok_output()]),
            Ok(vec![ok_output()]),
            Ok(vec![ok_output()]),
        ]);
        let harness = Harness::start(sandbox.clone());
        let jobs: Vec<Job> = (0..3).map(|_| make_job("python")).collect();
        for job in &jobs {
            harness.enqueue(job).await;
        }

        for job in &jobs {
            let done = harness.wait_terminal(job.job_id).await;
            assert_eq!(done.state, JobState::Completed);
        }
        assert_eq!(sandbox.calls(), 3);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_executes_jobs_in_queue_order() {
        let mut config = (*test_config()).clone();
        config.max_concurrent_workers = 1;
        let harness = Harness::start_with(StubSandbox::accepting(), Arc::new(config));

        let jobs: Vec<Job> = (0..3).map(|_| make_job("python")).collect();
        for job in &jobs {
            harness.enqueue(job).await;
        }
        for job in &jobs {
            harness.wait_terminal(job.job_id).await;
        }

        let events = harness.stop().await;
        let completed: Vec<Uuid> = events
            .iter()
            .filter(|e| e.transition.to == JobState::Completed)
            .map(|e| e.job_id)
            .collect();
        let expected: Vec<Uuid> = jobs.iter().map(|j| j.job_id).collect();
        assert_eq!(completed, expected);
    }

    /// Holds a slot long enough for overlap, counting how many runs are in
    /// flight at once.
    struct CountingSandbox {
        current: AtomicU32,
        max_seen: AtomicU32,
    }

    #[async_trait]
    impl Sandbox for CountingSandbox {
        async fn run(
            &self,
            _job: &Job,
            _lang: &LanguageSpec,
            _caps: OutputCaps,
            _cancel: watch::Receiver<bool>,
        ) -> Result<Vec<RawRunOutput>, SandboxError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![ok_output()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_never_exceed_the_slot_count() {
        let sandbox = Arc::new(CountingSandbox {
            current: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
        });
        let harness = Harness::start(sandbox.clone());

        let jobs: Vec<Job> = (0..5).map(|_| make_job("python")).collect();
        for job in &jobs {
            harness.enqueue(job).await;
        }
        for job in &jobs {
            let done = harness.wait_terminal(job.job_id).await;
            assert_eq!(done.state, JobState::Completed);
        }

        assert!(sandbox.max_seen.load(Ordering::SeqCst) <= 2);
        harness.stop().await;
    }
}
