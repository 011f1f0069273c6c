//! HTTP intake for the sandbox service: submission, result polling and
//! cancellation. Handlers stay thin; the decisions live in [`submit_job`]
//! and [`request_cancellation`] so they can be tested without a server.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use crucible_common::error::{CancelError, SubmitError};
use crucible_common::events::EventSink;
use crucible_common::queue::JobQueue;
use crucible_common::store::JobStore;
use crucible_common::types::{ExecutionRequest, Job, JobEvent, JobState, Submission};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// POST /execute - accept a job and return its id without waiting for
/// execution.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecutionRequest>,
) -> Response {
    match submit_job(&state, request).await {
        Ok(job) => {
            metrics::SUBMISSIONS_TOTAL
                .with_label_values(&[&job.request.language])
                .inc();
            (StatusCode::CREATED, Json(json!({ "jobId": job.job_id }))).into_response()
        }
        Err(SubmitError::UnsupportedLanguage(language)) => {
            metrics::INTAKE_REJECTIONS_TOTAL
                .with_label_values(&["unsupported_language"])
                .inc();
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": "UnsupportedLanguage",
                    "error": format!("language '{language}' is not supported"),
                    "supported": state.config.supported(),
                })),
            )
                .into_response()
        }
        Err(SubmitError::QueueSaturated { depth, max }) => {
            metrics::INTAKE_REJECTIONS_TOTAL
                .with_label_values(&["queue_saturated"])
                .inc();
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "code": "QueueSaturated",
                    "error": format!("queue is at capacity ({depth}/{max})"),
                })),
            )
                .into_response()
        }
        Err(err) => {
            error!("submission failed: {err}");
            internal_error()
        }
    }
}

/// Validate, persist and enqueue one request. The job record is written
/// before the queue entry so a worker's claim can never observe a missing
/// record.
pub async fn submit_job(state: &AppState, request: ExecutionRequest) -> Result<Job, SubmitError> {
    if !state.config.is_supported(&request.language) {
        return Err(SubmitError::UnsupportedLanguage(request.language));
    }
    if let Some(max) = state.config.max_queue_depth {
        let depth = state.queue.depth().await?;
        if depth >= max {
            return Err(SubmitError::QueueSaturated { depth, max });
        }
    }

    let job = Job::queued(request);
    state.store.put_job(&job).await?;
    state.queue.push(&job).await?;
    info!(
        job_id = %job.job_id,
        language = %job.request.language,
        tests = job.request.test_inputs().len(),
        "job queued"
    );

    publish_event(state, JobEvent::transition(&job, None, JobState::Queued));
    Ok(job)
}

/// GET /submissions/:job_id - the terminal result, or 202 while the job is
/// still moving.
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return invalid_job_id();
    };

    match state.store.get_submission(job_id).await {
        Ok(Some(submission)) => (StatusCode::OK, Json(submission)).into_response(),
        Ok(None) => pending_or_missing(&state, job_id).await,
        Err(err) => {
            error!(%job_id, "submission lookup failed: {err}");
            internal_error()
        }
    }
}

async fn pending_or_missing(state: &AppState, job_id: Uuid) -> Response {
    match state.store.get_job(job_id).await {
        Ok(Some(job)) if !job.state.is_terminal() => (
            StatusCode::ACCEPTED,
            Json(json!({
                "jobId": job_id,
                "state": job.state.to_string(),
                "message": "job has not finished yet",
            })),
        )
            .into_response(),
        Ok(Some(job)) => {
            // Terminal without a submission means the worker's persist was
            // lost.
            error!(%job_id, state = %job.state, "terminal job has no submission");
            internal_error()
        }
        Ok(None) => job_not_found(),
        Err(err) => {
            error!(%job_id, "job lookup failed: {err}");
            internal_error()
        }
    }
}

/// DELETE /jobs/:job_id - cancel a queued or running job.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let Ok(job_id) = Uuid::parse_str(&job_id) else {
        return invalid_job_id();
    };

    match request_cancellation(&state, job_id).await {
        Ok(outcome) => {
            metrics::CANCELLATIONS_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();
            match outcome {
                CancelOutcome::NotFound => job_not_found(),
                CancelOutcome::AlreadyTerminal(state) => (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": "job already finished",
                        "state": state.to_string(),
                    })),
                )
                    .into_response(),
                CancelOutcome::CancelledWhileQueued => (
                    StatusCode::OK,
                    Json(json!({ "jobId": job_id, "outcome": "cancelled" })),
                )
                    .into_response(),
                CancelOutcome::SignalledRunning => (
                    StatusCode::ACCEPTED,
                    Json(json!({ "jobId": job_id, "outcome": "cancelling" })),
                )
                    .into_response(),
            }
        }
        Err(err) => {
            error!(%job_id, "cancellation failed: {err}");
            internal_error()
        }
    }
}

/// How a cancellation request landed relative to the job's progress.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal(JobState),
    /// Finalized before any worker claimed it; nothing ever ran.
    CancelledWhileQueued,
    /// A worker owns the job; it was signalled to stop.
    SignalledRunning,
}

impl CancelOutcome {
    fn label(&self) -> &'static str {
        match self {
            CancelOutcome::NotFound => "not_found",
            CancelOutcome::AlreadyTerminal(_) => "already_terminal",
            CancelOutcome::CancelledWhileQueued => "cancelled_queued",
            CancelOutcome::SignalledRunning => "signalled_running",
        }
    }
}

/// Cancel a job wherever it currently is. A still-queued job is removed
/// and finalized here; a claimed one is flagged for its worker to stop.
pub async fn request_cancellation(
    state: &AppState,
    job_id: Uuid,
) -> Result<CancelOutcome, CancelError> {
    let Some(job) = state.store.get_job(job_id).await? else {
        return Ok(CancelOutcome::NotFound);
    };
    if job.state.is_terminal() {
        return Ok(CancelOutcome::AlreadyTerminal(job.state));
    }

    if job.state == JobState::Queued {
        let removed = state.queue.remove(job_id).await?;
        let finalized = state
            .store
            .transition(job_id, JobState::Queued, JobState::Cancelled)
            .await?;
        if finalized {
            let event = JobEvent::transition(&job, Some(JobState::Queued), JobState::Cancelled);
            let submission = Submission::cancelled(&job, event.event_id);
            state.store.put_submission(&submission).await?;
            publish_event(state, event);
            info!(%job_id, removed_from_queue = removed, "job cancelled before execution");
            return Ok(CancelOutcome::CancelledWhileQueued);
        }
        // A worker won the claim between our lookup and the transition;
        // treat the job as running.
    }

    // The job may have finished while we raced it.
    if let Some(job) = state.store.get_job(job_id).await? {
        if job.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.state));
        }
    }
    state.store.request_cancel(job_id).await?;
    info!(%job_id, "cancellation signalled to the owning worker");
    Ok(CancelOutcome::SignalledRunning)
}

/// GET /healthz
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics
pub async fn serve_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("metrics encoding failed: {err}");
            internal_error()
        }
    }
}

/// Publish without blocking the request path. A failed publish is logged
/// and abandoned; the submission record stays the source of truth.
fn publish_event(state: &AppState, event: JobEvent) {
    let events = Arc::clone(&state.events);
    tokio::spawn(async move {
        if let Err(err) = events.publish(&event).await {
            warn!(event_id = %event.event_id, "event publish failed: {err}");
        }
    });
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

fn invalid_job_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid job id" })),
    )
        .into_response()
}

fn job_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown job" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use crucible_common::config::{LanguageSpec, SandboxConfig};
    use crucible_common::error::PublishError;
    use crucible_common::queue::MemoryQueue;
    use crucible_common::store::MemoryStore;
    use crucible_common::types::ExecStatus;
    use tokio::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<JobEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct Fixture {
        state: Arc<AppState>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(max_queue_depth: Option<usize>) -> Fixture {
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
        config.max_queue_depth = max_queue_depth;

        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let state = Arc::new(AppState {
            queue: Arc::new(MemoryQueue::new()),
            store: Arc::new(MemoryStore::new()),
            events: sink.clone(),
            config: Arc::new(config),
        });
        Fixture { state, sink }
    }

    fn make_request(language: &str) -> ExecutionRequest {
        ExecutionRequest {
            language: language.to_string(),
            code: "print(1+1)".to_string(),
            session_id: "session".to_string(),
            tests: vec![],
        }
    }

    /// Let spawned publish tasks run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn submit_queues_job_and_publishes_queued_event() {
        let fx = fixture(None);
        let job = submit_job(&fx.state, make_request("python")).await.unwrap();

        assert_eq!(fx.state.queue.depth().await.unwrap(), 1);
        let stored = fx.state.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);

        settle().await;
        let events = fx.sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, job.job_id);
        assert_eq!(events[0].transition.from, None);
        assert_eq!(events[0].transition.to, JobState::Queued);
        assert_eq!(events[0].session_id, "session");
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejects_unknown_language_before_enqueue() {
        let fx = fixture(None);
        let err = submit_job(&fx.state, make_request("cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnsupportedLanguage(l) if l == "cobol"));
        assert_eq!(fx.state.queue.depth().await.unwrap(), 0);
        settle().await;
        assert!(fx.sink.events.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejects_when_queue_is_full() {
        let fx = fixture(Some(2));
        submit_job(&fx.state, make_request("python")).await.unwrap();
        submit_job(&fx.state, make_request("python")).await.unwrap();

        let err = submit_job(&fx.state, make_request("python"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::QueueSaturated { depth: 2, max: 2 }
        ));
        assert_eq!(fx.state.queue.depth().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_job_is_not_found() {
        let fx = fixture(None);
        let outcome = request_cancellation(&fx.state, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_job_finalizes_it_without_execution() {
        let fx = fixture(None);
        let job = submit_job(&fx.state, make_request("python")).await.unwrap();

        let outcome = request_cancellation(&fx.state, job.job_id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::CancelledWhileQueued);

        assert_eq!(fx.state.queue.depth().await.unwrap(), 0);
        let stored = fx.state.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Cancelled);

        let submission = fx
            .state
            .store
            .get_submission(job.job_id)
            .await
            .unwrap()
            .expect("cancelled job still gets a submission");
        assert_eq!(submission.status, ExecStatus::Cancelled);
        assert!(submission.results.is_empty());

        settle().await;
        let events = fx.sink.events.lock().await;
        let last = events.last().unwrap();
        assert_eq!(last.transition.from, Some(JobState::Queued));
        assert_eq!(last.transition.to, JobState::Cancelled);
        assert_eq!(last.event_id, submission.event_id);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_job_signals_the_worker() {
        let fx = fixture(None);
        let job = submit_job(&fx.state, make_request("python")).await.unwrap();
        fx.state
            .store
            .transition(job.job_id, JobState::Queued, JobState::Running)
            .await
            .unwrap();

        let outcome = request_cancellation(&fx.state, job.job_id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::SignalledRunning);
        assert!(fx.state.store.cancel_requested(job.job_id).await.unwrap());

        // The record is untouched; the worker finalizes it.
        let stored = fx.state.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_finished_job_reports_conflict() {
        let fx = fixture(None);
        let job = submit_job(&fx.state, make_request("python")).await.unwrap();
        fx.state
            .store
            .transition(job.job_id, JobState::Queued, JobState::Running)
            .await
            .unwrap();
        fx.state
            .store
            .transition(job.job_id, JobState::Running, JobState::Completed)
            .await
            .unwrap();

        let outcome = request_cancellation(&fx.state, job.job_id).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyTerminal(JobState::Completed)
        );
        assert!(!fx.state.store.cancel_requested(job.job_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_handler_returns_created_with_job_id() {
        let fx = fixture(None);
        let response = submit(
            State(fx.state.clone()),
            Json(make_request("python")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("jobId").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_handler_maps_unsupported_language_to_bad_request() {
        let fx = fixture(None);
        let response = submit(State(fx.state.clone()), Json(make_request("cobol"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "UnsupportedLanguage");
        assert_eq!(value["supported"], serde_json::json!(["python"]));
    }

    #[tokio::test(start_paused = true)]
    async fn get_submission_reports_progress_then_result() {
        let fx = fixture(None);
        let job = submit_job(&fx.state, make_request("python")).await.unwrap();

        let response =
            get_submission(State(fx.state.clone()), Path(job.job_id.to_string())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = get_submission(State(fx.state.clone()), Path(Uuid::new_v4().to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get_submission(State(fx.state.clone()), Path("not-a-uuid".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
