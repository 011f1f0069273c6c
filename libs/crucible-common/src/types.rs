use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A validated request to run untrusted code, as accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    pub session_id: String,
    #[serde(default)]
    pub tests: Vec<TestInput>,
}

/// One stdin feed for the submitted program. `is_public` is carried through
/// to the matching result untouched; downstream consumers decide visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInput {
    #[serde(default)]
    pub stdin: String,
    #[serde(default = "default_is_public")]
    pub is_public: bool,
}

fn default_is_public() -> bool {
    true
}

impl ExecutionRequest {
    /// Test cases in execution order. A request without explicit tests runs
    /// the program once with empty stdin.
    pub fn test_inputs(&self) -> Vec<TestInput> {
        if self.tests.is_empty() {
            vec![TestInput {
                stdin: String::new(),
                is_public: true,
            }]
        } else {
            self.tests.clone()
        }
    }
}

/// A queued unit of work plus its lifecycle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub request: ExecutionRequest,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn queued(request: ExecutionRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Lifecycle states of a job. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }

    /// Inverse of [`fmt::Display`], used when reading records back from
    /// storage.
    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "Queued" => Some(JobState::Queued),
            "Running" => Some(JobState::Running),
            "Completed" => Some(JobState::Completed),
            "Failed" => Some(JobState::Failed),
            "TimedOut" => Some(JobState::TimedOut),
            "Cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// The closed transition set. Everything not listed here is rejected by
    /// the store, which is what keeps double claims and post-terminal writes
    /// out of the system.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::TimedOut)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::TimedOut => "TimedOut",
            JobState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Verdict attached to an individual test case and to the submission overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Pending,
    Accepted,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
    Cancelled,
}

impl ExecStatus {
    /// The job state a submission with this overall verdict ends in.
    pub fn terminal_job_state(&self) -> JobState {
        match self {
            ExecStatus::TimeLimitExceeded => JobState::TimedOut,
            ExecStatus::InternalError => JobState::Failed,
            ExecStatus::Cancelled => JobState::Cancelled,
            _ => JobState::Completed,
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecStatus::Pending => "Pending",
            ExecStatus::Accepted => "Accepted",
            ExecStatus::CompileError => "CompileError",
            ExecStatus::RuntimeError => "RuntimeError",
            ExecStatus::TimeLimitExceeded => "TimeLimitExceeded",
            ExecStatus::MemoryLimitExceeded => "MemoryLimitExceeded",
            ExecStatus::InternalError => "InternalError",
            ExecStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one test case, normalized for callers.
///
/// Empty stderr is reported as `None`. An `Accepted` result always carries
/// `stdout` (possibly empty) and never a `message`; every other terminal
/// status carries a `message` describing what went wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecStatus,
    pub is_public: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    /// Exactly one of successful output or an error message is present.
    pub fn is_well_formed(&self) -> bool {
        match self.status {
            ExecStatus::Pending => true,
            ExecStatus::Accepted => self.stdout.is_some() && self.message.is_none(),
            _ => self.message.is_some(),
        }
    }
}

/// Raw, unjudged record of one program run inside the sandbox. The
/// aggregator turns this into an [`ExecutionResult`].
#[derive(Debug, Clone, Default)]
pub struct RawRunOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub compile_output: Option<String>,
    pub compile_failed: bool,
    pub wall_time_ms: u64,
    pub peak_memory_kb: Option<u64>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub cancelled: bool,
}

/// The durable record a caller polls for: overall verdict plus per-test
/// results. `runtime_ms` and `memory_kb` are maxima across test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub language: String,
    pub status: ExecStatus,
    pub runtime_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub score: Option<u32>,
    pub error: Option<String>,
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub results: Vec<ExecutionResult>,
}

impl Submission {
    /// Record for a job cancelled before any environment was provisioned.
    /// No test ever ran, so `results` stays empty.
    pub fn cancelled(job: &Job, event_id: Uuid) -> Self {
        Self {
            id: job.job_id,
            language: job.request.language.clone(),
            status: ExecStatus::Cancelled,
            runtime_ms: None,
            memory_kb: None,
            score: None,
            error: Some("cancelled before execution".to_string()),
            event_id,
            created_at: job.enqueued_at,
            results: Vec::new(),
        }
    }
}

/// Lifecycle notification published to the submitting session's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event_id: Uuid,
    pub job_id: Uuid,
    pub session_id: String,
    pub transition: Transition,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: Option<JobState>,
    pub to: JobState,
}

impl JobEvent {
    pub fn transition(job: &Job, from: Option<JobState>, to: JobState) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            job_id: job.job_id,
            session_id: job.request.session_id.clone(),
            transition: Transition { from, to },
            at: Utc::now(),
        }
    }
}
