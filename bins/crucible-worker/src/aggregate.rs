//! Turns raw sandbox output into normalized results and the final
//! submission record. Pure functions, no I/O: everything here is judged
//! from the raw run data and the language limits alone.

use crucible_common::config::LanguageSpec;
use crucible_common::types::{
    ExecStatus, ExecutionResult, Job, RawRunOutput, Submission, TestInput,
};
use uuid::Uuid;

/// External grading collaborator. The service computes no score itself; a
/// deployment plugs its own policy in here.
pub trait ScorePolicy: Send + Sync {
    fn score(&self, job: &Job, results: &[ExecutionResult]) -> Option<u32>;
}

/// Ungraded deployments: every submission's score stays empty.
pub struct NoScore;

impl ScorePolicy for NoScore {
    fn score(&self, _job: &Job, _results: &[ExecutionResult]) -> Option<u32> {
        None
    }
}

/// Verdict for a single run, in strict precedence order: compilation
/// failure first, then timeout, then memory (which overrides a bare
/// non-zero exit), then runtime error, then accepted.
pub fn case_status(raw: &RawRunOutput, lang: &LanguageSpec) -> ExecStatus {
    if raw.compile_failed {
        return ExecStatus::CompileError;
    }
    if raw.timed_out {
        return ExecStatus::TimeLimitExceeded;
    }
    let over_cap = raw
        .peak_memory_kb
        .is_some_and(|kb| kb >= lang.memory_limit_kb);
    if raw.oom_killed || over_cap {
        return ExecStatus::MemoryLimitExceeded;
    }
    match raw.exit_code {
        Some(0) => ExecStatus::Accepted,
        _ => ExecStatus::RuntimeError,
    }
}

/// Normalize one raw run into the result callers see.
pub fn case_result(raw: &RawRunOutput, lang: &LanguageSpec, test: &TestInput) -> ExecutionResult {
    let status = case_status(raw, lang);

    // Accepted always carries stdout, even an empty one; elsewhere empty
    // streams collapse to None.
    let stdout = if status == ExecStatus::Accepted {
        Some(raw.stdout.clone())
    } else {
        none_if_empty(&raw.stdout)
    };
    let stderr = none_if_empty(&raw.stderr);

    let message = match status {
        ExecStatus::Accepted => None,
        ExecStatus::CompileError => Some("compilation failed".to_string()),
        ExecStatus::TimeLimitExceeded => Some(format!(
            "wall clock limit of {}ms exceeded",
            lang.time_limit_ms
        )),
        ExecStatus::MemoryLimitExceeded => Some(format!(
            "memory limit of {}kB exceeded",
            lang.memory_limit_kb
        )),
        ExecStatus::RuntimeError => Some(match raw.exit_code {
            Some(code) => format!("program exited with code {code}"),
            None => "program terminated abnormally".to_string(),
        }),
        _ => Some(status.to_string()),
    };

    // The program never ran when compilation failed, so there is no
    // meaningful time or memory to report.
    let (time_ms, memory_kb) = if status == ExecStatus::CompileError {
        (None, None)
    } else {
        (Some(raw.wall_time_ms), raw.peak_memory_kb)
    };

    ExecutionResult {
        status,
        is_public: test.is_public,
        stdout,
        stderr,
        compile_output: raw.compile_output.clone(),
        message,
        time_ms,
        memory_kb,
        truncated: raw.stdout_truncated || raw.stderr_truncated,
    }
}

/// Build the submission for a job whose sandbox run completed (which
/// includes runs cut short by timeout, OOM or cancellation).
pub fn submission(
    job: &Job,
    outputs: &[RawRunOutput],
    lang: &LanguageSpec,
    policy: &dyn ScorePolicy,
    event_id: Uuid,
) -> Submission {
    let was_cancelled = outputs.iter().any(|o| o.cancelled);

    // A case interrupted by cancellation never produced a judgeable run;
    // only the completed ones are reported.
    let tests = job.request.test_inputs();
    let results: Vec<ExecutionResult> = outputs
        .iter()
        .zip(tests.iter())
        .filter(|(raw, _)| !raw.cancelled)
        .map(|(raw, test)| case_result(raw, lang, test))
        .collect();

    let status = if was_cancelled {
        ExecStatus::Cancelled
    } else if results.is_empty() {
        // The sandbox reported success but ran nothing.
        ExecStatus::InternalError
    } else {
        // The first non-accepted case names the submission.
        results
            .iter()
            .map(|r| r.status)
            .find(|s| *s != ExecStatus::Accepted)
            .unwrap_or(ExecStatus::Accepted)
    };

    let error = match status {
        ExecStatus::Accepted => None,
        ExecStatus::Cancelled => Some("cancelled while running".to_string()),
        ExecStatus::InternalError => Some("no test case was executed".to_string()),
        _ => results
            .iter()
            .find(|r| r.status == status)
            .and_then(|r| r.message.clone()),
    };

    let score = policy.score(job, &results);

    Submission {
        id: job.job_id,
        language: job.request.language.clone(),
        status,
        runtime_ms: results.iter().filter_map(|r| r.time_ms).max(),
        memory_kb: results.iter().filter_map(|r| r.memory_kb).max(),
        score,
        error,
        event_id,
        created_at: job.enqueued_at,
        results,
    }
}

/// Build the submission for a job the sandbox could not run at all:
/// provisioning exhausted its retries, or the environment crashed.
pub fn failed_submission(job: &Job, reason: &str, event_id: Uuid) -> Submission {
    Submission {
        id: job.job_id,
        language: job.request.language.clone(),
        status: ExecStatus::InternalError,
        runtime_ms: None,
        memory_kb: None,
        score: None,
        error: Some(reason.to_string()),
        event_id,
        created_at: job.enqueued_at,
        results: Vec::new(),
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
