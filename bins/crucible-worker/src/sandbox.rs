use async_trait::async_trait;
use crucible_common::config::LanguageSpec;
use crucible_common::types::{Job, RawRunOutput};
use thiserror::Error;
use tokio::sync::watch;

/// Byte caps applied to each captured output stream. Anything past the cap
/// is dropped and the truncation is recorded on the raw output.
#[derive(Debug, Clone, Copy)]
pub struct OutputCaps {
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The environment could not be created or started. Transient by
    /// nature, so the pool retries these with backoff.
    #[error("failed to provision execution environment: {0}")]
    Provision(String),
    /// The environment died abnormally mid-run. Not retried.
    #[error("execution environment crashed: {0}")]
    Crash(String),
    /// Anything else: oversized input, misconfiguration, bugs.
    #[error("sandbox failure: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Provision(_))
    }
}

/// An isolation backend that runs one job in a fresh, disposable
/// environment.
///
/// Contract:
/// - every call provisions a new environment; nothing is shared between
///   jobs, not even for the same session
/// - the environment is destroyed before `run` returns, on success and on
///   every error path
/// - a flipped `cancel` signal stops execution and still tears down
/// - one `RawRunOutput` per executed test case, in order; a timeout,
///   OOM kill or cancellation ends the run early, so the vector may be
///   shorter than the request's test list
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        lang: &LanguageSpec,
        caps: OutputCaps,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<RawRunOutput>, SandboxError>;
}
