use crate::sandbox::{OutputCaps, Sandbox, SandboxError};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use crucible_common::config::LanguageSpec;
use crucible_common::types::{Job, RawRunOutput, TestInput};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Safety limits applied before anything reaches Docker.
const MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Label marking containers owned by this service. The reaper sweeps by it.
pub const MANAGED_LABEL: &str = "crucible.managed";
/// Label carrying the job id a container belongs to.
pub const JOB_LABEL: &str = "crucible.job";

const SANDBOX_WORKDIR: &str = "/sandbox";
/// Compilation gets its own fixed budget, independent of the per-test limit.
const COMPILE_TIMEOUT: Duration = Duration::from_secs(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Caps for internal plumbing execs (source write), not user output.
const INTERNAL_CAPS: OutputCaps = OutputCaps {
    stdout_bytes: 4096,
    stderr_bytes: 4096,
};

/// Output buffer with a hard byte cap, cut at a char boundary. Shared
/// between the stream collector and the kill path so partial output
/// survives a timeout or cancellation.
struct CapturedStream {
    data: String,
    cap: usize,
    truncated: bool,
}

impl CapturedStream {
    fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let text = String::from_utf8_lossy(chunk);
        let remaining = self.cap.saturating_sub(self.data.len());
        if text.len() <= remaining {
            self.data.push_str(&text);
        } else {
            let mut end = remaining;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            self.data.push_str(&text[..end]);
            self.truncated = true;
        }
    }
}

/// Result of one exec inside the container, before any judging.
struct ExecOutcome {
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    timed_out: bool,
    cancelled: bool,
    wall_time_ms: u64,
}

/// Removes the container no matter how the run ends. The normal paths call
/// `teardown` and await it; `Drop` only covers panics and task abort, where
/// the removal has to be spawned.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    async fn teardown(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            remove_container(&docker, &container_id).await;
        });
    }
}

pub(crate) async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_id, Some(options)).await {
        warn!(container_id, error = %e, "failed to remove container");
    }
}

fn shell(command: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
}

fn sh_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "./_-=+:".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Docker-backed isolation. One fresh container per job: no network, capped
/// memory, CPU and pids, destroyed unconditionally when the run ends.
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Provision(format!("cannot reach Docker daemon: {e}")))?;
        Ok(Self { docker })
    }

    /// A handle for auxiliary consumers (the orphan reaper).
    pub fn handle(&self) -> Docker {
        self.docker.clone()
    }

    /// Verify the image exists locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image cache hit");
            return Ok(());
        }

        warn!(image, "image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Provision(format!("failed to pull {image}: {e}")))?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn create_container(
        &self,
        job: &Job,
        lang: &LanguageSpec,
    ) -> Result<String, SandboxError> {
        let name = format!("crucible-{}", Uuid::new_v4());
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(JOB_LABEL.to_string(), job.job_id.to_string());

        let config = Config {
            image: Some(lang.image.clone()),
            // Keep-alive shell; all real work happens through execs.
            cmd: Some(shell("sleep 900")),
            // Images may ship their own entrypoint; neutralize it.
            entrypoint: Some(vec![]),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            network_disabled: Some(true),
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                memory: Some((lang.memory_limit_kb * 1024) as i64),
                nano_cpus: Some((lang.cpu_limit * 1_000_000_000.0) as i64),
                pids_limit: Some(lang.pids_limit),
                // The workdir must accept the source write.
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Provision(format!("failed to create container: {e}")))?;
        Ok(created.id)
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id, error = %e, "failed to kill container");
        }
    }

    async fn was_oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Run one command inside the container, streaming its output into
    /// capped buffers. Kills the whole container when the deadline passes
    /// or cancellation fires; the partial output collected so far is kept.
    async fn exec_capture(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        caps: OutputCaps,
        deadline: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ExecOutcome, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(SANDBOX_WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Crash(format!("failed to create exec: {e}")))?;

        let started = Instant::now();
        let attached = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Crash(format!("failed to start exec: {e}")))?;
        let StartExecResults::Attached { mut output, .. } = attached else {
            return Err(SandboxError::Crash("exec did not attach".to_string()));
        };

        let stdout = Arc::new(Mutex::new(CapturedStream::new(caps.stdout_bytes)));
        let stderr = Arc::new(Mutex::new(CapturedStream::new(caps.stderr_bytes)));

        let collector = {
            let stdout = Arc::clone(&stdout);
            let stderr = Arc::clone(&stderr);
            async move {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.lock().await.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.lock().await.push(&message),
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "exec stream ended early");
                            break;
                        }
                    }
                }
            }
        };

        let mut timed_out = false;
        let mut cancelled = false;
        tokio::select! {
            _ = collector => {}
            _ = tokio::time::sleep(deadline) => {
                timed_out = true;
                self.kill(container_id).await;
            }
            _ = cancel_signal(cancel) => {
                cancelled = true;
                self.kill(container_id).await;
            }
        }
        let wall_time_ms = started.elapsed().as_millis() as u64;

        // A killed exec has no meaningful exit code.
        let exit_code = if timed_out || cancelled {
            None
        } else {
            match self.docker.inspect_exec(&exec.id).await {
                Ok(inspect) => inspect.exit_code,
                Err(e) => {
                    warn!(error = %e, "failed to inspect exec");
                    None
                }
            }
        };

        let out = stdout.lock().await;
        let err = stderr.lock().await;
        Ok(ExecOutcome {
            exit_code,
            stdout: out.data.clone(),
            stderr: err.data.clone(),
            stdout_truncated: out.truncated,
            stderr_truncated: err.truncated,
            timed_out,
            cancelled,
            wall_time_ms,
        })
    }

    async fn write_source(
        &self,
        container_id: &str,
        lang: &LanguageSpec,
        code: &str,
    ) -> Result<(), SandboxError> {
        let encoded = general_purpose::STANDARD.encode(code);
        let command = format!(
            "echo '{}' | base64 -d > {}/{}",
            encoded, SANDBOX_WORKDIR, lang.source_file
        );
        let outcome = self
            .exec_capture(container_id, shell(&command), INTERNAL_CAPS, WRITE_TIMEOUT, None)
            .await?;
        if outcome.exit_code != Some(0) {
            return Err(SandboxError::Crash(format!(
                "failed to write source file: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Compile once per job. Returns `(success, combined output)`.
    async fn compile(
        &self,
        container_id: &str,
        compile_cmd: &[String],
        caps: OutputCaps,
    ) -> Result<(bool, String), SandboxError> {
        let outcome = self
            .exec_capture(
                container_id,
                compile_cmd.to_vec(),
                caps,
                COMPILE_TIMEOUT,
                None,
            )
            .await?;
        let mut combined = outcome.stdout;
        if !outcome.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&outcome.stderr);
        }
        if outcome.timed_out {
            return Ok((
                false,
                format!(
                    "compilation exceeded {}s\n{}",
                    COMPILE_TIMEOUT.as_secs(),
                    combined
                ),
            ));
        }
        Ok((outcome.exit_code == Some(0), combined))
    }

    /// Sample container memory while a test runs. Docker emits stats about
    /// once per second; short runs may produce no sample, in which case the
    /// peak is reported as unknown.
    fn spawn_memory_sampler(
        &self,
        container_id: &str,
    ) -> (tokio::task::JoinHandle<()>, Arc<AtomicU64>) {
        let peak = Arc::new(AtomicU64::new(0));
        let docker = self.docker.clone();
        let id = container_id.to_string();
        let sampled = Arc::clone(&peak);
        let handle = tokio::spawn(async move {
            let options = Some(StatsOptions {
                stream: true,
                one_shot: false,
            });
            let mut stats = docker.stats(&id, options);
            while let Some(next) = stats.next().await {
                let Ok(stats) = next else { break };
                let usage = stats.memory_stats.usage.unwrap_or(0);
                let max_usage = stats.memory_stats.max_usage.unwrap_or(0);
                sampled.fetch_max(usage.max(max_usage), Ordering::Relaxed);
            }
        });
        (handle, peak)
    }

    async fn run_test(
        &self,
        container_id: &str,
        lang: &LanguageSpec,
        test: &TestInput,
        caps: OutputCaps,
        cancel: watch::Receiver<bool>,
    ) -> Result<RawRunOutput, SandboxError> {
        if test.stdin.len() > MAX_STDIN_BYTES {
            return Err(SandboxError::Internal(format!(
                "stdin exceeds maximum size of {} bytes",
                MAX_STDIN_BYTES
            )));
        }

        let encoded = general_purpose::STANDARD.encode(&test.stdin);
        let program = lang
            .run
            .iter()
            .map(|arg| sh_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let command = format!("echo '{}' | base64 -d | {}", encoded, program);

        let (sampler, peak) = self.spawn_memory_sampler(container_id);
        let outcome = self
            .exec_capture(
                container_id,
                shell(&command),
                caps,
                Duration::from_millis(lang.time_limit_ms),
                Some(cancel),
            )
            .await;
        sampler.abort();
        let outcome = outcome?;

        let peak_bytes = peak.load(Ordering::Relaxed);
        let peak_memory_kb = if peak_bytes > 0 {
            Some(peak_bytes / 1024)
        } else {
            None
        };

        // Exit 137 without our own kill means the cgroup OOM killer fired;
        // the sampler can miss a fast spike, so trust the exit code and the
        // container state over the samples.
        let hard_killed = outcome.timed_out || outcome.cancelled;
        let oom_killed = (!hard_killed && outcome.exit_code == Some(137))
            || self.was_oom_killed(container_id).await;

        Ok(RawRunOutput {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            compile_output: None,
            compile_failed: false,
            wall_time_ms: outcome.wall_time_ms,
            peak_memory_kb,
            timed_out: outcome.timed_out,
            oom_killed,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
            cancelled: outcome.cancelled,
        })
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        job: &Job,
        lang: &LanguageSpec,
        caps: OutputCaps,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<RawRunOutput>, SandboxError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Provision(format!("failed to start container: {e}")))?;

        self.write_source(container_id, lang, &job.request.code)
            .await?;

        let mut compile_output = None;
        if let Some(compile_cmd) = &lang.compile {
            debug!(job_id = %job.job_id, "compiling");
            let (ok, output) = self.compile(container_id, compile_cmd, caps).await?;
            if !ok {
                info!(job_id = %job.job_id, "compilation failed");
                // Every test case reports the same compilation failure.
                return Ok(job
                    .request
                    .test_inputs()
                    .iter()
                    .map(|_| RawRunOutput {
                        compile_output: Some(output.clone()),
                        compile_failed: true,
                        ..Default::default()
                    })
                    .collect());
            }
            if !output.is_empty() {
                compile_output = Some(output);
            }
        }

        let tests = job.request.test_inputs();
        let mut outputs = Vec::with_capacity(tests.len());
        for (idx, test) in tests.iter().enumerate() {
            debug!(job_id = %job.job_id, test = idx, "running test case");
            let mut raw = self
                .run_test(container_id, lang, test, caps, cancel.clone())
                .await?;
            raw.compile_output = compile_output.clone();
            let stop = raw.timed_out || raw.cancelled || raw.oom_killed;
            outputs.push(raw);
            if stop {
                // The container was killed or its memory is poisoned;
                // remaining cases cannot run in it.
                break;
            }
        }
        Ok(outputs)
    }
}

/// Resolves when cancellation is requested; pends forever when it cannot
/// arrive (no receiver, or the sender is gone).
async fn cancel_signal(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending::<()>().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        job: &Job,
        lang: &LanguageSpec,
        caps: OutputCaps,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<RawRunOutput>, SandboxError> {
        if job.request.code.len() > MAX_SOURCE_BYTES {
            return Err(SandboxError::Internal(format!(
                "source exceeds maximum size of {} bytes",
                MAX_SOURCE_BYTES
            )));
        }

        self.ensure_image(&lang.image).await?;
        let container_id = self.create_container(job, lang).await?;
        debug!(job_id = %job.job_id, container_id = %container_id, "container created");

        let guard = ContainerGuard::new(self.docker.clone(), container_id.clone());
        let result = self
            .run_in_container(&container_id, job, lang, caps, cancel)
            .await;
        // Teardown completes before the outcome is reported; Drop only
        // covers panics.
        guard.teardown().await;
        result
    }
}
