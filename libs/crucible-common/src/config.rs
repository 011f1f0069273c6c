use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How one language is compiled and run inside its container.
///
/// Loaded from `config/languages.json`; the file is the allowlist, anything
/// not listed there is rejected at intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub image: String,
    /// File the submitted code is written to inside the sandbox workdir.
    pub source_file: String,
    /// Compile command, absent for interpreted languages.
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_time_limit_ms() -> u64 {
    5_000
}

fn default_memory_limit_kb() -> u64 {
    262_144
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    64
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageSpec>,
}

/// Runtime configuration shared by the gateway and the worker. Language
/// definitions come from the JSON file, operational knobs from environment
/// variables.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    languages: HashMap<String, LanguageSpec>,
    pub max_concurrent_workers: usize,
    /// Intake refuses new jobs once the queue holds this many. `None`
    /// disables the cap.
    pub max_queue_depth: Option<usize>,
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
    /// Retries after a failed environment provision, before the job fails.
    pub provision_retries: u32,
    pub provision_backoff: Duration,
    /// A claimed job with no progress for this long is presumed lost.
    pub stale_job_after_ms: i64,
    pub redis_url: String,
    pub bind_addr: String,
}

impl SandboxConfig {
    /// Loads languages from `CONFIG_PATH` (default `config/languages.json`)
    /// and applies environment overrides.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config/languages.json".to_string());
        Self::load(Path::new(&path))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let file: LanguagesFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display.clone(),
                source,
            })?;
        if file.languages.is_empty() {
            return Err(ConfigError::NoLanguages(display));
        }
        let mut config = Self::with_languages(file.languages)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Builds a config from language specs with default knobs. Environment
    /// overrides are not applied.
    pub fn with_languages(specs: Vec<LanguageSpec>) -> Result<Self, ConfigError> {
        let mut languages = HashMap::new();
        for spec in specs {
            validate(&spec)?;
            languages.insert(spec.name.clone(), spec);
        }
        Ok(Self {
            languages,
            max_concurrent_workers: 4,
            max_queue_depth: None,
            stdout_cap_bytes: 64 * 1024,
            stderr_cap_bytes: 64 * 1024,
            provision_retries: 3,
            provision_backoff: Duration::from_millis(250),
            stale_job_after_ms: 120_000,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(addr) = env::var("BIND_ADDR") {
            self.bind_addr = addr;
        }
        self.max_concurrent_workers = env_parse("MAX_WORKERS", self.max_concurrent_workers)?;
        self.max_queue_depth = env_parse_opt("MAX_QUEUE_DEPTH")?.or(self.max_queue_depth);
        self.stdout_cap_bytes = env_parse("STDOUT_CAP_BYTES", self.stdout_cap_bytes)?;
        self.stderr_cap_bytes = env_parse("STDERR_CAP_BYTES", self.stderr_cap_bytes)?;
        self.provision_retries = env_parse("PROVISION_RETRIES", self.provision_retries)?;
        let backoff_ms = env_parse(
            "PROVISION_BACKOFF_MS",
            self.provision_backoff.as_millis() as u64,
        )?;
        self.provision_backoff = Duration::from_millis(backoff_ms);
        self.stale_job_after_ms = env_parse("STALE_JOB_AFTER_MS", self.stale_job_after_ms)?;
        Ok(())
    }

    pub fn language(&self, name: &str) -> Option<&LanguageSpec> {
        self.languages.get(name)
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.languages.contains_key(name)
    }

    /// Names of all configured languages, sorted for stable log output.
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate(spec: &LanguageSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidLanguage {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };
    if spec.name.is_empty() {
        return Err(ConfigError::InvalidLanguage {
            name: "<unnamed>".to_string(),
            reason: "empty name".to_string(),
        });
    }
    if spec.image.is_empty() {
        return Err(invalid("empty image"));
    }
    if spec.source_file.is_empty() {
        return Err(invalid("empty source_file"));
    }
    if spec.run.is_empty() {
        return Err(invalid("empty run command"));
    }
    if spec
        .compile
        .as_ref()
        .is_some_and(|compile| compile.is_empty())
    {
        return Err(invalid("empty compile command"));
    }
    if spec.time_limit_ms == 0 {
        return Err(invalid("time_limit_ms must be positive"));
    }
    if spec.memory_limit_kb == 0 {
        return Err(invalid("memory_limit_kb must be positive"));
    }
    if spec.cpu_limit <= 0.0 {
        return Err(invalid("cpu_limit must be positive"));
    }
    Ok(())
}

fn env_parse<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                var: var.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_specs(raw: &str) -> Vec<LanguageSpec> {
        let file: LanguagesFile = serde_json::from_str(raw).unwrap();
        file.languages
    }

    #[test]
    fn language_entry_fills_defaults() {
        let specs = parse_specs(
            r#"{"languages": [{
                "name": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": ["python3", "-u", "main.py"]
            }]}"#,
        );
        let spec = &specs[0];
        assert!(spec.compile.is_none());
        assert_eq!(spec.time_limit_ms, 5_000);
        assert_eq!(spec.memory_limit_kb, 262_144);
        assert_eq!(spec.pids_limit, 64);
    }

    #[test]
    fn explicit_limits_override_defaults() {
        let specs = parse_specs(
            r#"{"languages": [{
                "name": "cpp",
                "image": "gcc:13",
                "source_file": "main.cpp",
                "compile": ["g++", "-O2", "-o", "main", "main.cpp"],
                "run": ["./main"],
                "time_limit_ms": 10000,
                "memory_limit_kb": 524288
            }]}"#,
        );
        let spec = &specs[0];
        assert_eq!(spec.compile.as_ref().unwrap().len(), 5);
        assert_eq!(spec.time_limit_ms, 10_000);
        assert_eq!(spec.memory_limit_kb, 524_288);
    }

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        let config = SandboxConfig::with_languages(parse_specs(
            r#"{"languages": [{
                "name": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": ["python3", "main.py"]
            }]}"#,
        ))
        .unwrap();
        assert!(config.is_supported("python"));
        assert!(!config.is_supported("Python"));
        assert!(!config.is_supported("ruby"));
        assert_eq!(config.language("python").unwrap().source_file, "main.py");
        assert!(config.language("ruby").is_none());
    }

    #[test]
    fn rejects_empty_run_command() {
        let err = SandboxConfig::with_languages(parse_specs(
            r#"{"languages": [{
                "name": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": []
            }]}"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("empty run command"));
    }

    #[test]
    fn rejects_zero_time_limit() {
        let err = SandboxConfig::with_languages(parse_specs(
            r#"{"languages": [{
                "name": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": ["python3", "main.py"],
                "time_limit_ms": 0
            }]}"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("time_limit_ms"));
    }
}
