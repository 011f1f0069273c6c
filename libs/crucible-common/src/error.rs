use thiserror::Error;

/// Failures surfaced by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("queue payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queued job {0} has no job record")]
    MissingRecord(uuid::Uuid),
    #[error("malformed queue entry: {0}")]
    MalformedEntry(String),
}

/// Failures surfaced by job/submission store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored record: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Failures surfaced when publishing a lifecycle event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Why a submission was rejected at intake.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("queue is at capacity ({depth}/{max})")]
    QueueSaturated { depth: usize, max: usize },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a cancellation request could not be recorded.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Problems loading or validating the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no languages configured in {0}")]
    NoLanguages(String),
    #[error("invalid language entry '{name}': {reason}")]
    InvalidLanguage { name: String, reason: String },
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: String, reason: String },
}
