use crate::error::{PublishError, QueueError, StoreError};
use crate::events::EventSink;
use crate::queue::JobQueue;
use crate::store::JobStore;
use crate::types::{ExecutionRequest, Job, JobEvent, JobState, Submission};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Redis key semantics shared by the gateway and the workers. Keys are
/// deterministic so the two binaries never drift.
///
/// Layout: the queue list holds bare job ids; the job record is a hash at
/// `crucible:job:<id>` (fields `request`, `state`, `enqueued_at`,
/// `started_at`, `finished_at`). State changes go through a Lua
/// compare-and-set on the `state` field, which is what makes claims atomic
/// across workers.

pub const QUEUE_KEY: &str = "crucible:queue";
pub const JOB_PREFIX: &str = "crucible:job";
pub const SUBMISSION_PREFIX: &str = "crucible:submission";
pub const CANCEL_PREFIX: &str = "crucible:cancel";
pub const INFLIGHT_KEY: &str = "crucible:inflight";
pub const EVENT_CHANNEL_PREFIX: &str = "crucible:events";

pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

pub fn submission_key(job_id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, job_id)
}

pub fn cancel_key(job_id: &Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, job_id)
}

/// Pub/sub channel carrying lifecycle events for one session.
pub fn event_channel(session_id: &str) -> String {
    format!("{}:{}", EVENT_CHANNEL_PREFIX, session_id)
}

/// Open a managed connection; reconnects are handled internally.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

const TRANSITION_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'state', ARGV[2])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], 'started_at', ARGV[3]) end
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'finished_at', ARGV[4]) end
redis.call('EXPIRE', KEYS[1], ARGV[5])
return 1
"#;

async fn read_job(conn: &mut ConnectionManager, job_id: Uuid) -> Result<Option<Job>, StoreError> {
    let fields: HashMap<String, String> = conn.hgetall(job_key(&job_id)).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    let corrupt = |what: &str| StoreError::Corrupt(format!("job {job_id}: {what}"));
    let request: ExecutionRequest = serde_json::from_str(
        fields
            .get("request")
            .ok_or_else(|| corrupt("missing request"))?,
    )?;
    let state = fields
        .get("state")
        .and_then(|s| JobState::parse(s))
        .ok_or_else(|| corrupt("bad state"))?;
    let enqueued_at = fields
        .get("enqueued_at")
        .and_then(|s| parse_timestamp(s))
        .ok_or_else(|| corrupt("bad enqueued_at"))?;
    Ok(Some(Job {
        job_id,
        request,
        state,
        enqueued_at,
        started_at: fields.get("started_at").and_then(|s| parse_timestamp(s)),
        finished_at: fields.get("finished_at").and_then(|s| parse_timestamp(s)),
    }))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// FIFO queue backed by a Redis list: RPUSH ids at the tail, BLPOP at the
/// head. The job record must already exist when an id is pushed.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(QUEUE_KEY, job.job_id.to_string()).await?;
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout.as_secs_f64()).await?;
        let Some((_key, raw_id)) = result else {
            return Ok(None);
        };
        let job_id =
            Uuid::parse_str(&raw_id).map_err(|_| QueueError::MalformedEntry(raw_id.clone()))?;
        match read_job(&mut conn, job_id).await {
            Ok(Some(job)) => Ok(Some(job)),
            // Popped an id whose record expired out from under it.
            Ok(None) => Err(QueueError::MissingRecord(job_id)),
            Err(StoreError::Redis(e)) => Err(QueueError::Redis(e)),
            Err(StoreError::Payload(e)) => Err(QueueError::Payload(e)),
            Err(StoreError::Corrupt(detail)) => Err(QueueError::MalformedEntry(detail)),
        }
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(QUEUE_KEY, 1, job_id.to_string()).await?;
        Ok(removed > 0)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }
}

/// Job and submission records in Redis, both with a 24-hour TTL.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    transition_script: Arc<redis::Script>,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            transition_script: Arc::new(redis::Script::new(TRANSITION_SCRIPT)),
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        let request = serde_json::to_string(&job.request)?;
        let mut fields = vec![
            ("request", request),
            ("state", job.state.to_string()),
            ("enqueued_at", job.enqueued_at.to_rfc3339()),
        ];
        if let Some(at) = job.started_at {
            fields.push(("started_at", at.to_rfc3339()));
        }
        if let Some(at) = job.finished_at {
            fields.push(("finished_at", at.to_rfc3339()));
        }
        let mut conn = self.conn.clone();
        let key = job_key(&job.job_id);
        let _: () = conn.hset_multiple(&key, &fields).await?;
        // Records live for 24 hours, long enough for any caller to poll.
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(86_400)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        read_job(&mut conn, job_id).await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let now = Utc::now().to_rfc3339();
        let started = if to == JobState::Running {
            now.clone()
        } else {
            String::new()
        };
        let finished = if to.is_terminal() { now } else { String::new() };
        let mut conn = self.conn.clone();
        let changed: i64 = self
            .transition_script
            .key(job_key(&job_id))
            .arg(from.to_string())
            .arg(to.to_string())
            .arg(started)
            .arg(finished)
            .arg(86_400)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // A flag only needs to outlive the job it targets.
        let _: () = conn.set_ex(cancel_key(&job_id), 1, 3_600).await?;
        Ok(())
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(cancel_key(&job_id)).await?;
        Ok(exists)
    }

    async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let payload = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();
        // Same 24-hour retention as the job record.
        let _: () = conn
            .set_ex(submission_key(&submission.id), payload, 86_400)
            .await?;
        Ok(())
    }

    async fn get_submission(&self, job_id: Uuid) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(&job_id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn mark_inflight(&self, job_id: Uuid, claimed_at_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(INFLIGHT_KEY, job_id.to_string(), claimed_at_ms)
            .await?;
        Ok(())
    }

    async fn clear_inflight(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(INFLIGHT_KEY, job_id.to_string()).await?;
        Ok(())
    }

    async fn stale_inflight(&self, claimed_before_ms: i64) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(INFLIGHT_KEY, "-inf", claimed_before_ms - 1)
            .await?;
        // Entries that fail to parse are junk left by older versions; skip
        // them rather than wedging the reaper.
        Ok(members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect())
    }
}

/// Publishes lifecycle events on the session's pub/sub channel.
#[derive(Clone)]
pub struct RedisEventSink {
    conn: ConnectionManager,
}

impl RedisEventSink {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(event_channel(&event.session_id), payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(&id), job_key(&id));
        assert!(job_key(&id).starts_with("crucible:job:"));
    }

    #[test]
    fn submission_key_format() {
        let id = Uuid::new_v4();
        let key = submission_key(&id);
        assert!(key.starts_with("crucible:submission:"));
        assert!(key.contains(&id.to_string()));
    }

    #[test]
    fn cancel_key_format() {
        let id = Uuid::new_v4();
        assert!(cancel_key(&id).starts_with("crucible:cancel:"));
    }

    #[test]
    fn event_channel_is_per_session() {
        assert_eq!(event_channel("abc"), "crucible:events:abc");
        assert_ne!(event_channel("abc"), event_channel("def"));
    }
}
