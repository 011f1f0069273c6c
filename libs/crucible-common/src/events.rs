use crate::error::PublishError;
use crate::types::JobEvent;
use async_trait::async_trait;

/// Outbound lifecycle notifications, keyed by the submitting session.
///
/// Delivery is best effort: callers must never block job progress on a
/// publish, and a lost event leaves the polled submission record as the
/// source of truth.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> Result<(), PublishError>;
}
