//! Fire-and-forget delivery of lifecycle events. Producers hand events to
//! an in-process channel and move on; a single notifier task drains the
//! channel and publishes each event with a short retry budget. Delivery is
//! never allowed to slow down or fail a job.

use std::sync::Arc;
use std::time::Duration;

use crucible_common::events::EventSink;
use crucible_common::types::JobEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backoff::Backoff;

const EVENT_BUFFER: usize = 256;
const PUBLISH_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CEILING: Duration = Duration::from_secs(2);

/// Drains queued events and pushes them to the sink.
pub struct Notifier {
    sink: Arc<dyn EventSink>,
    rx: mpsc::Receiver<JobEvent>,
}

impl Notifier {
    /// Create the notifier and the sender side producers use. The buffer is
    /// bounded; when it fills, new events are dropped at the sender.
    pub fn channel(sink: Arc<dyn EventSink>) -> (mpsc::Sender<JobEvent>, Notifier) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (tx, Notifier { sink, rx })
    }

    /// Run until every sender is dropped and the buffer drains.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.publish_with_retry(&event).await;
        }
        debug!("notifier drained, shutting down");
    }

    async fn publish_with_retry(&self, event: &JobEvent) {
        let mut backoff = Backoff::new(RETRY_BASE, RETRY_CEILING);
        loop {
            match self.sink.publish(event).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.event_id,
                        job_id = %event.job_id,
                        transition = %event.transition.to,
                        "published job event"
                    );
                    return;
                }
                Err(err) if backoff.attempt + 1 < PUBLISH_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    warn!(
                        event_id = %event.event_id,
                        attempt = backoff.attempt,
                        ?delay,
                        "event publish failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // Out of retries. The event is gone; the job itself is
                    // unaffected.
                    warn!(
                        event_id = %event.event_id,
                        job_id = %event.job_id,
                        "dropping job event after {PUBLISH_ATTEMPTS} attempts: {err}"
                    );
                    return;
                }
            }
        }
    }
}

/// Queue an event without waiting. A full or closed buffer drops the event
/// with a warning; callers never block on notification.
pub fn emit(tx: &mpsc::Sender<JobEvent>, event: JobEvent) {
    if let Err(err) = tx.try_send(event) {
        warn!("job event dropped before publish: {err}");
    }
}
