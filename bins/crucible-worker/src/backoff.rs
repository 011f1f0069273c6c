use std::time::Duration;

/// Doubling backoff with a ceiling, for retry loops around provisioning and
/// event publishing.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    /// How many delays have been handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            next: base,
            attempt: 0,
        }
    }

    /// The delay to sleep before the next retry. Doubles on each call until
    /// it reaches the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempt += 1;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempt = 0;
    }
}
