use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Source-wide minimum spacing between call bursts.
///
/// One floor is shared by a [`PollCache`](crate::cache::PollCache) and every
/// entry it creates. Every fetch start for the source happens while the floor
/// is locked, so the check and the claim cannot interleave.
#[derive(Debug)]
pub(crate) struct PollFloor {
    min_between_polls: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl PollFloor {
    pub(crate) fn new(min_between_polls: Duration) -> Self {
        Self {
            min_between_polls,
            last_attempt: Mutex::new(None),
        }
    }

    pub(crate) fn min_between_polls(&self) -> Duration {
        self.min_between_polls
    }

    pub(crate) fn last_attempt(&self) -> Option<Instant> {
        *self.lock().last_attempt
    }

    /// `None` until the first attempt, or when the next slot lies beyond what `Instant` can hold.
    pub(crate) fn next_at(&self) -> Option<Instant> {
        self.last_attempt()?.checked_add(self.min_between_polls)
    }

    pub(crate) fn lock(&self) -> FloorGuard<'_> {
        FloorGuard {
            min_between_polls: self.min_between_polls,
            last_attempt: self
                .last_attempt
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

pub(crate) struct FloorGuard<'a> {
    min_between_polls: Duration,
    last_attempt: MutexGuard<'a, Option<Instant>>,
}

impl FloorGuard<'_> {
    pub(crate) fn allows(&self, now: Instant) -> bool {
        match *self.last_attempt {
            Some(last) => now.saturating_duration_since(last) >= self.min_between_polls,
            None => true,
        }
    }

    /// Records an attempt at `now`. The floor never moves backwards.
    pub(crate) fn claim(&mut self, now: Instant) {
        let latest = match *self.last_attempt {
            Some(last) => last.max(now),
            None => now,
        };
        *self.last_attempt = Some(latest);
    }
}
