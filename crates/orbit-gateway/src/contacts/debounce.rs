//! Leading-edge emission with one trailing re-fire.
//!
//! The first change emits right away and arms a timer. Changes that land
//! before the timer expires only mark the window dirty; on expiry the
//! directory is emitted once more if anything changed, and the timer is
//! disarmed. A burst of any size therefore produces at most two emissions.
//!
//! The debouncer holds no timer itself. The owner sleeps until
//! [`Debouncer::deadline`] and calls [`Debouncer::fire`]; once cancelled the
//! deadline is gone, so a stale timer cannot fire.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
    dirty: bool,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            dirty: false,
        }
    }

    /// Record a change. Returns `true` if the caller should emit now.
    pub fn on_change(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            self.dirty = true;
            return false;
        }
        self.deadline = Some(now + self.window);
        self.dirty = false;
        true
    }

    /// When the trailing timer expires, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The timer expired. Returns `true` if the caller should emit.
    pub fn fire(&mut self) -> bool {
        if self.deadline.take().is_none() {
            return false;
        }
        std::mem::take(&mut self.dirty)
    }

    /// Disarm without emitting.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.dirty = false;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}
