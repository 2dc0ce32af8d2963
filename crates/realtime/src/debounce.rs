//! Trailing-edge debounce as an explicit state machine.
//!
//! ```text
//!            notify(t)                    poll(t >= deadline)
//!   Idle ───────────────▶ Pending(t+w) ─────────────────────▶ Idle (fire once)
//!                           │    ▲
//!                           └────┘ notify(t'): deadline = t' + w
//! ```
//!
//! Time is always passed in, so the machine is deterministic and needs no
//! timers of its own.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending {
        deadline: DateTime<Utc>,
        /// Notifications collapsed into this pending firing.
        coalesced: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::Pending { .. })
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            DebounceState::Idle => None,
            DebounceState::Pending { deadline, .. } => Some(deadline),
        }
    }

    /// Record a notification at `now`, pushing the deadline to `now + window`.
    pub fn notify(&mut self, now: DateTime<Utc>) {
        let coalesced = match self.state {
            DebounceState::Idle => 1,
            DebounceState::Pending { coalesced, .. } => coalesced.saturating_add(1),
        };
        self.state = DebounceState::Pending {
            deadline: now + self.window,
            coalesced,
        };
    }

    /// Fire if the deadline has been reached.
    ///
    /// Returns the number of coalesced notifications when firing and moves
    /// back to `Idle`; otherwise leaves the state untouched.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<u32> {
        match self.state {
            DebounceState::Pending { deadline, coalesced } if now >= deadline => {
                self.state = DebounceState::Idle;
                Some(coalesced)
            }
            _ => None,
        }
    }

    /// Drop any pending firing. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        let was_pending = self.is_pending();
        self.state = DebounceState::Idle;
        was_pending
    }
}
