//! Adaptive schedule for the cooperative control channel.
//!
//! The event loop asks [`ControlInterval::test`] each iteration whether the
//! channel should run. It runs when:
//!
//! - a wakeup the channel asked for has been reached,
//! - the channel did work within the last [`CONTROL_HORIZON`] (busy phase),
//! - or nothing has run for [`CONTROL_REFRESH`].
//!
//! So the channel is polled every iteration while a negotiation is in
//! progress and relaxes to one poll per refresh period otherwise.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::{CONTROL_HORIZON, CONTROL_REFRESH};

/// Backoff-then-relax scheduler.
#[derive(Debug, Clone)]
pub struct ControlInterval {
    horizon: Duration,
    refresh: Duration,
    last_action: Option<Instant>,
    last_test_true: Instant,
    future_trigger: Option<Instant>,
}

impl ControlInterval {
    /// Create with the default horizon and refresh periods.
    pub fn new(now: Instant) -> Self {
        Self::with_periods(CONTROL_HORIZON, CONTROL_REFRESH, now)
    }

    /// Create with explicit periods.
    pub fn with_periods(horizon: Duration, refresh: Duration, now: Instant) -> Self {
        Self {
            horizon,
            refresh,
            last_action: None,
            // Due immediately on the first test
            last_test_true: now.checked_sub(refresh).unwrap_or(now),
            future_trigger: Some(now),
        }
    }

    /// Whether the channel should run now.
    pub fn test(&mut self, now: Instant) -> bool {
        let mut trigger = false;

        if let Some(at) = self.future_trigger {
            if now >= at {
                trigger = true;
                self.future_trigger = None;
            }
        }
        if let Some(last) = self.last_action {
            if last + self.horizon > now {
                trigger = true;
            }
        }
        if self.last_test_true + self.refresh <= now {
            trigger = true;
        }

        if trigger {
            self.last_test_true = now;
        }
        trigger
    }

    /// Ask to run no later than `at`. Keeps the earliest request.
    pub fn future_trigger(&mut self, at: Instant) {
        self.future_trigger = Some(match self.future_trigger {
            Some(existing) => existing.min(at),
            None => at,
        });
    }

    /// Record that the channel did useful work.
    pub fn action(&mut self, now: Instant) {
        self.last_action = Some(now);
    }

    /// Latest instant the loop may sleep until.
    pub fn schedule_wakeup(&self) -> Instant {
        let refresh = self.last_test_true + self.refresh;
        match self.future_trigger {
            Some(at) => at.min(refresh),
            None => refresh,
        }
    }
}
