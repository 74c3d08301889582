//! Countdown timers for the session's periodic behaviors.
//!
//! An [`EventTimeout`] fires once its duration has elapsed since the last
//! reset and then rearms itself from the firing instant. The session keeps
//! three of them in a [`TimeoutSet`]: inactivity, keepalive-send and
//! keepalive-receive.

use std::time::Duration;

use tokio::time::Instant;

/// Default timer values.
pub mod constants {
    use std::time::Duration;

    /// Keepalive send interval when keepalives are enabled without a value.
    pub const DEFAULT_PING: Duration = Duration::from_secs(10);

    /// Keepalive receive timeout when enabled without a value.
    pub const DEFAULT_PING_RESTART: Duration = Duration::from_secs(60);
}

/// A periodic countdown timer.
#[derive(Debug, Clone)]
pub struct EventTimeout {
    /// Countdown length.
    duration: Duration,
    /// Reference instant of the current countdown.
    last: Instant,
}

impl EventTimeout {
    /// Start a countdown at `now`.
    pub fn new(duration: Duration, now: Instant) -> Self {
        Self {
            duration,
            last: now,
        }
    }

    /// Countdown length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Restart the countdown from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }

    /// Instant at which the timer fires.
    pub fn deadline(&self) -> Instant {
        self.last + self.duration
    }

    /// Whether the countdown has elapsed. Rearms from `now` when it has.
    pub fn trigger(&mut self, now: Instant) -> bool {
        if now >= self.deadline() {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// What to do when the keepalive-receive timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// End the session.
    Exit,
    /// Request a restart.
    Restart,
}

/// A timer that fired, with the action it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Nothing was written to the interface for the inactivity period.
    Inactive,
    /// No authenticated packet arrived within the keepalive-receive period.
    PingTimeout(PingAction),
    /// A keepalive should be sent.
    SendKeepalive,
}

/// The session's three independent timers.
#[derive(Debug, Clone, Default)]
pub struct TimeoutSet {
    inactivity: Option<EventTimeout>,
    ping_send: Option<EventTimeout>,
    ping_rec: Option<(EventTimeout, PingAction)>,
}

impl TimeoutSet {
    /// Build the set; `None` disables a timer.
    pub fn new(
        now: Instant,
        inactivity: Option<Duration>,
        ping_send: Option<Duration>,
        ping_rec: Option<(Duration, PingAction)>,
    ) -> Self {
        Self {
            inactivity: inactivity.map(|d| EventTimeout::new(d, now)),
            ping_send: ping_send.map(|d| EventTimeout::new(d, now)),
            ping_rec: ping_rec.map(|(d, action)| (EventTimeout::new(d, now), action)),
        }
    }

    /// A packet was written to the interface.
    pub fn on_interface_write(&mut self, now: Instant) {
        if let Some(t) = &mut self.inactivity {
            t.reset(now);
        }
    }

    /// A datagram was written to the socket.
    pub fn on_link_write(&mut self, now: Instant) {
        if let Some(t) = &mut self.ping_send {
            t.reset(now);
        }
    }

    /// An authenticated packet (data or control) arrived.
    pub fn on_authenticated_packet(&mut self, now: Instant) {
        if let Some((t, _)) = &mut self.ping_rec {
            t.reset(now);
        }
    }

    /// Check the session-ending timers.
    ///
    /// `ping_rec_armed` is false while the keepalive-receive timer must not
    /// run yet (remote address still unknown).
    pub fn check_expiry(&mut self, now: Instant, ping_rec_armed: bool) -> Option<TimerEvent> {
        if let Some(t) = &mut self.inactivity {
            if t.trigger(now) {
                return Some(TimerEvent::Inactive);
            }
        }
        if ping_rec_armed {
            if let Some((t, action)) = &mut self.ping_rec {
                if t.trigger(now) {
                    return Some(TimerEvent::PingTimeout(*action));
                }
            }
        }
        None
    }

    /// Check the keepalive-send timer. Only call while no datagram is pending.
    pub fn check_keepalive(&mut self, now: Instant) -> Option<TimerEvent> {
        let t = self.ping_send.as_mut()?;
        t.trigger(now).then_some(TimerEvent::SendKeepalive)
    }

    /// Earliest deadline among the timers that are currently running.
    pub fn next_deadline(&self, ping_rec_armed: bool, ping_send_armed: bool) -> Option<Instant> {
        let inactivity = self.inactivity.as_ref().map(EventTimeout::deadline);
        let ping_rec = self
            .ping_rec
            .as_ref()
            .filter(|_| ping_rec_armed)
            .map(|(t, _)| t.deadline());
        let ping_send = self
            .ping_send
            .as_ref()
            .filter(|_| ping_send_armed)
            .map(EventTimeout::deadline);
        [inactivity, ping_rec, ping_send].into_iter().flatten().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_and_rearm() {
        let start = Instant::now();
        let mut t = EventTimeout::new(Duration::from_secs(10), start);

        assert!(!t.trigger(start + Duration::from_secs(9)));
        assert!(t.trigger(start + Duration::from_secs(10)));

        // Rearmed from the firing instant
        assert!(!t.trigger(start + Duration::from_secs(15)));
        assert!(t.trigger(start + Duration::from_secs(20)));
    }

    #[test]
    fn test_reset_postpones() {
        let start = Instant::now();
        let mut t = EventTimeout::new(Duration::from_secs(10), start);

        t.reset(start + Duration::from_secs(8));
        assert!(!t.trigger(start + Duration::from_secs(10)));
        assert!(t.trigger(start + Duration::from_secs(18)));
    }

    #[test]
    fn test_ping_timeout_carries_action() {
        let start = Instant::now();
        let mut set = TimeoutSet::new(
            start,
            None,
            None,
            Some((Duration::from_secs(10), PingAction::Restart)),
        );

        let later = start + Duration::from_secs(10);
        // Not armed until the remote is known
        assert_eq!(set.check_expiry(later, false), None);
        assert_eq!(
            set.check_expiry(later, true),
            Some(TimerEvent::PingTimeout(PingAction::Restart))
        );
    }

    #[test]
    fn test_authenticated_packet_resets_ping_rec() {
        let start = Instant::now();
        let mut set = TimeoutSet::new(
            start,
            None,
            None,
            Some((Duration::from_secs(10), PingAction::Exit)),
        );

        set.on_authenticated_packet(start + Duration::from_secs(9));
        assert_eq!(set.check_expiry(start + Duration::from_secs(10), true), None);
        assert_eq!(
            set.check_expiry(start + Duration::from_secs(19), true),
            Some(TimerEvent::PingTimeout(PingAction::Exit))
        );
    }

    #[test]
    fn test_inactivity_reset_by_interface_write() {
        let start = Instant::now();
        let mut set = TimeoutSet::new(start, Some(Duration::from_secs(30)), None, None);

        set.on_interface_write(start + Duration::from_secs(20));
        assert_eq!(set.check_expiry(start + Duration::from_secs(30), true), None);
        assert_eq!(
            set.check_expiry(start + Duration::from_secs(50), true),
            Some(TimerEvent::Inactive)
        );
    }

    #[test]
    fn test_keepalive_due_after_link_silence() {
        let start = Instant::now();
        let mut set = TimeoutSet::new(start, None, Some(Duration::from_secs(5)), None);

        assert_eq!(set.check_keepalive(start + Duration::from_secs(4)), None);
        set.on_link_write(start + Duration::from_secs(4));
        assert_eq!(set.check_keepalive(start + Duration::from_secs(5)), None);
        assert_eq!(
            set.check_keepalive(start + Duration::from_secs(9)),
            Some(TimerEvent::SendKeepalive)
        );
        assert_eq!(TimeoutSet::default().check_keepalive(start), None);
    }

    #[test]
    fn test_next_deadline_is_minimum() {
        let start = Instant::now();
        let set = TimeoutSet::new(
            start,
            Some(Duration::from_secs(30)),
            Some(Duration::from_secs(5)),
            Some((Duration::from_secs(10), PingAction::Restart)),
        );

        assert_eq!(set.next_deadline(true, true), Some(start + Duration::from_secs(5)));
        assert_eq!(set.next_deadline(true, false), Some(start + Duration::from_secs(10)));
        assert_eq!(set.next_deadline(false, false), Some(start + Duration::from_secs(30)));
        assert_eq!(TimeoutSet::default().next_deadline(true, true), None);
    }
}
