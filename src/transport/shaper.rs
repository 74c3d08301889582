//! Traffic shaper.
//!
//! Each write pushes a wakeup instant forward by `bytes / rate`. The next
//! write may go out once that instant has passed. Bursts therefore never
//! exceed one packet beyond the configured rate.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::{
    ConfigError, SHAPER_GRANULARITY, SHAPER_MAX_RATE, SHAPER_MIN_RATE, UDP_IPV4_OVERHEAD,
    UDP_IPV6_OVERHEAD,
};

/// IP and UDP header bytes a datagram to `dest` costs on the wire.
pub fn datagram_overhead(dest: SocketAddr) -> usize {
    match dest {
        SocketAddr::V4(_) => UDP_IPV4_OVERHEAD,
        SocketAddr::V6(_) => UDP_IPV6_OVERHEAD,
    }
}

/// Outcome of asking the shaper whether a write may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperAction {
    /// Write now.
    SendNow,
    /// Wait until the given instant.
    WaitUntil(Instant),
}

/// Byte-rate limiter for socket writes.
#[derive(Debug, Clone)]
pub struct TrafficShaper {
    bytes_per_second: u32,
    wakeup: Option<Instant>,
}

impl TrafficShaper {
    /// Create a shaper for `bytes_per_second`.
    ///
    /// # Errors
    /// Rates outside the supported range are a configuration error.
    pub fn new(bytes_per_second: u32) -> Result<Self, ConfigError> {
        if !(SHAPER_MIN_RATE..=SHAPER_MAX_RATE).contains(&bytes_per_second) {
            return Err(ConfigError::invalid(
                "shaper",
                format!(
                    "rate {bytes_per_second} outside {SHAPER_MIN_RATE}..={SHAPER_MAX_RATE} bytes/s"
                ),
            ));
        }
        Ok(Self {
            bytes_per_second,
            wakeup: None,
        })
    }

    /// Configured rate.
    pub fn rate(&self) -> u32 {
        self.bytes_per_second
    }

    /// Account for a datagram of `payload` bytes just sent to `dest`.
    pub fn record_datagram(&mut self, payload: usize, dest: SocketAddr, now: Instant) {
        self.record_sent(payload + datagram_overhead(dest), now);
    }

    /// Account for `bytes` just written at `now`.
    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        let cost = Duration::from_secs_f64(bytes as f64 / f64::from(self.bytes_per_second));
        let base = match self.wakeup {
            Some(w) if w > now => w,
            _ => now,
        };
        self.wakeup = Some(base + cost);
    }

    /// How long the caller must wait before the next write.
    pub fn delay_until_next_send(&mut self, now: Instant) -> Duration {
        match self.wakeup {
            Some(w) if w > now => w - now,
            _ => {
                self.wakeup = None;
                Duration::ZERO
            }
        }
    }

    /// Delays below the timer granularity are reported as [`ShaperAction::SendNow`].
    pub fn poll(&mut self, now: Instant) -> ShaperAction {
        let delay = self.delay_until_next_send(now);
        if delay < SHAPER_GRANULARITY {
            ShaperAction::SendNow
        } else {
            ShaperAction::WaitUntil(now + delay)
        }
    }
}
