//! Heartbeat monitor.
//!
//! Pure: the caller passes the current [`Instant`] and acts on the verdict.

use std::time::{Duration, Instant};

/// Default ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Default silence after which the connection is considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// What the caller should do now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing to do.
    Idle,
    /// Send a ping.
    SendPing,
    /// No frame arrived within the timeout; reconnect.
    TimedOut,
}

/// Tracks liveness of one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_received: Instant,
    last_ping: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring a connection opened at `now`.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_received: now,
            last_ping: now,
        }
    }

    /// Any frame arrived.
    pub fn on_frame(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Decide what to do at `now`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if now.saturating_duration_since(self.last_received) >= self.timeout {
            return HeartbeatAction::TimedOut;
        }
        if now.saturating_duration_since(self.last_ping) >= self.interval {
            self.last_ping = now;
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    /// When [`HeartbeatMonitor::poll`] next has something to report.
    pub fn next_deadline(&self) -> Instant {
        let ping = self.last_ping + self.interval;
        let timeout = self.last_received + self.timeout;
        ping.min(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(start: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(15), Duration::from_secs(45), start)
    }

    #[test]
    fn pings_on_interval() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        assert_eq!(m.poll(t0 + Duration::from_secs(5)), HeartbeatAction::Idle);
        assert_eq!(
            m.poll(t0 + Duration::from_secs(15)),
            HeartbeatAction::SendPing
        );
        assert_eq!(m.poll(t0 + Duration::from_secs(16)), HeartbeatAction::Idle);
        assert_eq!(m.next_deadline(), t0 + Duration::from_secs(30));
    }

    #[test]
    fn silence_times_out() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        assert_eq!(
            m.poll(t0 + Duration::from_secs(45)),
            HeartbeatAction::TimedOut
        );
    }

    #[test]
    fn frames_keep_alive() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.on_frame(t0 + Duration::from_secs(40));
        assert_ne!(
            m.poll(t0 + Duration::from_secs(50)),
            HeartbeatAction::TimedOut
        );
        assert_eq!(
            m.poll(t0 + Duration::from_secs(85)),
            HeartbeatAction::TimedOut
        );
    }
}
