//! Connection state machine.
//!
//! A pure, side-effect-free state machine for the connection lifecycle. It
//! takes events as input and produces a new state plus a list of actions to
//! execute. The actual I/O (opening sockets, sending frames, timers) is
//! performed by sync-client.
//!
//! ```text
//! idle -> connecting -> authenticating -> connected
//!            ^               |                |
//!            |               v                v
//!            +---------- errored <------------+
//!
//! any state --Shutdown--> closed (terminal)
//! ```

use std::time::Duration;
use tessel_sync_types::SessionId;

/// Connection state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not started.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting {
        /// Consecutive failed attempts before this one.
        attempt: u32,
    },
    /// Transport open, `init` sent.
    Authenticating {
        /// Consecutive failed attempts before this one.
        attempt: u32,
    },
    /// `init-ok` received.
    Connected {
        /// Server session.
        session_id: SessionId,
    },
    /// Connection failed or was lost.
    Errored {
        /// Failed attempts so far.
        attempt: u32,
        /// Whether a reconnect timer is running.
        retrying: bool,
        /// What went wrong.
        error: String,
    },
    /// Shut down by the caller. Terminal.
    Closed,
}

impl ConnectionState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Closed, _) => (Self::Closed, vec![]),

            (_, Event::Shutdown) => (
                Self::Closed,
                vec![
                    Action::CancelReconnect,
                    Action::CloseTransport,
                    Action::EmitStatus(ConnectionStatus::Closed),
                ],
            ),

            (Self::Idle, Event::Start)
            | (Self::Errored { retrying: false, .. }, Event::Start) => {
                connecting(0)
            }

            (Self::Connecting { attempt }, Event::TransportConnected) => (
                Self::Authenticating { attempt },
                vec![
                    Action::SendInit,
                    Action::EmitStatus(ConnectionStatus::Authenticating),
                ],
            ),
            (Self::Connecting { attempt }, Event::TransportFailed { error }) => {
                retry(attempt, error, false)
            }

            (Self::Authenticating { .. }, Event::InitOk { session_id }) => (
                Self::Connected { session_id },
                vec![
                    Action::Replay,
                    Action::EmitStatus(ConnectionStatus::Connected),
                ],
            ),
            (Self::Authenticating { attempt }, Event::AuthFailed { error }) => (
                Self::Errored {
                    attempt,
                    retrying: false,
                    error: error.clone(),
                },
                vec![
                    Action::CloseTransport,
                    Action::EmitStatus(ConnectionStatus::Errored {
                        error,
                        retrying: false,
                    }),
                ],
            ),
            (Self::Authenticating { attempt }, Event::ConnectionLost { error }) => {
                retry(attempt, error, true)
            }
            (Self::Authenticating { attempt }, Event::HeartbeatTimedOut) => {
                retry(attempt, "heartbeat timed out".into(), true)
            }

            (Self::Connected { .. }, Event::ConnectionLost { error }) => retry(0, error, true),
            (Self::Connected { .. }, Event::HeartbeatTimedOut) => {
                retry(0, "heartbeat timed out".into(), true)
            }

            (
                Self::Errored {
                    attempt,
                    retrying: true,
                    ..
                },
                Event::ReconnectTimer,
            ) => connecting(attempt),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// The externally visible status for this state.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Idle => ConnectionStatus::Idle,
            Self::Connecting { .. } => ConnectionStatus::Connecting,
            Self::Authenticating { .. } => ConnectionStatus::Authenticating,
            Self::Connected { .. } => ConnectionStatus::Connected,
            Self::Errored {
                retrying, error, ..
            } => ConnectionStatus::Errored {
                error: error.clone(),
                retrying: *retrying,
            },
            Self::Closed => ConnectionStatus::Closed,
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

fn connecting(attempt: u32) -> (ConnectionState, Vec<Action>) {
    (
        ConnectionState::Connecting { attempt },
        vec![
            Action::OpenTransport,
            Action::EmitStatus(ConnectionStatus::Connecting),
        ],
    )
}

fn retry(attempt: u32, error: String, close: bool) -> (ConnectionState, Vec<Action>) {
    let attempt = attempt.saturating_add(1);
    let mut actions = Vec::with_capacity(3);
    if close {
        actions.push(Action::CloseTransport);
    }
    actions.push(Action::EmitStatus(ConnectionStatus::Errored {
        error: error.clone(),
        retrying: true,
    }));
    actions.push(Action::StartReconnectTimer { attempt });
    (
        ConnectionState::Errored {
            attempt,
            retrying: true,
            error,
        },
        actions,
    )
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked to connect.
    Start,
    /// Transport opened.
    TransportConnected,
    /// Transport failed to open.
    TransportFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Server accepted `init`.
    InitOk {
        /// Server session.
        session_id: SessionId,
    },
    /// Server rejected `init`.
    AuthFailed {
        /// Error message.
        error: String,
    },
    /// Transport closed or errored after opening.
    ConnectionLost {
        /// Reason for disconnection.
        error: String,
    },
    /// No frame arrived within the heartbeat timeout.
    HeartbeatTimedOut,
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Caller shut the client down.
    Shutdown,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport.
    OpenTransport,
    /// Send the `init` frame.
    SendInit,
    /// Re-send queries, the pending log and room joins, in that order.
    Replay,
    /// Close the transport.
    CloseTransport,
    /// Schedule a reconnect using the backoff for this attempt.
    StartReconnectTimer {
        /// Failed attempts so far (starts at 1).
        attempt: u32,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Notify connection-status listeners.
    EmitStatus(ConnectionStatus),
}

/// Connection status as observed by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not started.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Handshake in progress.
    Authenticating,
    /// Ready.
    Connected,
    /// Failed; `retrying` tells whether a reconnect is scheduled.
    Errored {
        /// What went wrong.
        error: String,
        /// Whether a reconnect is scheduled.
        retrying: bool,
    },
    /// Shut down.
    Closed,
}

/// Reconnection backoff.
///
/// Formula: `min(max, base * 2^(attempt-1)) + random(0..=jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay of the first retry.
    pub base: Duration,
    /// Cap on the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.random_jitter()
    }

    /// Delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn random_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        let mut bytes = [0u8; 8];
        // without entropy, skip the jitter rather than fail the reconnect
        if getrandom::getrandom(&mut bytes).is_err() {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::from_le_bytes(bytes) % (jitter_ms + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            session_id: SessionId::new(),
        }
    }

    // ===========================================
    // Happy path
    // ===========================================

    #[test]
    fn starts_idle() {
        assert_eq!(ConnectionState::new(), ConnectionState::Idle);
        assert_eq!(ConnectionState::new().status(), ConnectionStatus::Idle);
    }

    #[test]
    fn start_opens_transport() {
        let (state, actions) = ConnectionState::Idle.on_event(Event::Start);
        assert_eq!(state, ConnectionState::Connecting { attempt: 0 });
        assert!(actions.contains(&Action::OpenTransport));
        assert!(actions.contains(&Action::EmitStatus(ConnectionStatus::Connecting)));
    }

    #[test]
    fn transport_connected_sends_init() {
        let (state, actions) =
            ConnectionState::Connecting { attempt: 2 }.on_event(Event::TransportConnected);
        assert_eq!(state, ConnectionState::Authenticating { attempt: 2 });
        assert!(actions.contains(&Action::SendInit));
    }

    #[test]
    fn init_ok_replays() {
        let session_id = SessionId::new();
        let (state, actions) = ConnectionState::Authenticating { attempt: 0 }
            .on_event(Event::InitOk { session_id });
        assert_eq!(state, ConnectionState::Connected { session_id });
        assert_eq!(
            actions,
            vec![
                Action::Replay,
                Action::EmitStatus(ConnectionStatus::Connected)
            ]
        );
    }

    // ===========================================
    // Failures
    // ===========================================

    #[test]
    fn transport_failure_schedules_retry() {
        let (state, actions) = ConnectionState::Connecting { attempt: 0 }.on_event(
            Event::TransportFailed {
                error: "refused".into(),
            },
        );
        assert!(matches!(
            state,
            ConnectionState::Errored {
                attempt: 1,
                retrying: true,
                ..
            }
        ));
        assert!(actions.contains(&Action::StartReconnectTimer { attempt: 1 }));
        assert!(!actions.contains(&Action::CloseTransport));
    }

    #[test]
    fn repeated_failures_increase_attempt() {
        let (mut state, _) = ConnectionState::Idle.on_event(Event::Start);
        for expected in 1..=3 {
            let (next, actions) = state.on_event(Event::TransportFailed {
                error: "refused".into(),
            });
            assert!(actions.contains(&Action::StartReconnectTimer { attempt: expected }));
            let (next, _) = next.on_event(Event::ReconnectTimer);
            assert_eq!(next, ConnectionState::Connecting { attempt: expected });
            state = next;
        }
    }

    #[test]
    fn auth_failure_does_not_retry() {
        let (state, actions) = ConnectionState::Authenticating { attempt: 0 }.on_event(
            Event::AuthFailed {
                error: "bad token".into(),
            },
        );
        assert!(matches!(state, ConnectionState::Errored { retrying: false, .. }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::StartReconnectTimer { .. })));
        assert!(actions.contains(&Action::CloseTransport));

        // the timer never fires, but if it did nothing happens
        let (state, actions) = state.on_event(Event::ReconnectTimer);
        assert!(matches!(state, ConnectionState::Errored { retrying: false, .. }));
        assert!(actions.is_empty());

        // explicit restart is allowed
        let (state, _) = state.on_event(Event::Start);
        assert_eq!(state, ConnectionState::Connecting { attempt: 0 });
    }

    #[test]
    fn connection_lost_while_connected_reconnects() {
        let (state, actions) = connected().on_event(Event::ConnectionLost {
            error: "eof".into(),
        });
        assert!(matches!(
            state,
            ConnectionState::Errored {
                attempt: 1,
                retrying: true,
                ..
            }
        ));
        assert!(actions.contains(&Action::CloseTransport));
        assert!(actions.contains(&Action::StartReconnectTimer { attempt: 1 }));

        let (state, actions) = state.on_event(Event::ReconnectTimer);
        assert_eq!(state, ConnectionState::Connecting { attempt: 1 });
        assert!(actions.contains(&Action::OpenTransport));
    }

    #[test]
    fn heartbeat_timeout_forces_reconnect() {
        let (state, actions) = connected().on_event(Event::HeartbeatTimedOut);
        assert!(matches!(state, ConnectionState::Errored { retrying: true, .. }));
        assert!(actions.contains(&Action::CloseTransport));
    }

    // ===========================================
    // Shutdown
    // ===========================================

    #[test]
    fn shutdown_is_terminal() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting { attempt: 1 },
            connected(),
            ConnectionState::Errored {
                attempt: 1,
                retrying: true,
                error: "x".into(),
            },
        ] {
            let (closed, actions) = state.on_event(Event::Shutdown);
            assert_eq!(closed, ConnectionState::Closed);
            assert!(actions.contains(&Action::CancelReconnect));
            assert!(actions.contains(&Action::EmitStatus(ConnectionStatus::Closed)));
        }

        let (state, actions) = ConnectionState::Closed.on_event(Event::Start);
        assert_eq!(state, ConnectionState::Closed);
        assert!(actions.is_empty());
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let (state, actions) = ConnectionState::Idle.on_event(Event::TransportConnected);
        assert_eq!(state, ConnectionState::Idle);
        assert!(actions.is_empty());
    }

    // ===========================================
    // Backoff
    // ===========================================

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.base_delay(1), Duration::from_millis(500));
        assert_eq!(cfg.base_delay(2), Duration::from_secs(1));
        assert_eq!(cfg.base_delay(3), Duration::from_secs(2));
        assert_eq!(cfg.base_delay(20), Duration::from_secs(30));
        assert_eq!(cfg.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_is_bounded() {
        let cfg = BackoffConfig::default();
        for _ in 0..100 {
            let d = cfg.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let cfg = BackoffConfig {
            jitter: Duration::ZERO,
            ..BackoffConfig::default()
        };
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_secs(1));
    }
}
