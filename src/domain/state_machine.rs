//! Per-peripheral connection state machine.
//!
//! ```text
//! Disconnected --connect--> Connecting(1) --ok--> Connected --disconnect/link loss--> Disconnecting
//!       ^                     |    ^  |                                                   |
//!       |                     |    +--+ failure, attempts left (after retry delay)        |
//!       +------ failure, no attempts left                                                 |
//!       +------------------------------------------ ack or timeout ----------------------+
//! ```
//!
//! A disconnect request while `Connecting` aborts the pending attempt and moves
//! to `Disconnecting`.

use crate::domain::models::{ConnectionState, PhyInUse};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested { deadline: Instant },
    AttemptSucceeded { phy: PhyInUse, mtu: u16 },
    /// The current attempt failed or its deadline elapsed. `next_deadline` is used
    /// when another attempt is still allowed.
    AttemptFailed { next_deadline: Instant },
    DisconnectRequested,
    LinkLost,
    DisconnectCompleted,
}

impl ConnectionEvent {
    fn label(&self) -> &'static str {
        match self {
            Self::ConnectRequested { .. } => "connect requested",
            Self::AttemptSucceeded { .. } => "attempt succeeded",
            Self::AttemptFailed { .. } => "attempt failed",
            Self::DisconnectRequested => "disconnect requested",
            Self::LinkLost => "link lost",
            Self::DisconnectCompleted => "disconnect completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event} while {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    max_attempts: u32,
}

impl ConnectionMachine {
    /// `max_attempts` is clamped to at least one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempt number of the pending connect, if any.
    pub fn attempt(&self) -> Option<u32> {
        match self.state {
            ConnectionState::Connecting { attempt, .. } => Some(attempt),
            _ => None,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt()
            .map(|attempt| attempt < self.max_attempts)
            .unwrap_or(false)
    }

    /// Applies `event`. Returns the new state, or `None` when the event is an
    /// accepted no-op (e.g. disconnecting an already disconnected peripheral).
    pub fn apply(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<Option<ConnectionState>, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self.state, event) {
            (S::Disconnected, E::ConnectRequested { deadline }) => S::Connecting {
                attempt: 1,
                deadline,
            },
            (S::Connecting { .. }, E::AttemptSucceeded { phy, mtu }) => S::Connected { phy, mtu },
            (S::Connecting { attempt, .. }, E::AttemptFailed { next_deadline }) => {
                if attempt < self.max_attempts {
                    S::Connecting {
                        attempt: attempt + 1,
                        deadline: next_deadline,
                    }
                } else {
                    S::Disconnected
                }
            }
            (S::Connecting { .. }, E::DisconnectRequested) => S::Disconnecting,
            (S::Connected { .. }, E::DisconnectRequested | E::LinkLost) => S::Disconnecting,
            (S::Disconnecting, E::DisconnectCompleted) => S::Disconnected,

            (S::Disconnected, E::DisconnectRequested | E::LinkLost | E::DisconnectCompleted)
            | (S::Disconnecting, E::DisconnectRequested | E::LinkLost)
            | (S::Connecting { .. }, E::LinkLost) => return Ok(None),

            (from, event) => {
                return Err(InvalidTransition {
                    from: from.label(),
                    event: event.label(),
                })
            }
        };

        self.state = next;
        Ok(Some(next))
    }
}

/// Whether `to` may directly follow `from` in an observed state sequence.
pub fn is_valid_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState as S;

    match (from, to) {
        (S::Disconnected, S::Connecting { attempt, .. }) => *attempt == 1,
        (S::Connecting { attempt: a, .. }, S::Connecting { attempt: b, .. }) => *b == a + 1,
        (S::Connecting { .. }, S::Connected { .. } | S::Disconnected | S::Disconnecting) => true,
        (S::Connected { .. }, S::Disconnecting) => true,
        (S::Disconnecting, S::Disconnected) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Phy;
    use std::time::Duration;

    fn link() -> ConnectionEvent {
        ConnectionEvent::AttemptSucceeded {
            phy: PhyInUse::symmetric(Phy::Le2M),
            mtu: 23,
        }
    }

    fn failed() -> ConnectionEvent {
        ConnectionEvent::AttemptFailed {
            next_deadline: Instant::now() + Duration::from_secs(3),
        }
    }

    fn requested() -> ConnectionEvent {
        ConnectionEvent::ConnectRequested {
            deadline: Instant::now() + Duration::from_secs(3),
        }
    }

    fn run(machine: &mut ConnectionMachine, events: &[ConnectionEvent]) -> Vec<ConnectionState> {
        let mut path = vec![machine.state()];
        for event in events {
            if let Some(state) = machine.apply(*event).unwrap() {
                path.push(state);
            }
        }
        path
    }

    fn assert_valid_path(path: &[ConnectionState]) {
        for pair in path.windows(2) {
            assert!(
                is_valid_transition(&pair[0], &pair[1]),
                "illegal jump {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_retry_then_success() {
        let mut machine = ConnectionMachine::new(2);
        let path = run(&mut machine, &[requested(), failed(), link()]);

        let labels: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            labels,
            vec![
                "Disconnected",
                "Connecting (attempt 1)",
                "Connecting (attempt 2)",
                "Connected (tx LE 2M / rx LE 2M, mtu 23)"
            ]
        );
        assert_valid_path(&path);
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut machine = ConnectionMachine::new(2);
        machine.apply(requested()).unwrap();
        assert!(machine.has_attempts_left());
        machine.apply(failed()).unwrap();
        assert!(!machine.has_attempts_left());
        let state = machine.apply(failed()).unwrap();
        assert_eq!(state, Some(ConnectionState::Disconnected));
    }

    #[test]
    fn test_disconnect_paths() {
        let mut machine = ConnectionMachine::new(1);
        let path = run(
            &mut machine,
            &[
                requested(),
                link(),
                ConnectionEvent::LinkLost,
                ConnectionEvent::DisconnectRequested,
                ConnectionEvent::DisconnectCompleted,
            ],
        );
        assert_eq!(path.len(), 5);
        assert_valid_path(&path);

        // Aborting a pending attempt.
        let path = run(
            &mut machine,
            &[
                requested(),
                ConnectionEvent::DisconnectRequested,
                ConnectionEvent::DisconnectCompleted,
            ],
        );
        assert_eq!(path.last(), Some(&ConnectionState::Disconnected));
        assert_valid_path(&path);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut machine = ConnectionMachine::new(1);
        assert_eq!(machine.apply(ConnectionEvent::DisconnectRequested), Ok(None));
        assert_eq!(machine.apply(ConnectionEvent::DisconnectRequested), Ok(None));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_illegal_events_rejected() {
        let mut machine = ConnectionMachine::new(1);
        assert!(machine.apply(link()).is_err());
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        machine.apply(requested()).unwrap();
        let err = machine.apply(requested()).unwrap_err();
        assert_eq!(err.from, "Connecting");
        assert_eq!(err.event, "connect requested");
    }

    #[test]
    fn test_direct_jump_is_invalid() {
        let connected = ConnectionState::Connected {
            phy: PhyInUse::symmetric(Phy::Le1M),
            mtu: 23,
        };
        assert!(!is_valid_transition(&ConnectionState::Disconnected, &connected));
        assert!(!is_valid_transition(&connected, &ConnectionState::Disconnected));
        assert!(!is_valid_transition(
            &ConnectionState::Disconnected,
            &ConnectionState::Connecting {
                attempt: 2,
                deadline: Instant::now()
            }
        ));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(ConnectionMachine::new(0).max_attempts(), 1);
    }
}
