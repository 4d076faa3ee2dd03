//! Bluetooth Module
//!
//! Central-role orchestration of GATT peripherals on top of an abstract radio.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     CentralService                       │
//! │  (Main coordinator - public API for the application)     │
//! └──────┬──────────────────┬──────────────────────┬────────┘
//!        │                  │                      │
//!        ▼                  ▼                      ▼
//! ┌────────────┐   ┌─────────────────┐    ┌────────────────┐
//! │  Scanner   │──▶│ SessionRegistry │◀───│    Session     │
//! │            │   │                 │    │  (supervisor)  │
//! │ - filters  │   │ - known list    │    │ - connect/retry│
//! │ - dedup    │   │ - 1 session/id  │    │ - TaskScope    │
//! └────────────┘   └─────────────────┘    └───────┬────────┘
//!                                                 │ workers
//!                                   ┌─────────────┼─────────────┐
//!                                   ▼             ▼             ▼
//!                              PHY observer  parameters   DiscoveryEngine
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - The radio collaborator trait and its event types
//! - [`scanner`] - Deduplicating, filtered scans
//! - [`connection`] - Connect attempts with deadline and bounded retry
//! - [`session`] - Session handle and its supervisor
//! - [`scope`] - Cancellable task group shared by a session's workers
//! - [`discovery`] - Capability tree walk and subscriptions
//! - [`registry`] - Known peripherals and the at-most-one-session map
//! - [`peripheral`] - Observable peripheral handle
//! - [`protocol`] - Well-known GATT UUIDs and value helpers
//! - [`simulated`] - In-process radio for tests and demos
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod discovery;
pub mod peripheral;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod scope;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;

use crate::domain::models::{
    AppEvent, ErrorKind, ErrorNotice, Identity, ItemOperation, MessageSeverity, StatusMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;

// Re-export main service for convenience
pub use service::CentralService;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection to {identity} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        identity: Identity,
        attempts: u32,
        reason: String,
    },

    #[error("Disconnect from {identity} could not be confirmed: {reason}")]
    DisconnectFailed { identity: Identity, reason: String },

    #[error("{operation} of handle {handle:#06x} on {identity} failed: {reason}")]
    ItemOperationFailed {
        identity: Identity,
        operation: ItemOperation,
        handle: u16,
        reason: String,
    },

    #[error("A session for {0} is already active")]
    AlreadyActive(Identity),

    #[error("{0} is not connected")]
    NotConnected(Identity),

    #[error("Unknown peripheral {0}")]
    UnknownPeripheral(Identity),

    #[error("Subscription not supported")]
    SubscriptionNotSupported,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ScanFailed(_) => ErrorKind::ScanFailed,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::DisconnectFailed { .. } => ErrorKind::DisconnectFailed,
            Self::ItemOperationFailed { .. } => ErrorKind::ItemOperationFailed,
            Self::AlreadyActive(_) => ErrorKind::AlreadyActive,
            _ => ErrorKind::Other,
        }
    }

    /// Notice for observers, attributed to `identity` when the error concerns one peripheral.
    pub fn notice(&self, identity: Option<&Identity>) -> ErrorNotice {
        ErrorNotice {
            kind: self.kind(),
            identity: identity.cloned(),
            message: self.to_string(),
        }
    }
}

/// Publish `err` to observers as a terminal error notice.
pub(crate) fn report_error(
    events: &mpsc::UnboundedSender<AppEvent>,
    err: &BleError,
    identity: Option<&Identity>,
) {
    let _ = events.send(AppEvent::Error(err.notice(identity)));
    let _ = events.send(AppEvent::LogMessage(StatusMessage {
        message: err.to_string(),
        severity: MessageSeverity::Error,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let identity = Identity::le("01:02:03:04:05:06");
        let err = BleError::ItemOperationFailed {
            identity: identity.clone(),
            operation: ItemOperation::Read,
            handle: 0x2a,
            reason: "Operation timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "read of handle 0x002a on 01:02:03:04:05:06 (LE) failed: Operation timed out"
        );

        let notice = BleError::AlreadyActive(identity.clone()).notice(Some(&identity));
        assert_eq!(notice.kind, ErrorKind::AlreadyActive);
        assert_eq!(notice.identity, Some(identity));
    }
}
