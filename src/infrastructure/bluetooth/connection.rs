//! BLE Connection Module
//!
//! Drives the `Connecting` part of the state machine: per-attempt deadlines,
//! bounded retry with a fixed delay, and cancellation by a disconnect request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{error, info, trace, warn};

use crate::domain::models::{
    AppEvent, ConnectionPriority, ConnectionState, MessageSeverity, Phy, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::domain::state_machine::{ConnectionEvent, ConnectionMachine};

use super::peripheral::Peripheral;
use super::transport::{ConnectOptions, LinkInfo, Radio};
use super::BleError;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline of a single connection attempt
    pub timeout: Duration,
    /// Attempts before giving up (at least one)
    pub max_attempts: u32,
    /// Delay between a failed attempt and the next one
    pub retry_delay: Duration,
    pub preferred_phy: Phy,
    /// How long to wait for the radio to confirm a disconnect
    pub disconnect_timeout: Duration,
    /// Time workers get to flush their last events before a session is torn down
    pub teardown_grace: Duration,
    /// Bound on every single GATT operation
    pub operation_timeout: Duration,
    pub request_highest_mtu: bool,
    pub connection_priority: ConnectionPriority,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.connect_timeout_ms),
            max_attempts: settings.connect_max_attempts.max(1),
            retry_delay: Duration::from_millis(settings.connect_retry_delay_ms),
            preferred_phy: settings.preferred_phy,
            disconnect_timeout: Duration::from_millis(settings.disconnect_timeout_ms),
            teardown_grace: Duration::from_millis(settings.teardown_grace_ms),
            operation_timeout: Duration::from_millis(settings.operation_timeout_ms),
            request_highest_mtu: settings.request_highest_mtu,
            connection_priority: settings.connection_priority,
        }
    }
}

/// How a connect sequence ended.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(LinkInfo),
    /// A disconnect request arrived first; the machine is `Disconnecting`.
    Cancelled,
    /// Every attempt failed; the machine is back to `Disconnected`.
    Failed(BleError),
}

/// BLE Connection handler
pub struct BleConnection {
    radio: Arc<dyn Radio>,
    peripheral: Arc<Peripheral>,
    config: ConnectionConfig,
}

impl BleConnection {
    pub fn new(radio: Arc<dyn Radio>, peripheral: Arc<Peripheral>, config: ConnectionConfig) -> Self {
        Self {
            radio,
            peripheral,
            config,
        }
    }

    /// Run connection attempts until one succeeds, the attempt budget is spent
    /// or `disconnect` is raised.
    pub async fn establish(
        &self,
        machine: &mut ConnectionMachine,
        disconnect: &mut watch::Receiver<bool>,
    ) -> ConnectOutcome {
        let identity = self.peripheral.identity().clone();
        let options = ConnectOptions {
            preferred_phy: self.config.preferred_phy,
            timeout: self.config.timeout,
        };

        self.send_log(&format!("Connecting to {}...", identity), MessageSeverity::Info);
        transition(
            machine,
            &self.peripheral,
            ConnectionEvent::ConnectRequested {
                deadline: Instant::now() + self.config.timeout,
            },
        );

        loop {
            let Some(attempt) = machine.attempt() else {
                return ConnectOutcome::Cancelled;
            };
            let deadline = match machine.state() {
                ConnectionState::Connecting { deadline, .. } => deadline,
                _ => return ConnectOutcome::Cancelled,
            };
            info!(
                "Connecting to {} (attempt {}/{})",
                identity,
                attempt,
                machine.max_attempts()
            );

            let result = tokio::select! {
                biased;
                _ = requested(disconnect) => None,
                result = timeout_at(deadline, self.radio.connect(&identity, &options)) => Some(result),
            };

            let reason = match result {
                None => {
                    info!("Connection to {} cancelled", identity);
                    transition(machine, &self.peripheral, ConnectionEvent::DisconnectRequested);
                    return ConnectOutcome::Cancelled;
                }
                Some(Ok(Ok(link))) => {
                    info!("Connected to {} ({}, mtu {})", identity, link.phy, link.mtu);
                    self.send_log(&format!("Connected to {}", identity), MessageSeverity::Success);
                    transition(
                        machine,
                        &self.peripheral,
                        ConnectionEvent::AttemptSucceeded {
                            phy: link.phy,
                            mtu: link.mtu,
                        },
                    );
                    return ConnectOutcome::Connected(link);
                }
                Some(Ok(Err(e))) => e.to_string(),
                Some(Err(_)) => BleError::Timeout.to_string(),
            };

            warn!(
                "Connection attempt {} to {} failed: {}",
                attempt, identity, reason
            );

            if !machine.has_attempts_left() {
                transition(
                    machine,
                    &self.peripheral,
                    ConnectionEvent::AttemptFailed {
                        next_deadline: Instant::now(),
                    },
                );
                return ConnectOutcome::Failed(BleError::ConnectFailed {
                    identity,
                    attempts: attempt,
                    reason,
                });
            }

            info!("Retrying in {:?}...", self.config.retry_delay);
            let cancelled = tokio::select! {
                biased;
                _ = requested(disconnect) => true,
                _ = sleep(self.config.retry_delay) => false,
            };
            if cancelled {
                info!("Connection to {} cancelled during retry delay", identity);
                transition(machine, &self.peripheral, ConnectionEvent::DisconnectRequested);
                return ConnectOutcome::Cancelled;
            }
            transition(
                machine,
                &self.peripheral,
                ConnectionEvent::AttemptFailed {
                    next_deadline: Instant::now() + self.config.timeout,
                },
            );
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.peripheral.emit(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Apply `event` and publish the resulting state on the peripheral.
pub(crate) fn transition(
    machine: &mut ConnectionMachine,
    peripheral: &Peripheral,
    event: ConnectionEvent,
) {
    match machine.apply(event) {
        Ok(Some(state)) => peripheral.set_state(state),
        Ok(None) => trace!("{:?} ignored for {}", event, peripheral.identity()),
        Err(e) => error!("{}: {}", peripheral.identity(), e),
    }
}

/// Resolves once a disconnect was requested. Never resolves if the request
/// handle is gone.
pub(crate) async fn requested(disconnect: &mut watch::Receiver<bool>) {
    loop {
        let raised = *disconnect.borrow_and_update();
        if raised {
            return;
        }
        if disconnect.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
