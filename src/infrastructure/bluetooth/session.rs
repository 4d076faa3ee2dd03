//! Session handle and supervisor
//!
//! A [`Session`] binds one peripheral to one supervisor task. The supervisor
//! owns the connection state machine and the session's [`TaskScope`]: once the
//! link is up it starts the PHY observer, the connection-parameter worker and
//! the discovery driver, and it tears all of them down together when the link
//! ends.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::domain::models::{
    AppEvent, ConnectionParameters, ConnectionState, Identity, MessageSeverity, StatusMessage,
    WriteType,
};
use crate::domain::state_machine::{ConnectionEvent, ConnectionMachine};

use super::connection::{requested, transition, BleConnection, ConnectOutcome, ConnectionConfig};
use super::discovery::DiscoveryEngine;
use super::peripheral::Peripheral;
use super::protocol::{max_write_length, MAX_ATT_MTU};
use super::registry::SessionRegistry;
use super::scope::TaskScope;
use super::transport::{LinkEvent, LinkInfo, Radio};
use super::{report_error, BleError};

pub struct Session {
    peripheral: Arc<Peripheral>,
    disconnect: watch::Sender<bool>,
    ending: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(peripheral: Arc<Peripheral>) -> Self {
        Self {
            peripheral,
            disconnect: watch::channel(false).0,
            ending: watch::channel(false).0,
            closed: watch::channel(false).0,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.peripheral.identity()
    }

    pub fn peripheral(&self) -> &Arc<Peripheral> {
        &self.peripheral
    }

    pub fn state(&self) -> ConnectionState {
        self.peripheral.state()
    }

    /// Ask the supervisor to end the session. Returns `false` if a request was
    /// already pending.
    pub fn request_disconnect(&self) -> bool {
        !self.disconnect.send_replace(true)
    }

    /// True once the session is on its way down: a disconnect was requested,
    /// the link was lost or connecting failed. It stays registered until
    /// [`Session::closed`] resolves.
    pub fn is_ending(&self) -> bool {
        *self.disconnect.borrow() || *self.ending.borrow()
    }

    /// True once the supervisor has finished and the session left the registry.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the supervisor has finished.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Everything a supervisor needs besides its session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub radio: Arc<dyn Radio>,
    pub registry: Arc<SessionRegistry>,
    pub event_sender: mpsc::UnboundedSender<AppEvent>,
    pub config: ConnectionConfig,
}

/// Register a new session for `peripheral` and start its supervisor.
///
/// Fails with [`BleError::AlreadyActive`] when the identity already has one.
pub(crate) fn open(
    context: SessionContext,
    peripheral: Arc<Peripheral>,
) -> Result<Arc<Session>, BleError> {
    let session = Arc::new(Session::new(peripheral));
    context.registry.register(session.clone())?;

    let supervisor = Supervisor {
        context,
        session: session.clone(),
    };
    tokio::spawn(supervisor.run());
    Ok(session)
}

struct Supervisor {
    context: SessionContext,
    session: Arc<Session>,
}

impl Supervisor {
    fn identity(&self) -> &Identity {
        self.session.identity()
    }

    fn peripheral(&self) -> &Arc<Peripheral> {
        self.session.peripheral()
    }

    async fn run(self) {
        let config = &self.context.config;
        let mut machine = ConnectionMachine::new(config.max_attempts);
        let mut disconnect = self.session.disconnect.subscribe();
        let mut scope = TaskScope::new(format!("session {}", self.identity()));
        // Subscribe before connecting so no link event can slip past.
        let mut link_events = self.context.radio.link_events(self.identity());

        let connection = BleConnection::new(
            self.context.radio.clone(),
            self.peripheral().clone(),
            config.clone(),
        );

        match connection.establish(&mut machine, &mut disconnect).await {
            ConnectOutcome::Connected(link) => {
                self.start_workers(&mut scope, link);
                self.peripheral().set_connected(true);

                let requested = self.supervise(&mut disconnect, &mut link_events).await;
                self.close_link(&mut machine, requested).await;

                // Let workers flush their last events before they are cancelled.
                sleep(config.teardown_grace).await;
                self.peripheral().set_connected(false);
                scope.shutdown().await;
            }
            ConnectOutcome::Cancelled => {
                self.close_link(&mut machine, true).await;
                scope.shutdown().await;
            }
            ConnectOutcome::Failed(err) => {
                self.session.ending.send_replace(true);
                scope.shutdown().await;
                error!("{}", err);
                report_error(&self.context.event_sender, &err, Some(self.identity()));
            }
        }

        self.peripheral().reset_link();
        self.context.registry.unregister_session(&self.session);
        self.session.closed.send_replace(true);
        info!("Session for {} closed", self.identity());
    }

    fn start_workers(&self, scope: &mut TaskScope, link: LinkInfo) {
        let peripheral = self.peripheral().clone();
        peripheral.set_phy(link.phy);
        peripheral.set_mtu(link.mtu);

        let radio = self.context.radio.clone();
        let identity = self.identity().clone();

        scope.spawn(
            "phy observer",
            observe_phy(peripheral.clone(), radio.link_events(&identity)),
        );
        scope.spawn(
            "connection parameters",
            negotiate_parameters(
                radio.clone(),
                peripheral.clone(),
                self.context.config.clone(),
                radio.link_events(&identity),
            ),
        );

        let discovery = DiscoveryEngine::new(
            radio.clone(),
            peripheral,
            self.context.config.operation_timeout,
        );
        scope.spawn("discovery", discovery.run(radio.link_events(&identity)));
    }

    /// Wait for the end of the link. Returns `true` when it was requested locally.
    async fn supervise(
        &self,
        disconnect: &mut watch::Receiver<bool>,
        link_events: &mut broadcast::Receiver<LinkEvent>,
    ) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = requested(disconnect) => return true,
                event = link_events.recv() => match event {
                    Ok(LinkEvent::LinkLost { reason }) => {
                        warn!("Link to {} lost: {}", self.identity(), reason);
                        return false;
                    }
                    Ok(LinkEvent::BondStateChanged(state)) => {
                        self.peripheral().set_bond_state(state);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Supervisor of {} missed {} link event(s)", self.identity(), missed);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Link events of {} closed; treating as link loss", self.identity());
                        return false;
                    }
                }
            }
        }
    }

    /// Drive the machine through `Disconnecting` to `Disconnected`. Local state
    /// ends up `Disconnected` even when the radio never confirms.
    async fn close_link(&self, machine: &mut ConnectionMachine, requested: bool) {
        self.session.ending.send_replace(true);
        let identity = self.identity().clone();
        let event = if requested {
            ConnectionEvent::DisconnectRequested
        } else {
            ConnectionEvent::LinkLost
        };
        transition(machine, self.peripheral(), event);

        let mut failure = None;
        if requested {
            info!("Disconnecting from {}...", identity);
            let result = timeout(
                self.context.config.disconnect_timeout,
                self.context.radio.disconnect(&identity),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e.to_string()),
                Err(_) => failure = Some(BleError::Timeout.to_string()),
            }
        }

        transition(machine, self.peripheral(), ConnectionEvent::DisconnectCompleted);

        match failure {
            Some(reason) => {
                let err = BleError::DisconnectFailed { identity, reason };
                warn!("{}", err);
                report_error(&self.context.event_sender, &err, Some(self.identity()));
            }
            None => {
                info!("Disconnected from {}", identity);
                let _ = self.context.event_sender.send(AppEvent::LogMessage(StatusMessage {
                    message: format!("Disconnected from {}", identity),
                    severity: MessageSeverity::Info,
                }));
            }
        }
    }
}

async fn observe_phy(peripheral: Arc<Peripheral>, mut link_events: broadcast::Receiver<LinkEvent>) {
    loop {
        match link_events.recv().await {
            Ok(LinkEvent::PhyUpdated(phy)) => peripheral.set_phy(phy),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

/// Negotiate link parameters once, then follow parameter updates.
async fn negotiate_parameters(
    radio: Arc<dyn Radio>,
    peripheral: Arc<Peripheral>,
    config: ConnectionConfig,
    mut link_events: broadcast::Receiver<LinkEvent>,
) {
    let identity = peripheral.identity().clone();
    let bound = config.operation_timeout;

    if config.request_highest_mtu {
        match timeout(bound, radio.request_mtu(&identity, MAX_ATT_MTU)).await {
            Ok(Ok(mtu)) => {
                peripheral.set_mtu(mtu);
                info!(
                    "Max write length of {}: {} bytes",
                    identity,
                    max_write_length(mtu, WriteType::WithoutResponse)
                );
            }
            Ok(Err(e)) => warn!("MTU request on {} failed: {}", identity, e),
            Err(_) => warn!("MTU request on {} timed out", identity),
        }
    }

    match timeout(bound, radio.read_rssi(&identity)).await {
        Ok(Ok(rssi)) => info!("RSSI of {}: {} dBm", identity, rssi),
        Ok(Err(e)) => warn!("RSSI read on {} failed: {}", identity, e),
        Err(_) => warn!("RSSI read on {} timed out", identity),
    }

    match timeout(bound, radio.read_phy(&identity)).await {
        Ok(Ok(phy)) => peripheral.set_phy(phy),
        Ok(Err(e)) => warn!("PHY read on {} failed: {}", identity, e),
        Err(_) => warn!("PHY read on {} timed out", identity),
    }

    let priority = config.connection_priority;
    match timeout(bound, radio.request_connection_priority(&identity, priority)).await {
        Ok(Ok(parameters)) => publish_parameters(&peripheral, parameters),
        Ok(Err(e)) => warn!("Connection priority request on {} failed: {}", identity, e),
        Err(_) => warn!("Connection priority request on {} timed out", identity),
    }

    loop {
        match link_events.recv().await {
            Ok(LinkEvent::ParametersUpdated(parameters)) => publish_parameters(&peripheral, parameters),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

fn publish_parameters(peripheral: &Peripheral, parameters: ConnectionParameters) {
    info!(
        "Connection parameters of {}: interval {}, latency {}, timeout {}",
        peripheral.identity(),
        parameters.interval,
        parameters.latency,
        parameters.supervision_timeout
    );
    peripheral.emit(AppEvent::ConnectionParametersChanged {
        identity: peripheral.identity().clone(),
        parameters,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BondState, ErrorKind, Phy, PhyInUse};
    use crate::infrastructure::bluetooth::simulated::{blinky_peripheral, SimConnect, SimRadio};
    use std::time::Duration;

    struct Harness {
        radio: Arc<SimRadio>,
        registry: Arc<SessionRegistry>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        context: SessionContext,
    }

    fn harness() -> Harness {
        let radio = Arc::new(SimRadio::new());
        let registry = Arc::new(SessionRegistry::new());
        let (tx, events) = mpsc::unbounded_channel();
        let context = SessionContext {
            radio: radio.clone(),
            registry: registry.clone(),
            event_sender: tx,
            config: ConnectionConfig::default(),
        };
        Harness {
            radio,
            registry,
            events,
            context,
        }
    }

    fn states(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::ConnectionStateChanged { state, .. } = event {
                out.push(state.to_string());
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_tears_down_workers() {
        let mut h = harness();
        let identity = Identity::le("20:00:00:00:00:01");
        h.radio
            .add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        let (peripheral, _) = h.registry.track(&identity, None, &h.context.event_sender);

        let session = open(h.context.clone(), peripheral.clone()).unwrap();
        let mut connected = peripheral.watch_connected();
        connected.wait_for(|c| *c).await.unwrap();
        let mut services = peripheral.watch_services();
        services.wait_for(|s| s.is_some()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(peripheral.mtu(), 247);
        assert_eq!(peripheral.phy(), Some(PhyInUse::symmetric(Phy::Le2M)));

        h.radio.emit(&identity, LinkEvent::BondStateChanged(BondState::Bonded));
        h.radio.drop_link(&identity, "supervision timeout");
        session.closed().await;

        assert!(!peripheral.is_connected());
        assert_eq!(peripheral.bond_state(), BondState::Bonded);
        assert_eq!(peripheral.state(), ConnectionState::Disconnected);
        assert_eq!(h.radio.subscriber_count(&identity), 0);
        assert_eq!(h.radio.disconnect_calls(&identity), 0);
        assert!(h.registry.resolve(&identity).is_none());
        assert_eq!(
            states(&mut h.events),
            vec![
                "Connecting (attempt 1)",
                "Connected (tx LE 2M / rx LE 2M, mtu 23)",
                "Disconnecting",
                "Disconnected"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connecting() {
        let mut h = harness();
        let identity = Identity::le("20:00:00:00:00:02");
        h.radio.script_connect(&identity, vec![SimConnect::Hang]);
        let (peripheral, _) = h.registry.track(&identity, None, &h.context.event_sender);

        let session = open(h.context.clone(), peripheral.clone()).unwrap();
        let mut state = peripheral.watch_state();
        state.wait_for(|s| s.is_active()).await.unwrap();
        assert!(session.request_disconnect());
        assert!(!session.request_disconnect());
        session.closed().await;

        assert_eq!(
            states(&mut h.events),
            vec!["Connecting (attempt 1)", "Disconnecting", "Disconnected"]
        );
        assert_eq!(h.radio.connect_attempts(&identity), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_disconnect_still_ends_session() {
        let mut h = harness();
        let identity = Identity::le("20:00:00:00:00:03");
        h.radio
            .add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        h.radio.set_disconnect_error(Some("no ack"));
        let (peripheral, _) = h.registry.track(&identity, None, &h.context.event_sender);

        let session = open(h.context.clone(), peripheral.clone()).unwrap();
        peripheral.watch_connected().wait_for(|c| *c).await.unwrap();
        session.request_disconnect();
        session.closed().await;

        assert_eq!(peripheral.state(), ConnectionState::Disconnected);
        let mut saw_failure = false;
        while let Ok(event) = h.events.try_recv() {
            if let AppEvent::Error(notice) = event {
                saw_failure |= notice.kind == ErrorKind::DisconnectFailed;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_delay_precedes_disconnected_signal() {
        let h = harness();
        let identity = Identity::le("20:00:00:00:00:04");
        h.radio
            .add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        let (peripheral, _) = h.registry.track(&identity, None, &h.context.event_sender);

        let session = open(h.context.clone(), peripheral.clone()).unwrap();
        let mut connected = peripheral.watch_connected();
        connected.wait_for(|c| *c).await.unwrap();

        let mut state = peripheral.watch_state();
        session.request_disconnect();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        let at_disconnected = tokio::time::Instant::now();
        connected.wait_for(|c| !*c).await.unwrap();
        assert_eq!(at_disconnected.elapsed(), Duration::from_millis(500));
        session.closed().await;
    }
}
