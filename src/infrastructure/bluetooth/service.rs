//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, sessions and single GATT
//! operations on behalf of the application.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::domain::filter::ScanFilter;
use crate::domain::models::{
    AppEvent, BondState, Identity, ItemOperation, MessageSeverity, PeripheralSnapshot,
    StatusMessage, WriteType,
};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    connection::ConnectionConfig,
    peripheral::Peripheral,
    protocol::to_hex,
    registry::SessionRegistry,
    scanner::{BleScanner, Sightings},
    session::{self, Session, SessionContext},
    transport::Radio,
    BleError,
};

/// What a toggle request did.
#[derive(Clone)]
pub enum ToggleAction {
    /// A new session was opened.
    Connecting(Arc<Session>),
    /// The live session was asked to disconnect.
    Disconnecting(Arc<Session>),
}

/// Main Bluetooth service coordinating all BLE operations
pub struct CentralService {
    radio: Arc<dyn Radio>,
    registry: Arc<SessionRegistry>,
    scanner: BleScanner,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
}

impl CentralService {
    /// Create a new Bluetooth service
    pub fn new(
        radio: Arc<dyn Radio>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            scanner: BleScanner::new(radio.clone(), registry.clone(), event_sender.clone()),
            radio,
            registry,
            event_sender,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Configuration snapshot taken from the current settings.
    pub fn connection_config(&self) -> ConnectionConfig {
        let settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        ConnectionConfig::from_settings(settings.get())
    }

    fn scan_window(&self) -> Option<Duration> {
        let settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        settings.get().scan_window_ms.map(Duration::from_millis)
    }

    /// Start scanning with the configured window
    pub async fn start_scan(&self, filter: ScanFilter) -> Result<Sightings, BleError> {
        let window = self.scan_window();
        self.scanner.start(filter, window).await
    }

    pub async fn start_scan_with_window(
        &self,
        filter: ScanFilter,
        window: Option<Duration>,
    ) -> Result<Sightings, BleError> {
        self.scanner.start(filter, window).await
    }

    /// Stop scanning
    pub async fn stop_scan(&self) {
        self.scanner.stop().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanner.watch_scanning()
    }

    /// Connect if idle, disconnect if a session is connecting or connected.
    ///
    /// A session that is already closing counts as idle: the toggle waits for
    /// it to finish and then opens a new one.
    pub async fn toggle_connection(&self, identity: &Identity) -> Result<ToggleAction, BleError> {
        loop {
            if let Some(session) = self.registry.resolve(identity) {
                if !session.is_ending() {
                    info!("{} already has a session, disconnecting", identity);
                    session.request_disconnect();
                    return Ok(ToggleAction::Disconnecting(session));
                }
                info!("Session for {} is closing, reconnecting once it has ended", identity);
                session.closed().await;
            }
            match self.connect(identity) {
                Ok(session) => return Ok(ToggleAction::Connecting(session)),
                // Lost a race with another connect: look at that session.
                Err(BleError::AlreadyActive(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a session for `identity`. Fails with [`BleError::AlreadyActive`] when
    /// one is live.
    pub fn connect(&self, identity: &Identity) -> Result<Arc<Session>, BleError> {
        let (peripheral, created) = self.registry.track(identity, None, &self.event_sender);
        if created {
            let _ = self
                .event_sender
                .send(AppEvent::PeripheralDiscovered(peripheral.snapshot()));
        }

        let context = SessionContext {
            radio: self.radio.clone(),
            registry: self.registry.clone(),
            event_sender: self.event_sender.clone(),
            config: self.connection_config(),
        };
        session::open(context, peripheral).map_err(|e| {
            warn!("{}", e);
            let _ = self.event_sender.send(AppEvent::Error(e.notice(Some(identity))));
            e
        })
    }

    /// Disconnect `identity`. Does nothing when it has no live session.
    pub fn disconnect(&self, identity: &Identity) -> Option<Arc<Session>> {
        let session = self.registry.resolve(identity)?;
        session.request_disconnect();
        Some(session)
    }

    pub fn session(&self, identity: &Identity) -> Option<Arc<Session>> {
        self.registry.resolve(identity)
    }

    pub fn peripheral(&self, identity: &Identity) -> Option<Arc<Peripheral>> {
        self.registry.peripheral(identity)
    }

    /// Known peripherals and their states, in the order they were first seen.
    pub fn peripherals(&self) -> Vec<PeripheralSnapshot> {
        self.registry.snapshot()
    }

    fn connected_peripheral(&self, identity: &Identity) -> Result<Arc<Peripheral>, BleError> {
        let peripheral = self
            .registry
            .peripheral(identity)
            .ok_or_else(|| BleError::UnknownPeripheral(identity.clone()))?;
        if !peripheral.state().is_connected() {
            return Err(BleError::NotConnected(identity.clone()));
        }
        Ok(peripheral)
    }

    fn operation_timeout(&self) -> Duration {
        self.connection_config().operation_timeout
    }

    /// Bond with a connected peripheral.
    pub async fn create_bond(&self, identity: &Identity) -> Result<(), BleError> {
        let peripheral = self.connected_peripheral(identity)?;
        if peripheral.bond_state() == BondState::Bonded {
            return Ok(());
        }

        info!("Bonding with {}...", identity);
        peripheral.set_bond_state(BondState::Bonding);
        let result = match timeout(self.operation_timeout(), self.radio.create_bond(identity)).await {
            Ok(result) => result,
            Err(_) => Err(BleError::Timeout),
        };
        match result {
            Ok(()) => {
                peripheral.set_bond_state(BondState::Bonded);
                self.send_log(&format!("Bonded with {}", identity), MessageSeverity::Success);
                Ok(())
            }
            Err(e) => {
                warn!("Bonding with {} failed: {}", identity, e);
                peripheral.set_bond_state(BondState::NotBonded);
                self.send_log(
                    &format!("Bonding with {} failed: {}", identity, e),
                    MessageSeverity::Warning,
                );
                Err(e)
            }
        }
    }

    pub async fn remove_bond(&self, identity: &Identity) -> Result<(), BleError> {
        let peripheral = self
            .registry
            .peripheral(identity)
            .ok_or_else(|| BleError::UnknownPeripheral(identity.clone()))?;
        match timeout(self.operation_timeout(), self.radio.remove_bond(identity)).await {
            Ok(Ok(())) => {
                peripheral.set_bond_state(BondState::NotBonded);
                info!("Removed bond with {}", identity);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BleError::Timeout),
        }
    }

    /// Drop the radio's service cache; a new discovery pass follows.
    pub async fn clear_cache(&self, identity: &Identity) -> Result<(), BleError> {
        self.connected_peripheral(identity)?;
        info!("Clearing GATT cache of {}", identity);
        match timeout(self.operation_timeout(), self.radio.refresh_cache(identity)).await {
            Ok(result) => result,
            Err(_) => Err(BleError::Timeout),
        }
    }

    /// Read one characteristic.
    pub async fn read(&self, identity: &Identity, handle: u16) -> Result<Vec<u8>, BleError> {
        self.connected_peripheral(identity)?;
        let value = self
            .item_operation(identity, ItemOperation::Read, handle, self.radio.read(identity, handle))
            .await?;
        info!("Read {} from {} [{:#06x}]", to_hex(&value), identity, handle);
        Ok(value)
    }

    /// Write one characteristic.
    pub async fn write(
        &self,
        identity: &Identity,
        handle: u16,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        self.connected_peripheral(identity)?;
        info!("Writing {} to {} [{:#06x}]", to_hex(value), identity, handle);
        self.item_operation(
            identity,
            ItemOperation::Write,
            handle,
            self.radio.write(identity, handle, value, write_type),
        )
        .await
    }

    async fn item_operation<T>(
        &self,
        identity: &Identity,
        operation: ItemOperation,
        handle: u16,
        request: impl std::future::Future<Output = Result<T, BleError>>,
    ) -> Result<T, BleError> {
        let reason = match timeout(self.operation_timeout(), request).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => BleError::Timeout.to_string(),
        };
        let err = BleError::ItemOperationFailed {
            identity: identity.clone(),
            operation,
            handle,
            reason,
        };
        warn!("{}", err);
        let _ = self.event_sender.send(AppEvent::Error(err.notice(Some(identity))));
        Err(err)
    }

    /// Stop scanning and end every live session.
    pub async fn shutdown(&self) {
        self.scanner.stop().await;
        let sessions: Vec<Arc<Session>> = self
            .registry
            .peripherals()
            .iter()
            .filter_map(|p| self.registry.resolve(p.identity()))
            .collect();
        for session in &sessions {
            session.request_disconnect();
        }
        for session in sessions {
            session.closed().await;
        }
        info!("Central shut down");
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::simulated::{blinky_peripheral, SimRadio};

    fn service() -> (Arc<SimRadio>, CentralService, mpsc::UnboundedReceiver<AppEvent>) {
        let radio = Arc::new(SimRadio::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(Settings::default())));
        (radio.clone(), CentralService::new(radio, tx, settings), rx)
    }

    async fn connect(service: &CentralService, identity: &Identity) -> Arc<Session> {
        let session = service.connect(identity).unwrap();
        let peripheral = session.peripheral().clone();
        peripheral
            .watch_services()
            .wait_for(|s| s.is_some())
            .await
            .unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_connects_then_disconnects() {
        let (radio, service, _events) = service();
        let identity = Identity::le("40:00:00:00:00:01");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));

        let ToggleAction::Connecting(session) = service.toggle_connection(&identity).await.unwrap() else {
            panic!("first toggle must connect");
        };
        session
            .peripheral()
            .watch_connected()
            .wait_for(|c| *c)
            .await
            .unwrap();

        let second = service.toggle_connection(&identity).await.unwrap();
        let ToggleAction::Disconnecting(session) = second else {
            panic!("second toggle must disconnect");
        };
        session.closed().await;
        assert!(service.session(&identity).is_none());
        assert_eq!(radio.connect_attempts(&identity), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_while_closing_reconnects() {
        let (radio, service, _events) = service();
        let identity = Identity::le("40:00:00:00:00:05");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));

        let first = connect(&service, &identity).await;
        first.request_disconnect();
        first
            .peripheral()
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        // Still inside the teardown grace delay.
        assert!(!first.is_closed());
        assert!(service.session(&identity).is_some());

        let ToggleAction::Connecting(second) = service.toggle_connection(&identity).await.unwrap()
        else {
            panic!("toggle on a closing session must connect");
        };
        assert!(first.is_closed());
        assert!(!Arc::ptr_eq(&first, &second));

        second
            .peripheral()
            .watch_connected()
            .wait_for(|c| *c)
            .await
            .unwrap();
        assert_eq!(radio.connect_attempts(&identity), 2);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_write_and_bond() {
        let (radio, service, _events) = service();
        let identity = Identity::le("40:00:00:00:00:02");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        let session = connect(&service, &identity).await;

        service
            .write(&identity, 0x0015, &[0x01], WriteType::WithResponse)
            .await
            .unwrap();
        assert_eq!(service.read(&identity, 0x0015).await.unwrap(), vec![0x01]);
        assert_eq!(radio.writes(&identity, 0x0015), vec![vec![0x01]]);

        let err = service.read(&identity, 0x0099).await.unwrap_err();
        assert_eq!(err.kind(), crate::domain::models::ErrorKind::ItemOperationFailed);

        service.create_bond(&identity).await.unwrap();
        assert_eq!(session.peripheral().bond_state(), BondState::Bonded);
        service.remove_bond(&identity).await.unwrap();
        assert_eq!(session.peripheral().bond_state(), BondState::NotBonded);

        service.shutdown().await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_requires_connection() {
        let (radio, service, _events) = service();
        let identity = Identity::le("40:00:00:00:00:03");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));

        assert_eq!(
            service.create_bond(&identity).await,
            Err(BleError::UnknownPeripheral(identity.clone()))
        );
        let session = connect(&service, &identity).await;
        radio.set_bond_error(&identity, Some("pairing rejected"));
        assert!(service.create_bond(&identity).await.is_err());
        assert_eq!(session.peripheral().bond_state(), BondState::NotBonded);

        service.disconnect(&identity);
        session.closed().await;
        assert_eq!(
            service.create_bond(&identity).await,
            Err(BleError::NotConnected(identity.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_triggers_rediscovery() {
        let (radio, service, mut events) = service();
        let identity = Identity::le("40:00:00:00:00:04");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        let session = connect(&service, &identity).await;

        service.clear_cache(&identity).await.unwrap();
        let mut passes = Vec::new();
        while passes.len() < 2 {
            if let Some(AppEvent::DiscoveryCompleted { report, .. }) = events.recv().await {
                passes.push(report.pass);
            }
        }
        assert_eq!(passes, vec![1, 2]);

        service.disconnect(&identity);
        session.closed().await;
    }
}
