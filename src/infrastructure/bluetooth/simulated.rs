//! In-process radio simulator
//!
//! A scriptable [`Radio`] that keeps every peripheral in memory. Tests and the
//! demo binary inject advertisements, script connect outcomes, and trigger
//! notifications, link loss or service invalidation on demand.

use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::domain::filter::ScanFilter;
use crate::domain::models::{
    Advertisement, CapabilityTree, Characteristic, CharacteristicProperties, ConnectionParameters,
    ConnectionPriority, Descriptor, Identity, PhyInUse, Service, WriteType,
};

use super::protocol::{
    BATTERY_LEVEL_CHAR, BATTERY_SERVICE, BUTTON_CHAR, CHARACTERISTIC_USER_DESCRIPTION,
    CLIENT_CHARACTERISTIC_CONFIGURATION, DEFAULT_ATT_MTU, LED_BUTTON_SERVICE, LED_CHAR,
};
use super::transport::{ConnectOptions, LinkEvent, LinkInfo, Radio, ScanEvent};
use super::BleError;

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SimConnect {
    Succeed,
    Fail(String),
    /// Never answer; the caller's deadline has to fire.
    Hang,
}

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    advertisement: Advertisement,
    tree: CapabilityTree,
    values: HashMap<u16, Vec<u8>>,
    max_mtu: u16,
}

impl SimPeripheral {
    pub fn new(advertisement: Advertisement) -> Self {
        Self {
            advertisement,
            tree: CapabilityTree::default(),
            values: HashMap::new(),
            max_mtu: 247,
        }
    }

    pub fn with_tree(mut self, tree: CapabilityTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_value(mut self, handle: u16, value: Vec<u8>) -> Self {
        self.values.insert(handle, value);
        self
    }

    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.advertisement.identity
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }
}

#[derive(Default)]
struct Link {
    connected: bool,
    phy: Option<PhyInUse>,
    bonded: bool,
    connect_attempts: u32,
    disconnect_calls: u32,
    script: VecDeque<SimConnect>,
    failing_reads: HashMap<u16, String>,
    bond_error: Option<String>,
    subscribers: HashMap<u16, Vec<mpsc::Sender<Vec<u8>>>>,
    writes: Vec<(u16, Vec<u8>)>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<Identity, SimPeripheral>,
    links: HashMap<Identity, Link>,
    channels: HashMap<Identity, broadcast::Sender<LinkEvent>>,
    scan_sink: Option<mpsc::Sender<ScanEvent>>,
    scan_start_error: Option<String>,
    disconnect_error: Option<String>,
    scans_started: u32,
}

impl SimState {
    fn channel(&mut self, identity: &Identity) -> &broadcast::Sender<LinkEvent> {
        self.channels
            .entry(identity.clone())
            .or_insert_with(|| broadcast::channel(32).0)
    }

    fn connected_peripheral(&self, identity: &Identity) -> Result<&SimPeripheral, BleError> {
        let connected = self
            .links
            .get(identity)
            .map(|l| l.connected)
            .unwrap_or(false);
        if !connected {
            return Err(BleError::NotConnected(identity.clone()));
        }
        self.peripherals
            .get(identity)
            .ok_or_else(|| BleError::UnknownPeripheral(identity.clone()))
    }
}

#[derive(Default)]
pub struct SimRadio {
    state: Mutex<SimState>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let mut state = self.lock();
        state.links.entry(peripheral.identity().clone()).or_default();
        state
            .peripherals
            .insert(peripheral.identity().clone(), peripheral);
    }

    /// Deliver one advertisement frame to the running scan. Returns `false` when
    /// no scan is listening.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let state = self.lock();
        match &state.scan_sink {
            Some(sink) => sink.try_send(ScanEvent::Advertisement(advertisement)).is_ok(),
            None => false,
        }
    }

    /// Advertise every added peripheral once, in no particular order.
    pub fn advertise_all(&self) -> usize {
        let frames: Vec<Advertisement> = self
            .lock()
            .peripherals
            .values()
            .map(|p| p.advertisement.clone())
            .collect();
        frames.into_iter().filter(|f| self.advertise(f.clone())).count()
    }

    /// Abort the running scan with a radio error.
    pub fn fail_scan(&self, reason: &str) {
        if let Some(sink) = self.lock().scan_sink.take() {
            let _ = sink.try_send(ScanEvent::Failed(reason.to_string()));
        }
    }

    pub fn set_scan_start_error(&self, reason: Option<&str>) {
        self.lock().scan_start_error = reason.map(str::to_string);
    }

    /// Queue outcomes for the next connection attempts. Once the queue is empty,
    /// attempts succeed for added peripherals.
    pub fn script_connect(&self, identity: &Identity, outcomes: Vec<SimConnect>) {
        self.lock()
            .links
            .entry(identity.clone())
            .or_default()
            .script
            .extend(outcomes);
    }

    pub fn fail_read(&self, identity: &Identity, handle: u16, reason: &str) {
        self.lock()
            .links
            .entry(identity.clone())
            .or_default()
            .failing_reads
            .insert(handle, reason.to_string());
    }

    pub fn set_disconnect_error(&self, reason: Option<&str>) {
        self.lock().disconnect_error = reason.map(str::to_string);
    }

    pub fn set_bond_error(&self, identity: &Identity, reason: Option<&str>) {
        self.lock()
            .links
            .entry(identity.clone())
            .or_default()
            .bond_error = reason.map(str::to_string);
    }

    /// Push a value to every live subscriber of `handle`. Returns how many
    /// subscribers received it.
    pub fn notify(&self, identity: &Identity, handle: u16, value: &[u8]) -> usize {
        let mut state = self.lock();
        let Some(link) = state.links.get_mut(identity) else {
            return 0;
        };
        let Some(subscribers) = link.subscribers.get_mut(&handle) else {
            return 0;
        };
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
            .iter()
            .filter(|tx| tx.try_send(value.to_vec()).is_ok())
            .count()
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self, identity: &Identity, reason: &str) {
        let mut state = self.lock();
        if let Some(link) = state.links.get_mut(identity) {
            link.connected = false;
            link.phy = None;
            link.subscribers.clear();
        }
        let _ = state.channel(identity).send(LinkEvent::LinkLost {
            reason: reason.to_string(),
        });
    }

    /// Report that the peripheral's services changed.
    pub fn invalidate_services(&self, identity: &Identity) {
        let mut state = self.lock();
        if let Some(link) = state.links.get_mut(identity) {
            link.subscribers.clear();
        }
        let _ = state.channel(identity).send(LinkEvent::ServicesInvalidated);
    }

    pub fn replace_tree(&self, identity: &Identity, tree: CapabilityTree) {
        if let Some(peripheral) = self.lock().peripherals.get_mut(identity) {
            peripheral.tree = tree;
        }
    }

    /// Send an arbitrary link event.
    pub fn emit(&self, identity: &Identity, event: LinkEvent) {
        let _ = self.lock().channel(identity).send(event);
    }

    pub fn connect_attempts(&self, identity: &Identity) -> u32 {
        self.lock()
            .links
            .get(identity)
            .map(|l| l.connect_attempts)
            .unwrap_or(0)
    }

    pub fn disconnect_calls(&self, identity: &Identity) -> u32 {
        self.lock()
            .links
            .get(identity)
            .map(|l| l.disconnect_calls)
            .unwrap_or(0)
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.lock()
            .links
            .get(identity)
            .map(|l| l.connected)
            .unwrap_or(false)
    }

    pub fn is_bonded(&self, identity: &Identity) -> bool {
        self.lock()
            .links
            .get(identity)
            .map(|l| l.bonded)
            .unwrap_or(false)
    }

    /// Live subscriptions on `identity`.
    pub fn subscriber_count(&self, identity: &Identity) -> usize {
        self.lock()
            .links
            .get(identity)
            .map(|l| {
                l.subscribers
                    .values()
                    .flatten()
                    .filter(|tx| !tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Values written to `handle`, oldest first.
    pub fn writes(&self, identity: &Identity, handle: u16) -> Vec<Vec<u8>> {
        self.lock()
            .links
            .get(identity)
            .map(|l| {
                l.writes
                    .iter()
                    .filter(|(h, _)| *h == handle)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn scans_started(&self) -> u32 {
        self.lock().scans_started
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_sink.is_some()
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn start_scan(&self, _filter: &ScanFilter) -> Result<mpsc::Receiver<ScanEvent>, BleError> {
        let mut state = self.lock();
        if let Some(reason) = &state.scan_start_error {
            return Err(BleError::Transport(reason.clone()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.scan_sink = Some(tx);
        state.scans_started += 1;
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.lock().scan_sink = None;
        Ok(())
    }

    async fn connect(
        &self,
        identity: &Identity,
        options: &ConnectOptions,
    ) -> Result<LinkInfo, BleError> {
        let outcome = {
            let mut state = self.lock();
            let known = state.peripherals.contains_key(identity);
            let link = state.links.entry(identity.clone()).or_default();
            link.connect_attempts += 1;
            match link.script.pop_front() {
                Some(outcome) => outcome,
                None if known => SimConnect::Succeed,
                None => SimConnect::Fail("peripheral not reachable".into()),
            }
        };

        match outcome {
            SimConnect::Succeed => {
                let phy = PhyInUse::symmetric(options.preferred_phy);
                let mut state = self.lock();
                let link = state.links.entry(identity.clone()).or_default();
                link.connected = true;
                link.phy = Some(phy);
                Ok(LinkInfo {
                    phy,
                    mtu: DEFAULT_ATT_MTU,
                })
            }
            SimConnect::Fail(reason) => Err(BleError::Transport(reason)),
            SimConnect::Hang => future::pending().await,
        }
    }

    async fn disconnect(&self, identity: &Identity) -> Result<(), BleError> {
        let mut state = self.lock();
        let error = state.disconnect_error.clone();
        let link = state.links.entry(identity.clone()).or_default();
        link.disconnect_calls += 1;
        if let Some(reason) = error {
            return Err(BleError::Transport(reason));
        }
        link.connected = false;
        link.phy = None;
        link.subscribers.clear();
        Ok(())
    }

    fn link_events(&self, identity: &Identity) -> broadcast::Receiver<LinkEvent> {
        self.lock().channel(identity).subscribe()
    }

    async fn discover_services(&self, identity: &Identity) -> Result<CapabilityTree, BleError> {
        Ok(self.lock().connected_peripheral(identity)?.tree.clone())
    }

    async fn read(&self, identity: &Identity, handle: u16) -> Result<Vec<u8>, BleError> {
        let state = self.lock();
        let peripheral = state.connected_peripheral(identity)?;
        if let Some(reason) = state
            .links
            .get(identity)
            .and_then(|l| l.failing_reads.get(&handle))
        {
            return Err(BleError::Transport(reason.clone()));
        }
        peripheral
            .tree
            .characteristic(handle)
            .filter(|c| c.properties.is_readable())
            .ok_or_else(|| BleError::Transport("read not permitted".into()))?;
        Ok(peripheral.values.get(&handle).cloned().unwrap_or_default())
    }

    async fn read_descriptor(&self, identity: &Identity, handle: u16) -> Result<Vec<u8>, BleError> {
        let state = self.lock();
        let peripheral = state.connected_peripheral(identity)?;
        if let Some(reason) = state
            .links
            .get(identity)
            .and_then(|l| l.failing_reads.get(&handle))
        {
            return Err(BleError::Transport(reason.clone()));
        }
        let exists = peripheral
            .tree
            .characteristics()
            .flat_map(|c| c.descriptors.iter())
            .any(|d| d.handle == handle);
        if !exists {
            return Err(BleError::Transport("invalid handle".into()));
        }
        Ok(peripheral.values.get(&handle).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        identity: &Identity,
        handle: u16,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        let mut state = self.lock();
        let writable = state
            .connected_peripheral(identity)?
            .tree
            .characteristic(handle)
            .map(|c| c.properties.is_writable(write_type))
            .unwrap_or(false);
        if !writable {
            return Err(BleError::Transport(format!("{} not permitted", write_type)));
        }
        if let Some(peripheral) = state.peripherals.get_mut(identity) {
            peripheral.values.insert(handle, value.to_vec());
        }
        if let Some(link) = state.links.get_mut(identity) {
            link.writes.push((handle, value.to_vec()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        identity: &Identity,
        handle: u16,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let mut state = self.lock();
        let subscribable = state
            .connected_peripheral(identity)?
            .tree
            .characteristic(handle)
            .map(|c| c.properties.is_subscribable())
            .unwrap_or(false);
        if !subscribable {
            return Err(BleError::SubscriptionNotSupported);
        }
        let (tx, rx) = mpsc::channel(16);
        if let Some(link) = state.links.get_mut(identity) {
            link.subscribers.entry(handle).or_default().push(tx);
        }
        Ok(rx)
    }

    async fn create_bond(&self, identity: &Identity) -> Result<(), BleError> {
        let mut state = self.lock();
        state.connected_peripheral(identity)?;
        let link = state.links.entry(identity.clone()).or_default();
        if let Some(reason) = &link.bond_error {
            return Err(BleError::Transport(reason.clone()));
        }
        link.bonded = true;
        Ok(())
    }

    async fn remove_bond(&self, identity: &Identity) -> Result<(), BleError> {
        let mut state = self.lock();
        let link = state.links.entry(identity.clone()).or_default();
        link.bonded = false;
        Ok(())
    }

    async fn refresh_cache(&self, identity: &Identity) -> Result<(), BleError> {
        self.lock().connected_peripheral(identity)?;
        self.invalidate_services(identity);
        Ok(())
    }

    async fn request_mtu(&self, identity: &Identity, mtu: u16) -> Result<u16, BleError> {
        let state = self.lock();
        let peripheral = state.connected_peripheral(identity)?;
        Ok(mtu.min(peripheral.max_mtu).max(DEFAULT_ATT_MTU))
    }

    async fn read_rssi(&self, identity: &Identity) -> Result<i16, BleError> {
        let state = self.lock();
        Ok(state
            .connected_peripheral(identity)?
            .advertisement
            .rssi
            .unwrap_or(-60))
    }

    async fn read_phy(&self, identity: &Identity) -> Result<PhyInUse, BleError> {
        let state = self.lock();
        state.connected_peripheral(identity)?;
        state
            .links
            .get(identity)
            .and_then(|l| l.phy)
            .ok_or_else(|| BleError::NotConnected(identity.clone()))
    }

    async fn request_connection_priority(
        &self,
        identity: &Identity,
        priority: ConnectionPriority,
    ) -> Result<ConnectionParameters, BleError> {
        self.lock().connected_peripheral(identity)?;
        let (interval, latency, supervision_timeout) = match priority {
            ConnectionPriority::High => (12, 0, 500),
            ConnectionPriority::Balanced => (36, 0, 500),
            ConnectionPriority::LowPower => (80, 2, 600),
        };
        Ok(ConnectionParameters {
            interval,
            latency,
            supervision_timeout,
        })
    }
}

/// Properties shorthand for building simulated trees.
pub fn properties(read: bool, write: bool, notify: bool) -> CharacteristicProperties {
    CharacteristicProperties {
        read,
        write,
        write_without_response: write,
        notify,
        indicate: false,
    }
}

pub fn characteristic(
    uuid: Uuid,
    handle: u16,
    properties: CharacteristicProperties,
    descriptors: &[(Uuid, u16)],
) -> Characteristic {
    Characteristic {
        uuid,
        handle,
        properties,
        descriptors: descriptors
            .iter()
            .map(|&(uuid, handle)| Descriptor { uuid, handle })
            .collect(),
    }
}

/// A Nordic LED Button board with a battery service.
pub fn blinky_peripheral(identity: Identity, name: &str) -> SimPeripheral {
    let tree = CapabilityTree::new(vec![
        Service {
            uuid: LED_BUTTON_SERVICE,
            handle: 0x0010,
            characteristics: vec![
                characteristic(
                    BUTTON_CHAR,
                    0x0012,
                    properties(true, false, true),
                    &[(CLIENT_CHARACTERISTIC_CONFIGURATION, 0x0013)],
                ),
                characteristic(
                    LED_CHAR,
                    0x0015,
                    properties(true, true, false),
                    &[(CHARACTERISTIC_USER_DESCRIPTION, 0x0016)],
                ),
            ],
        },
        Service {
            uuid: BATTERY_SERVICE,
            handle: 0x0020,
            characteristics: vec![characteristic(
                BATTERY_LEVEL_CHAR,
                0x0022,
                properties(true, false, true),
                &[(CLIENT_CHARACTERISTIC_CONFIGURATION, 0x0023)],
            )],
        },
    ]);

    SimPeripheral::new(
        Advertisement::new(identity)
            .with_name(name)
            .with_rssi(-48)
            .with_service(LED_BUTTON_SERVICE),
    )
    .with_tree(tree)
    .with_value(0x0012, vec![0x00])
    .with_value(0x0015, vec![0x00])
    .with_value(0x0016, b"LED".to_vec())
    .with_value(0x0022, vec![87])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Phy;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions {
            preferred_phy: Phy::Le2M,
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_outcomes() {
        let radio = SimRadio::new();
        let identity = Identity::le("11:22:33:44:55:66");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        radio.script_connect(&identity, vec![SimConnect::Fail("busy".into())]);

        assert_eq!(
            radio.connect(&identity, &options()).await,
            Err(BleError::Transport("busy".into()))
        );
        let link = radio.connect(&identity, &options()).await.unwrap();
        assert_eq!(link.phy, PhyInUse::symmetric(Phy::Le2M));
        assert_eq!(radio.connect_attempts(&identity), 2);
        assert!(radio.is_connected(&identity));
    }

    #[tokio::test]
    async fn test_subscriptions_close_on_link_loss() {
        let radio = SimRadio::new();
        let identity = Identity::le("11:22:33:44:55:67");
        radio.add_peripheral(blinky_peripheral(identity.clone(), "DemoX"));
        radio.connect(&identity, &options()).await.unwrap();

        let mut rx = radio.subscribe(&identity, 0x0012).await.unwrap();
        assert_eq!(
            radio.subscribe(&identity, 0x0015).await.err(),
            Some(BleError::SubscriptionNotSupported)
        );
        assert_eq!(radio.notify(&identity, 0x0012, &[1]), 1);
        assert_eq!(rx.recv().await, Some(vec![1]));

        radio.drop_link(&identity, "out of range");
        assert_eq!(rx.recv().await, None);
        assert_eq!(
            radio.read(&identity, 0x0012).await,
            Err(BleError::NotConnected(identity.clone()))
        );
    }

    #[tokio::test]
    async fn test_frames_need_a_running_scan() {
        let radio = SimRadio::new();
        let frame = Advertisement::new(Identity::le("11:22:33:44:55:68"));
        assert!(!radio.advertise(frame.clone()));

        let mut rx = radio.start_scan(&ScanFilter::All).await.unwrap();
        assert!(radio.advertise(frame.clone()));
        assert!(matches!(rx.recv().await, Some(ScanEvent::Advertisement(f)) if f == frame));
    }
}
