//! Observable peripheral handle.
//!
//! A [`Peripheral`] exists for every identity the central has heard of. Its
//! fields are `watch` channels: sessions publish, observers subscribe. Every
//! change is also forwarded to the application event feed.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::domain::models::{
    AppEvent, BondState, CapabilityTree, ConnectionState, Identity, PeripheralSnapshot, PhyInUse,
};

use super::protocol::DEFAULT_ATT_MTU;

pub struct Peripheral {
    identity: Identity,
    name: watch::Sender<Option<String>>,
    state: watch::Sender<ConnectionState>,
    bond_state: watch::Sender<BondState>,
    phy: watch::Sender<Option<PhyInUse>>,
    mtu: watch::Sender<u16>,
    connected: watch::Sender<bool>,
    services: watch::Sender<Option<Arc<CapabilityTree>>>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl Peripheral {
    pub fn new(
        identity: Identity,
        name: Option<String>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            identity,
            name: watch::channel(name).0,
            state: watch::channel(ConnectionState::Disconnected).0,
            bond_state: watch::channel(BondState::NotBonded).0,
            phy: watch::channel(None).0,
            mtu: watch::channel(DEFAULT_ATT_MTU).0,
            connected: watch::channel(false).0,
            services: watch::channel(None).0,
            events,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn bond_state(&self) -> BondState {
        *self.bond_state.borrow()
    }

    pub fn watch_bond_state(&self) -> watch::Receiver<BondState> {
        self.bond_state.subscribe()
    }

    pub fn phy(&self) -> Option<PhyInUse> {
        *self.phy.borrow()
    }

    pub fn mtu(&self) -> u16 {
        *self.mtu.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// The current capability tree, if a discovery pass has completed.
    pub fn services(&self) -> Option<Arc<CapabilityTree>> {
        self.services.borrow().clone()
    }

    pub fn watch_services(&self) -> watch::Receiver<Option<Arc<CapabilityTree>>> {
        self.services.subscribe()
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        PeripheralSnapshot {
            identity: self.identity.clone(),
            name: self.name(),
            state: self.state(),
            bond_state: self.bond_state(),
            phy: self.phy(),
            mtu: self.mtu(),
            connected: self.is_connected(),
        }
    }

    /// Keep the first known name; later sightings only fill in a missing one.
    pub(crate) fn update_name(&self, name: Option<&str>) {
        if let Some(name) = name {
            self.name.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(name.to_string());
                    true
                } else {
                    false
                }
            });
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        info!("State of {}: {}", self.identity, state);
        self.emit(AppEvent::ConnectionStateChanged {
            identity: self.identity.clone(),
            state,
        });
    }

    pub(crate) fn set_bond_state(&self, state: BondState) {
        if self.bond_state.send_if_modified(|current| replace(current, state)) {
            info!("Bond state of {}: {:?}", self.identity, state);
            self.emit(AppEvent::BondStateChanged {
                identity: self.identity.clone(),
                state,
            });
        }
    }

    pub(crate) fn set_phy(&self, phy: PhyInUse) {
        if self.phy.send_if_modified(|current| replace(current, Some(phy))) {
            info!("PHY of {} changed to: {}", self.identity, phy);
            self.emit(AppEvent::PhyChanged {
                identity: self.identity.clone(),
                phy,
            });
        }
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        if self.mtu.send_if_modified(|current| replace(current, mtu)) {
            info!("MTU of {} is now {}", self.identity, mtu);
            self.emit(AppEvent::MtuChanged {
                identity: self.identity.clone(),
                mtu,
            });
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        if self.connected.send_if_modified(|current| replace(current, connected)) {
            self.emit(AppEvent::PeripheralConnected {
                identity: self.identity.clone(),
                connected,
            });
        }
    }

    pub(crate) fn set_services(&self, tree: Option<Arc<CapabilityTree>>, pass: u64) {
        let services = tree.as_ref().map(|t| t.services.len());
        self.services.send_replace(tree);
        debug!("({}) Services of {} changed: {:?}", pass, self.identity, services);
        self.emit(AppEvent::ServicesChanged {
            identity: self.identity.clone(),
            pass,
            services,
        });
    }

    /// Forget link-scoped values once a session has ended.
    pub(crate) fn reset_link(&self) {
        self.phy.send_replace(None);
        self.mtu.send_replace(DEFAULT_ATT_MTU);
        self.services.send_replace(None);
    }

    pub(crate) fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }
}

fn replace<T: PartialEq>(current: &mut T, value: T) -> bool {
    if *current == value {
        false
    } else {
        *current = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_are_published_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peripheral = Peripheral::new(Identity::le("00:00:00:00:00:01"), None, tx);

        peripheral.set_bond_state(BondState::Bonding);
        peripheral.set_bond_state(BondState::Bonding);
        peripheral.set_connected(true);
        peripheral.set_connected(true);

        assert!(matches!(
            rx.try_recv(),
            Ok(AppEvent::BondStateChanged {
                state: BondState::Bonding,
                ..
            })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(AppEvent::PeripheralConnected {
                connected: true,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_name_is_filled_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peripheral = Peripheral::new(Identity::le("00:00:00:00:00:02"), None, tx);

        peripheral.update_name(None);
        assert_eq!(peripheral.name(), None);
        peripheral.update_name(Some("DemoX"));
        peripheral.update_name(Some("Renamed"));
        assert_eq!(peripheral.name().as_deref(), Some("DemoX"));
    }

    #[test]
    fn test_reset_link() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peripheral = Peripheral::new(Identity::le("00:00:00:00:00:03"), None, tx);
        peripheral.set_mtu(247);
        peripheral.set_services(Some(Arc::new(CapabilityTree::default())), 1);

        peripheral.reset_link();
        assert_eq!(peripheral.mtu(), DEFAULT_ATT_MTU);
        assert!(peripheral.services().is_none());
        assert_eq!(peripheral.snapshot().state, ConnectionState::Disconnected);
    }
}
