//! Radio transport trait definitions and core types
//!
//! The orchestrator never talks to a Bluetooth stack directly. Everything it
//! needs from the radio goes through [`Radio`]; platform backends and the
//! in-process simulator both implement it.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::domain::filter::ScanFilter;
use crate::domain::models::{
    Advertisement, BondState, CapabilityTree, ConnectionParameters, ConnectionPriority, Identity,
    Phy, PhyInUse, WriteType,
};

use super::BleError;

/// Frames delivered while a scan is running.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    /// The radio aborted the scan. No further frames follow.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub preferred_phy: Phy,
    /// Per-attempt timeout the radio may use for its own supervision.
    pub timeout: Duration,
}

/// Link properties reported when a connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub phy: PhyInUse,
    pub mtu: u16,
}

/// Asynchronous notifications about one peripheral's link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LinkLost { reason: String },
    PhyUpdated(PhyInUse),
    ParametersUpdated(ConnectionParameters),
    /// Previously discovered services are no longer valid; rediscovery is required.
    ServicesInvalidated,
    BondStateChanged(BondState),
}

/// The radio collaborator: scanning and GATT client I/O for the central role.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning. The filter may be applied by the radio as a hint; the
    /// scanner re-applies it to every frame.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<mpsc::Receiver<ScanEvent>, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Perform one connection attempt.
    async fn connect(
        &self,
        identity: &Identity,
        options: &ConnectOptions,
    ) -> Result<LinkInfo, BleError>;

    async fn disconnect(&self, identity: &Identity) -> Result<(), BleError>;

    /// Subscribe to link events for `identity`. Receivers only see events sent
    /// after the call.
    fn link_events(&self, identity: &Identity) -> broadcast::Receiver<LinkEvent>;

    async fn discover_services(&self, identity: &Identity) -> Result<CapabilityTree, BleError>;

    async fn read(&self, identity: &Identity, handle: u16) -> Result<Vec<u8>, BleError>;

    async fn read_descriptor(&self, identity: &Identity, handle: u16) -> Result<Vec<u8>, BleError>;

    async fn write(
        &self,
        identity: &Identity,
        handle: u16,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    /// Enable notifications or indications. The returned channel closes when the
    /// subscription ends on the radio side.
    async fn subscribe(
        &self,
        identity: &Identity,
        handle: u16,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    async fn create_bond(&self, identity: &Identity) -> Result<(), BleError>;

    async fn remove_bond(&self, identity: &Identity) -> Result<(), BleError>;

    /// Drop the radio's cached services; it reports invalidation afterwards.
    async fn refresh_cache(&self, identity: &Identity) -> Result<(), BleError>;

    /// Request `mtu` and return the negotiated value.
    async fn request_mtu(&self, identity: &Identity, mtu: u16) -> Result<u16, BleError>;

    async fn read_rssi(&self, identity: &Identity) -> Result<i16, BleError>;

    async fn read_phy(&self, identity: &Identity) -> Result<PhyInUse, BleError>;

    async fn request_connection_priority(
        &self,
        identity: &Identity,
        priority: ConnectionPriority,
    ) -> Result<ConnectionParameters, BleError>;
}
