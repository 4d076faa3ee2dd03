use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Radio transport a peripheral is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    Le,
    Classic,
    Dual,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Le => write!(f, "LE"),
            Self::Classic => write!(f, "BR/EDR"),
            Self::Dual => write!(f, "dual"),
        }
    }
}

/// Stable key naming one remote peripheral.
///
/// Addresses are normalized to upper case so `aa:bb:..` and `AA:BB:..` name the
/// same peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    address: String,
    transport: TransportKind,
}

impl Identity {
    pub fn new(address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            address: address.into().trim().to_uppercase(),
            transport,
        }
    }

    /// Identity of a Bluetooth LE peripheral.
    pub fn le(address: impl Into<String>) -> Self {
        Self::new(address, TransportKind::Le)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.transport)
    }
}

/// A raw advertisement frame as reported by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub identity: Identity,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            name: None,
            rssi: None,
            service_uuids: Vec::new(),
            manufacturer_data: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Le1M => write!(f, "LE 1M"),
            Self::Le2M => write!(f, "LE 2M"),
            Self::LeCoded => write!(f, "LE Coded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhyInUse {
    pub tx: Phy,
    pub rx: Phy,
}

impl PhyInUse {
    pub fn symmetric(phy: Phy) -> Self {
        Self { tx: phy, rx: phy }
    }
}

impl fmt::Display for PhyInUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx {} / rx {}", self.tx, self.rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Connection interval in units of 1.25 ms.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in units of 10 ms.
    pub supervision_timeout: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WithResponse => write!(f, "write with response"),
            Self::WithoutResponse => write!(f, "write without response"),
        }
    }
}

/// Connection state of one peripheral.
///
/// `Connected` carries the PHY and MTU reported when the link came up; later
/// negotiation results are published separately on the peripheral handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32, deadline: Instant },
    Connected { phy: PhyInUse, mtu: u16 },
    Disconnecting,
}

impl ConnectionState {
    /// True while a connection is being established or is up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting { .. } => "Connecting",
            Self::Connected { .. } => "Connected",
            Self::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { attempt, .. } => write!(f, "Connecting (attempt {})", attempt),
            Self::Connected { phy, mtu } => write!(f, "Connected ({}, mtu {})", phy, mtu),
            other => write!(f, "{}", other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondState {
    #[default]
    NotBonded,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn is_readable(&self) -> bool {
        self.read
    }

    pub fn is_writable(&self, write_type: WriteType) -> bool {
        match write_type {
            WriteType::WithResponse => self.write,
            WriteType::WithoutResponse => self.write_without_response,
        }
    }

    pub fn is_subscribable(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristics: Vec<Characteristic>,
}

/// The discovered services of a peripheral.
///
/// A tree is only ever handed out whole; discovery either yields a complete tree
/// or none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilityTree {
    pub services: Vec<Service>,
}

impl CapabilityTree {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    pub fn characteristic(&self, handle: u16) -> Option<&Characteristic> {
        self.characteristics().find(|c| c.handle == handle)
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn characteristic_count(&self) -> usize {
        self.characteristics().count()
    }

    pub fn descriptor_count(&self) -> usize {
        self.characteristics().map(|c| c.descriptors.len()).sum()
    }
}

/// Single-item GATT operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOperation {
    Read,
    ReadDescriptor,
    Write,
    Subscribe,
}

impl fmt::Display for ItemOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::ReadDescriptor => write!(f, "descriptor read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub operation: ItemOperation,
    pub uuid: Uuid,
    pub handle: u16,
    pub reason: String,
}

/// Outcome of one walk over a capability tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiscoveryReport {
    pub pass: u64,
    pub reads: usize,
    pub descriptor_reads: usize,
    pub subscriptions: usize,
    /// Subscription refusals on characteristics that do not advertise notify/indicate.
    pub expected_refusals: usize,
    pub failures: Vec<ItemFailure>,
    /// Subscription failures on characteristics that should have accepted one.
    pub anomalies: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Read,
    DescriptorRead,
    Notification,
}

/// Point-in-time view of a known peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSnapshot {
    pub identity: Identity,
    pub name: Option<String>,
    pub state: ConnectionState,
    pub bond_state: BondState,
    pub phy: Option<PhyInUse>,
    pub mtu: u16,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScanFailed,
    ConnectFailed,
    DisconnectFailed,
    ItemOperationFailed,
    AlreadyActive,
    Other,
}

/// Terminal error notice surfaced to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub identity: Option<Identity>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ScanningChanged(bool),
    PeripheralDiscovered(PeripheralSnapshot),
    ConnectionStateChanged {
        identity: Identity,
        state: ConnectionState,
    },
    BondStateChanged {
        identity: Identity,
        state: BondState,
    },
    PeripheralConnected {
        identity: Identity,
        connected: bool,
    },
    PhyChanged {
        identity: Identity,
        phy: PhyInUse,
    },
    MtuChanged {
        identity: Identity,
        mtu: u16,
    },
    ConnectionParametersChanged {
        identity: Identity,
        parameters: ConnectionParameters,
    },
    /// `services` is `None` when the previous tree was invalidated.
    ServicesChanged {
        identity: Identity,
        pass: u64,
        services: Option<usize>,
    },
    CharacteristicValue {
        identity: Identity,
        pass: u64,
        uuid: Uuid,
        handle: u16,
        source: ValueSource,
        value: Vec<u8>,
    },
    DiscoveryCompleted {
        identity: Identity,
        report: DiscoveryReport,
    },
    Error(ErrorNotice),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
