use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How long a decoded status is trusted before a refresh is required
pub const STATUS_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Immutable identity of the managed peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    address: String,
    name: String,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into().to_uppercase(),
            name: name.into(),
        }
    }

    /// Bluetooth address, normalized to upper case (`AA:BB:CC:DD:EE:FF`)
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Snapshot of the device state decoded from a status notification.
///
/// The device does not report a timestamp, so `captured_at` is the moment the
/// frame was decoded on this side. A new notification always replaces the
/// whole snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    captured_at: Instant,
    battery_mv: Option<u32>,
}

impl DeviceStatus {
    pub fn new(captured_at: Instant, battery_mv: Option<u32>) -> Self {
        Self {
            captured_at,
            battery_mv,
        }
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Battery voltage in millivolts
    pub fn battery_mv(&self) -> Option<u32> {
        self.battery_mv
    }

    /// A status is usable while it carries a voltage and is younger than
    /// [`STATUS_VALIDITY`].
    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.battery_mv.is_some() && now < self.captured_at + STATUS_VALIDITY
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }
}

/// Lifecycle state of the BLE session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ServiceDiscovery => "service discovery",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// Events broadcast by a session to its observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnected,
    StatusUpdated(DeviceStatus),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::StatusUpdated(_) => EventKind::StatusUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    StatusUpdated,
}

/// Descriptor host entities use to group their sensors and buttons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub name: String,
    pub bluetooth_address: String,
}

impl DeviceInfo {
    pub fn for_identity(identity: &DeviceIdentity) -> Self {
        Self {
            manufacturer: "Godrej Aer",
            model: "Smart Matic",
            name: identity.name().to_string(),
            bluetooth_address: identity.address().to_string(),
        }
    }
}
