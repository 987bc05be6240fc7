//! Session management for the Godrej Aer Smart Matic BLE aerosol dispenser.
//!
//! [`SmartMatic`] connects on demand, decodes battery status notifications,
//! fires the sprayer and drops the link again after a quiet period.
//! Observers follow the device through its [`EventBus`].

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    DeviceIdentity, DeviceInfo, DeviceStatus, Event, EventKind, SessionState,
};
pub use error::{ConnectError, Error, Result, StatusError, TransportError};
pub use infrastructure::bluetooth::connection::{BleSession, SessionConfig};
pub use infrastructure::bluetooth::poller::BackgroundPoller;
pub use infrastructure::bluetooth::transport::{Link, LinkEvent, LinkEventSender, Transport};
pub use infrastructure::bluetooth::SmartMatic;
pub use infrastructure::event_bus::{EventBus, SubscriptionId};
