//! BLE Transport Abstraction
//!
//! The session never talks to an adapter directly. A [`Transport`] opens
//! links, and each [`Link`] reports notifications and disconnects back over
//! the channel it was opened with.

use crate::domain::models::DeviceIdentity;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Asynchronous events pushed by an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A characteristic value notification
    Notification { characteristic: Uuid, data: Vec<u8> },
    /// The link dropped, whether requested locally or not
    Disconnected,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Opens links to a peripheral
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the device. Every event of the returned link must be sent
    /// on `events`, ending with exactly one [`LinkEvent::Disconnected`].
    async fn open(
        &self,
        identity: &DeviceIdentity,
        events: LinkEventSender,
    ) -> Result<Arc<dyn Link>, TransportError>;

    /// Whether the device is currently advertising in range
    async fn is_reachable(&self, _identity: &DeviceIdentity) -> bool {
        true
    }
}

/// An established GATT link
#[async_trait]
pub trait Link: Send + Sync {
    /// Primary services discovered on the peripheral
    fn services(&self) -> Vec<Uuid>;

    fn is_connected(&self) -> bool;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications for a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
