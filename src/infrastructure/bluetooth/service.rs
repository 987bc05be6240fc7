//! Smart Matic Device Module
//!
//! Public entry point for callers: entities, background pollers and the
//! daemon binary all hold a clone of [`SmartMatic`].

use crate::domain::models::{DeviceIdentity, DeviceInfo, DeviceStatus, SessionState};
use crate::error::{ConnectError, Result, TransportError};
use crate::infrastructure::bluetooth::connection::{BleSession, SessionConfig};
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::event_bus::EventBus;
use std::sync::Arc;

/// One Smart Matic dispenser
#[derive(Clone)]
pub struct SmartMatic {
    session: BleSession,
    transport: Arc<dyn Transport>,
}

impl SmartMatic {
    /// Create a new device handle. Nothing is connected until asked.
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            session: BleSession::new(identity, Arc::clone(&transport), config),
            transport,
        }
    }

    pub async fn connect(&self) -> std::result::Result<(), ConnectError> {
        self.session.connect().await
    }

    /// Connect only if the cached status is missing or stale
    pub async fn connect_if_needed(&self) -> std::result::Result<bool, ConnectError> {
        self.session.connect_if_needed().await
    }

    pub async fn disconnect(&self) -> std::result::Result<bool, TransportError> {
        self.session.disconnect().await
    }

    /// Spray once
    pub async fn trigger(&self) -> Result<()> {
        self.session.trigger().await
    }

    /// Refresh the cached status, connecting first if needed.
    ///
    /// A fresh connection already performs a refresh, so no second request is
    /// sent in that case.
    pub async fn get_device_status(&self) -> Result<()> {
        if !self.session.is_connected() {
            self.session.connect().await?;
            return Ok(());
        }
        self.session.get_device_status().await?;
        Ok(())
    }

    /// Whether the transport currently sees the device advertising
    pub async fn is_reachable(&self) -> bool {
        self.transport.is_reachable(self.session.identity()).await
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.session.identity()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::for_identity(self.session.identity())
    }

    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.session.device_status()
    }

    /// Battery voltage of the last status, in millivolts
    pub fn battery_mv(&self) -> Option<u32> {
        self.device_status().and_then(|status| status.battery_mv())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Event bus for `Connected`, `Disconnected` and `StatusUpdated`
    pub fn events(&self) -> &EventBus {
        self.session.events()
    }

    pub fn session(&self) -> &BleSession {
        &self.session
    }
}
