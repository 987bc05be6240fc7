//! Error types surfaced by the session and facade.
//!
//! Every type here is `Clone`: the outcome of a single connect attempt is
//! handed to every caller that was waiting on it.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the BLE transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open link to {address}: {reason}")]
    Open { address: String, reason: String },

    #[error("write to characteristic {characteristic} failed: {reason}")]
    Write { characteristic: Uuid, reason: String },

    #[error("subscribing to characteristic {characteristic} failed: {reason}")]
    Subscribe { characteristic: Uuid, reason: String },

    #[error("failed to close link: {0}")]
    Close(String),

    #[error("link is not connected")]
    NotConnected,
}

/// Failures while waiting for a status notification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("no status notification within {0:?}")]
    Timeout(Duration),

    #[error("status request could not be sent: {0}")]
    Transport(#[from] TransportError),

    #[error("device is not connected")]
    NotConnected,
}

/// Failures of a connect attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("device {address} does not expose the Smart Matic service")]
    UnsupportedDevice { address: String },

    #[error("initial status refresh failed: {0}")]
    Status(#[from] StatusError),
}

/// Top-level error of the device facade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;
