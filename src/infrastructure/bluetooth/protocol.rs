//! Smart Matic Protocol
//!
//! This module contains the wire definitions for communicating with
//! the Smart Matic aerosol dispenser

use crate::domain::models::DeviceStatus;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

/// Primary service UUID (Nordic UART style vendor service)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400000_b5a3_f393_e0a9_e50e24dcca9e);

/// Notify Characteristic UUID - where status frames are received
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Write Characteristic UUID - where commands are sent
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Length of a status notification
pub const STATUS_FRAME_LEN: usize = 99;

/// Offset of the big-endian battery voltage (millivolts) inside a status frame
pub const BATTERY_MV_OFFSET: usize = 21;

/// Commands understood by the dispenser firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the device to push a status notification
    StatusRequest,
    /// Fire one spray
    Trigger,
}

impl Command {
    /// Get the raw bytes for this command.
    ///
    /// The frames are opaque vendor payloads and must be sent verbatim.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::StatusRequest => &[
                0xBF, 0x62, 0x6D, 0x54, 0x18, 0x6B, 0x62, 0x6D, 0x4E, 0x18, 0x9D, 0xFF,
            ],
            Self::Trigger => &[
                0xBF, 0x62, 0x6D, 0x54, 0x18, 0x68, 0x62, 0x6D, 0x4E, 0x18, 0x9A, 0x62, 0x72, 0x49,
                0x00, 0xFF,
            ],
        }
    }
}

pub fn encode_status_request() -> &'static [u8] {
    Command::StatusRequest.as_bytes()
}

pub fn encode_trigger() -> &'static [u8] {
    Command::Trigger.as_bytes()
}

/// Decode a notification payload into a [`DeviceStatus`].
///
/// # Status Frame Structure (99 bytes)
///
/// ```text
/// [0-20]  : Unknown / vendor fields
/// [21-24] : Battery voltage (u32 big-endian, millivolts)
/// [25-98] : Unknown / vendor fields
/// ```
///
/// Any other length is not a status frame and yields `None`.
pub fn decode(bytes: &[u8]) -> Option<DeviceStatus> {
    decode_at(bytes, Instant::now())
}

pub(crate) fn decode_at(bytes: &[u8], captured_at: Instant) -> Option<DeviceStatus> {
    if bytes.len() != STATUS_FRAME_LEN {
        trace!("Ignoring {}-byte notification", bytes.len());
        return None;
    }

    let raw: [u8; 4] = bytes
        .get(BATTERY_MV_OFFSET..BATTERY_MV_OFFSET + 4)?
        .try_into()
        .ok()?;

    Some(DeviceStatus::new(captured_at, Some(u32::from_be_bytes(raw))))
}

/// Lower-case hex rendering used for wire logging
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
