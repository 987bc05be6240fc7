//! Bluetooth Module
//!
//! Provides BLE communication with the Smart Matic dispenser.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       SmartMatic                         │
//! │  (Device facade - public API for callers)                │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Poller   │  │ BleSession │  │ Protocol │
//! │           │  │            │  │          │
//! │ - Periodic│  │ - Connect  │  │ - UUIDs  │
//! │ - Adverts │  │ - Status   │  │ - Commands│
//! │           │  │ - Idle off │  │ - Parsing │
//! └───────────┘  └─────┬──────┘  └──────────┘
//!                      │
//!                      ▼
//!               ┌────────────┐
//!               │ Transport  │
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire identifiers, command frames and status decoding
//! - [`transport`] - Transport/link traits the session drives
//! - [`connection`] - Session state machine
//! - [`service`] - Device facade
//! - [`poller`] - Background refresh drivers

pub mod connection;
pub mod poller;
pub mod protocol;
pub mod service;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

#[cfg(test)]
pub(crate) mod fake;

// Re-export main service for convenience
pub use service::SmartMatic;
