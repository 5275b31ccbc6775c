//! # scanbridge-core
//!
//! Core logic for bridging serial BLE observer modules to a monitoring host.
//!
//! This crate provides:
//! - The AT bring-up and observer state machine for each scanning module
//! - Manufacturer extraction, deduplication and catch-up buffering of sightings
//! - A fleet supervisor with exponential-backoff reconnects
//! - The host command protocol, heartbeat emitter and application lifecycle
//! - Configuration loading, saving, and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`at`] - AT command builders
//! - [`manufacturer`] / [`advert`] - Company table and advertisement parsing
//! - [`channel`] - Line-oriented serial channels (real backend behind the `serial` feature)
//! - [`device`] - One scanning module
//! - [`fleet`] - Supervision of every configured module
//! - [`heartbeat`] - Periodic liveness events
//! - [`wire`] / [`router`] - Host envelopes and command dispatch
//! - [`transport`] - The host transport capability
//! - [`bridge`] - Startup and shutdown wiring
//! - `mock` - In-memory channels and transport for tests (`mock` feature)
//! - [`config`] - Application configuration
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod advert;
pub mod at;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod heartbeat;
pub mod manufacturer;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod router;
pub mod transport;
pub mod wire;

// Re-export primary types for convenience
pub use bridge::Bridge;
#[cfg(feature = "serial")]
pub use channel::SerialConnector;
pub use channel::{ChannelHandle, Connector, LineWriter};
pub use config::{
    derive_device_id, AppConfig, ConfigError, ConfigResult, DeviceConfig, HttpTransportConfig,
    LoggingConfig, Parity, ReconnectConfig, SerialTransportConfig, TransportConfig,
};
pub use device::{Detection, DeviceEvent, DeviceSpec, DeviceStatus, DeviceTimings, InitState, ScanDevice};
pub use error::{BridgeError, Result};
pub use fleet::{ConnectionStats, Fleet, FleetEvent, FleetSettings, ReconnectPolicy};
pub use heartbeat::Heartbeat;
pub use router::{CommandRouter, RouterSettings};
pub use transport::{Inbound, Responder, Transport};
pub use wire::{Command, CommandCode, EventType, RequestEnvelope, ResponseEnvelope};
