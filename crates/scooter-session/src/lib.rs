//! BLE session controller for Ninebot and Xiaomi electric scooters
//!
//! This crate discovers scooters from their advertisements, connects to one
//! of them, drives the authentication handshake and hands authenticated,
//! decrypted traffic to a frame parser.
//!
//! # Architecture
//!
//! The session operates in four layers:
//!
//! 1. **Transport** - BLE radio behind the [`TransportAdapter`] trait
//! 2. **Discovery** - [`DiscoveryRegistry`] of currently visible scooters
//! 3. **Session** - [`SessionController`] state machine and [`CryptoContext`]
//! 4. **Protocol** - [`NinebotFrameParser`] for `5A A5` / `55 AA` frames
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `ble` feature to use BleTransport
//! // Cargo.toml: scooter-session = { version = "0.1", features = ["ble"] }
//!
//! use scooter_session::{
//!     event_channel, BleTransport, PlaintextOnly, SessionConfigBuilder, SessionController,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfigBuilder::new().build();
//!     let (events_tx, events_rx) = event_channel();
//!
//!     let mut transport = BleTransport::new(events_tx, config.discovery.clone()).await?;
//!     transport.start_scan().await?;
//!
//!     let (controller, handle) = SessionController::new(transport, &config, PlaintextOnly);
//!     tokio::spawn(controller.run(events_rx));
//!
//!     let mut frames = handle.subscribe_frames();
//!     while let Ok(frame) = frames.recv().await {
//!         println!("{:02X} {:02X}: {:?}", frame.command, frame.argument, frame.payload);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - btleplug transport (requires `libdbus-1-dev` on Linux)
//!
//! # Authentication
//!
//! Handshakes are pluggable through [`HandshakeEngineFactory`]. The crate
//! ships [`PlaintextOnly`] for unencrypted variants; encrypted variants need
//! an engine supplied by the embedding application.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod model;
pub mod parser;
pub mod registry;
pub mod session;
pub mod test_utils;
pub mod transport;

pub use config::{DiscoveryConfig, SessionConfig, SessionConfigBuilder, SessionSettings};
pub use crypto::{
    CryptoContext, CryptoIdentity, HandshakeEngine, HandshakeEngineFactory, HandshakeOutbox,
    OutboundWrite, PlaintextHandshake, PlaintextOnly,
};
pub use device::{DeviceId, DiscoveredScooter, PeripheralHandle};
pub use error::{Result, SessionError};
pub use model::{ProtocolVariant, ScooterModel};
pub use parser::{MessageParser, NinebotFrameParser, ScooterFrame};
pub use registry::{DiscoveryRegistry, Observation, RegistryStats};
pub use session::{SessionController, SessionHandle, SessionSnapshot, SessionStats};
pub use transport::{
    event_channel, CharacteristicId, ConnectionState, PayloadProvider, TransportAdapter,
    TransportEvent, TransportEventReceiver, TransportEventSender, WriteCharacteristic, WriteType,
};

#[cfg(feature = "ble")]
pub use transport::BleTransport;

pub use test_utils::{MockHandshakeFactory, MockTransport, TestFixture};

// Protocol constants re-exports
pub use config::{
    AUTH_SERVICE_UUID, DEFAULT_ADVERTISEMENT_TIMEOUT, SERIAL_RX_CHAR_UUID, SERIAL_SERVICE_UUID,
    SERIAL_TX_CHAR_UUID,
};
pub use model::{NINEBOT_NAME_PREFIX, XIAOMI_NAME_PREFIX};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_ADVERTISEMENT_TIMEOUT, Duration::from_secs(5));
        assert_eq!(SERIAL_SERVICE_UUID, "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(NINEBOT_NAME_PREFIX, "NBScooter");
    }
}
