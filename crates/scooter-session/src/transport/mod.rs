//! Transport adapter contract
//!
//! The transport owns the radio: scanning, connecting, characteristic writes
//! and notification delivery. It reports what happens through a single
//! [`TransportEvent`] channel handed to it at construction and never decides
//! session semantics itself.
//!
//! - [`ble::BleTransport`] - btleplug-backed transport (requires `ble` feature)
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev pkg-config
//!   ```

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BleTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{AVDTP_CHAR_UUID, SERIAL_RX_CHAR_UUID, SERIAL_TX_CHAR_UUID, UPNP_CHAR_UUID};
use crate::device::{DiscoveredScooter, PeripheralHandle};
use crate::error::Result;
use crate::model::ProtocolVariant;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link requested, GATT not resolved yet
    Connecting,
    /// GATT resolved and notifications subscribed
    Ready,
    /// Handshake in progress
    Authenticating,
    /// Authenticated; protocol traffic flows
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Characteristic a write is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteCharacteristic {
    /// Serial TX; the secure channel
    Serial,
    /// Xiaomi authentication control
    Upnp,
    /// Xiaomi authentication data
    Avdtp,
}

impl WriteCharacteristic {
    /// GATT UUID of this characteristic
    pub fn uuid(&self) -> &'static str {
        match self {
            WriteCharacteristic::Serial => SERIAL_TX_CHAR_UUID,
            WriteCharacteristic::Upnp => UPNP_CHAR_UUID,
            WriteCharacteristic::Avdtp => AVDTP_CHAR_UUID,
        }
    }
}

/// GATT write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    /// Acknowledged write
    WithResponse,
    /// Unacknowledged write
    WithoutResponse,
}

/// UUID of a characteristic that delivered a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicId(String);

impl CharacteristicId {
    /// Wrap a UUID string; stored lowercase
    pub fn new(uuid: impl AsRef<str>) -> Self {
        Self(uuid.as_ref().to_ascii_lowercase())
    }

    /// The serial receive channel
    pub fn serial_rx() -> Self {
        Self::new(SERIAL_RX_CHAR_UUID)
    }

    /// The Xiaomi authentication control channel
    pub fn upnp() -> Self {
        Self::new(UPNP_CHAR_UUID)
    }

    /// The Xiaomi authentication data channel
    pub fn avdtp() -> Self {
        Self::new(AVDTP_CHAR_UUID)
    }

    /// Whether this is the channel that gets decrypted
    pub fn is_serial_rx(&self) -> bool {
        self.0 == SERIAL_RX_CHAR_UUID
    }

    /// The UUID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces the final bytes of a write at the moment it is sent
///
/// Encryption happens inside the provider so the key material current at
/// send time is used, not the one current when the write was requested.
/// `None` abandons the write: the key material it needed is gone.
pub type PayloadProvider = Box<dyn FnOnce() -> Option<Vec<u8>> + Send>;

/// Events a transport reports to the session controller
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement from a scooter
    Discovered(DiscoveredScooter),
    /// Raw link state changed (`Ready` once GATT is resolved, `Disconnected` on loss)
    ConnectionStateChanged(ConnectionState),
    /// A notification payload
    DataReceived {
        /// Payload bytes
        data: Bytes,
        /// Characteristic that delivered it
        characteristic: CharacteristicId,
    },
}

/// Sending half of the transport event channel
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the transport event channel
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport reports through
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Trait for scooter transports
///
/// Implementations are driven exclusively by the session controller task.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Connect to a peripheral and resolve the GATT characteristics
    ///
    /// Completion is reported asynchronously as
    /// `ConnectionStateChanged(Ready)`.
    async fn connect(
        &mut self,
        peripheral: &PeripheralHandle,
        name: &str,
        variant: ProtocolVariant,
    ) -> Result<()>;

    /// Drop the current link, if any
    async fn disconnect(&mut self, reason: Option<String>) -> Result<()>;

    /// Write to a characteristic; `payload` is invoked when the write is sent
    async fn write(
        &mut self,
        write_type: WriteType,
        characteristic: WriteCharacteristic,
        payload: PayloadProvider,
    ) -> Result<()>;

    /// Suppress (or stop suppressing) `Disconnected` reports
    fn set_block_disconnect_updates(&mut self, block: bool);

    /// Whether `Disconnected` reports are currently suppressed
    fn block_disconnect_updates(&self) -> bool;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}
