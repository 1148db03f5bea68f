//! Discovered scooter records

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{mac_from_service_data, ScooterModel};

/// Identifier of a peripheral, stable for one physical device per scan session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device id from the platform identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque handle the transport uses to find the peripheral again
///
/// The session core never inspects it; it only hands it back to
/// [`TransportAdapter::connect`](crate::transport::TransportAdapter::connect).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Wrap a transport-specific handle
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The transport-specific handle
    pub fn raw(&self) -> &str {
        &self.0
    }
}

/// One entry of the discovery list
#[derive(Debug, Clone)]
pub struct DiscoveredScooter {
    /// Peripheral identifier
    pub id: DeviceId,
    /// Advertised name
    pub name: String,
    /// Detected model
    pub model: ScooterModel,
    /// Raw advertisement service data
    pub service_data: Bytes,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Hardware address, when the platform or beacon exposes one
    pub mac: Option<String>,
    /// Transport handle
    pub peripheral: PeripheralHandle,
    /// When this advertisement was observed
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredScooter {
    /// Build a record from one advertisement
    ///
    /// The model is classified from name and service data, and the hardware
    /// address falls back to the one embedded in the beacon.
    pub fn from_advertisement(
        id: DeviceId,
        name: impl Into<String>,
        service_data: impl Into<Bytes>,
        rssi: i16,
        address: Option<String>,
        peripheral: PeripheralHandle,
    ) -> Self {
        let name = name.into();
        let service_data = service_data.into();
        let model = ScooterModel::from_advertisement(&name, &service_data);
        let mac = address.or_else(|| mac_from_service_data(&service_data));

        Self {
            id,
            name,
            model,
            service_data,
            rssi,
            mac,
            peripheral,
            last_seen: Utc::now(),
        }
    }
}
