//! Bluetooth Low Energy transport backed by btleplug
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this transport.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```
//!
//! Scanning and connecting run on background tasks; results come back as
//! [`TransportEvent`]s. `Disconnected` is reported for every loss of the
//! current link, including ones the controller asked for; suppressing those
//! during a re-pair is the controller's call, based on the block flag kept
//! here.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    CharacteristicId, ConnectionState, PayloadProvider, TransportAdapter, TransportEvent,
    TransportEventSender, WriteCharacteristic, WriteType,
};
use crate::config::{
    DiscoveryConfig, AUTH_SERVICE_UUID, AVDTP_CHAR_UUID, SERIAL_RX_CHAR_UUID,
    SERIAL_TX_CHAR_UUID, UPNP_CHAR_UUID,
};
use crate::device::{DeviceId, DiscoveredScooter, PeripheralHandle};
use crate::error::{Result, SessionError};
use crate::model::ProtocolVariant;

/// Resolved GATT characteristics of the current link
#[derive(Clone)]
struct Link {
    handle: String,
    peripheral: Peripheral,
    serial_tx: Characteristic,
    upnp: Option<Characteristic>,
    avdtp: Option<Characteristic>,
}

impl Link {
    fn characteristic(&self, target: WriteCharacteristic) -> Option<&Characteristic> {
        match target {
            WriteCharacteristic::Serial => Some(&self.serial_tx),
            WriteCharacteristic::Upnp => self.upnp.as_ref(),
            WriteCharacteristic::Avdtp => self.avdtp.as_ref(),
        }
    }
}

#[derive(Default)]
struct Shared {
    peripherals: HashMap<String, Peripheral>,
    link: Option<Link>,
    /// Handle of the peripheral being connected or connected
    target: Option<String>,
}

/// BLE transport for scooters
pub struct BleTransport {
    adapter: Adapter,
    events: TransportEventSender,
    discovery: DiscoveryConfig,
    shared: Arc<Mutex<Shared>>,
    block_disconnect_updates: bool,
    scan_task: Option<JoinHandle<()>>,
    /// Opens the link, then forwards its notifications
    connect_task: Option<JoinHandle<()>>,
}

fn handle_of(id: &PeripheralId) -> String {
    format!("{:?}", id)
}

impl BleTransport {
    /// Open the first Bluetooth adapter of the host
    pub async fn new(events: TransportEventSender, discovery: DiscoveryConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SessionError::NoAdapter)?;

        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            events,
            discovery,
            shared: Arc::new(Mutex::new(Shared::default())),
            block_disconnect_updates: false,
            scan_task: None,
            connect_task: None,
        })
    }

    /// Start scanning; every matching advertisement becomes a `Discovered` event
    pub async fn start_scan(&mut self) -> Result<()> {
        if self.scan_task.is_some() {
            return Ok(());
        }
        let mut central_events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for scooters");

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let discovery = self.discovery.clone();
        let shared = Arc::clone(&self.shared);

        self.scan_task = Some(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServiceDataAdvertisement { id, .. } => {
                        if let Err(e) =
                            report_advertisement(&adapter, &id, &discovery, &shared, &events).await
                        {
                            trace!("Skipping advertisement: {}", e);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let handle = handle_of(&id);
                        let is_target = {
                            let mut shared = shared.lock();
                            // Links still being opened report failure themselves
                            let is_target = shared.link.is_some()
                                && shared.target.as_deref() == Some(handle.as_str());
                            if is_target {
                                shared.link = None;
                                shared.target = None;
                            }
                            is_target
                        };
                        if is_target {
                            debug!(peripheral = %handle, "Scooter link lost");
                            let _ = events.send(TransportEvent::ConnectionStateChanged(
                                ConnectionState::Disconnected,
                            ));
                        }
                    }
                    _ => {}
                }
            }
            debug!("Central event stream ended");
        }));
        Ok(())
    }

    /// Stop scanning
    pub async fn stop_scan(&mut self) -> Result<()> {
        if let Some(task) = self.scan_task.take() {
            task.abort();
            self.adapter.stop_scan().await?;
            info!("Stopped scanning");
        }
        Ok(())
    }

    fn drop_link_task(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}

async fn report_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    discovery: &DiscoveryConfig,
    shared: &Arc<Mutex<Shared>>,
    events: &TransportEventSender,
) -> Result<()> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(());
    };
    let Some(name) = properties.local_name else {
        return Ok(());
    };
    if !discovery.accepts_name(&name) {
        return Ok(());
    }

    // Prefer the Mi beacon payload; fall back to whatever is advertised
    let service_data = properties
        .service_data
        .iter()
        .find(|(uuid, _)| uuid.to_string() == AUTH_SERVICE_UUID)
        .or_else(|| properties.service_data.iter().next())
        .map(|(_, data)| Bytes::copy_from_slice(data))
        .unwrap_or_default();

    let handle = handle_of(id);
    shared.lock().peripherals.insert(handle.clone(), peripheral);

    let record = DiscoveredScooter::from_advertisement(
        DeviceId::new(handle.clone()),
        name,
        service_data,
        properties.rssi.unwrap_or(i16::MIN),
        Some(properties.address.to_string()),
        PeripheralHandle::new(handle),
    );
    let _ = events.send(TransportEvent::Discovered(record));
    Ok(())
}

async fn open_link(
    handle: String,
    peripheral: Peripheral,
    variant: ProtocolVariant,
) -> Result<(Link, Vec<Characteristic>)> {
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }
    peripheral.discover_services().await?;

    let characteristics = peripheral.characteristics();
    let find = |uuid: &str| {
        characteristics
            .iter()
            .find(|c| c.uuid.to_string() == uuid)
            .cloned()
    };

    let serial_tx = find(SERIAL_TX_CHAR_UUID)
        .ok_or_else(|| SessionError::CharacteristicNotFound(SERIAL_TX_CHAR_UUID.to_string()))?;
    let serial_rx = find(SERIAL_RX_CHAR_UUID)
        .ok_or_else(|| SessionError::CharacteristicNotFound(SERIAL_RX_CHAR_UUID.to_string()))?;
    let upnp = find(UPNP_CHAR_UUID);
    let avdtp = find(AVDTP_CHAR_UUID);

    let mut subscribe = vec![serial_rx];
    // Mi authentication talks over its own pair of characteristics
    if matches!(variant, ProtocolVariant::Xiaomi { encrypted: true }) {
        subscribe.extend(upnp.clone());
        subscribe.extend(avdtp.clone());
    }

    let link = Link {
        handle,
        peripheral,
        serial_tx,
        upnp,
        avdtp,
    };
    Ok((link, subscribe))
}

#[async_trait]
impl TransportAdapter for BleTransport {
    async fn connect(
        &mut self,
        peripheral: &PeripheralHandle,
        name: &str,
        variant: ProtocolVariant,
    ) -> Result<()> {
        self.drop_link_task();

        let (target, previous) = {
            let mut shared = self.shared.lock();
            let target = shared
                .peripherals
                .get(peripheral.raw())
                .cloned()
                .ok_or_else(|| SessionError::PeripheralNotFound(name.to_string()))?;
            // Retarget first so the central event for the old link is not reported
            let previous = shared.link.take();
            shared.target = Some(peripheral.raw().to_string());
            (target, previous)
        };

        if let Some(previous) = previous.filter(|link| link.handle != peripheral.raw()) {
            debug!(peripheral = %previous.handle, "Dropping superseded link");
            if let Err(e) = previous.peripheral.disconnect().await {
                debug!(peripheral = %previous.handle, "Error dropping superseded link: {}", e);
            }
        }

        info!(scooter = %name, %variant, "Connecting");

        let handle = peripheral.raw().to_string();
        let device = name.to_string();
        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);

        self.connect_task = Some(tokio::spawn(async move {
            let opened = async {
                let (link, subscribe) = open_link(handle.clone(), target, variant).await?;
                for characteristic in &subscribe {
                    link.peripheral.subscribe(characteristic).await?;
                }
                let notifications = link.peripheral.notifications().await?;
                Ok::<_, SessionError>((link, notifications))
            }
            .await;

            let (link, mut notifications) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(scooter = %device, "Connection failed: {}", e);
                    shared.lock().target = None;
                    let _ = events.send(TransportEvent::ConnectionStateChanged(
                        ConnectionState::Disconnected,
                    ));
                    return;
                }
            };

            {
                let mut shared = shared.lock();
                if shared.target.as_deref() != Some(handle.as_str()) {
                    return;
                }
                shared.link = Some(link);
            }
            debug!(scooter = %device, "GATT resolved, notifications subscribed");
            let _ = events.send(TransportEvent::ConnectionStateChanged(ConnectionState::Ready));

            while let Some(notification) = notifications.next().await {
                let _ = events.send(TransportEvent::DataReceived {
                    data: Bytes::from(notification.value),
                    characteristic: CharacteristicId::new(notification.uuid.to_string()),
                });
            }
            trace!(scooter = %device, "Notification stream ended");
        }));

        Ok(())
    }

    async fn disconnect(&mut self, reason: Option<String>) -> Result<()> {
        self.drop_link_task();

        let (link, target) = {
            let mut shared = self.shared.lock();
            let link = shared.link.take();
            let target = shared.target.take();
            (link, target)
        };

        let peripheral = match link {
            Some(link) => Some(link.peripheral),
            None => target.and_then(|t| self.shared.lock().peripherals.get(&t).cloned()),
        };
        let Some(peripheral) = peripheral else {
            return Ok(());
        };

        debug!(reason = reason.as_deref().unwrap_or("requested"), "Disconnecting");
        let result = peripheral.disconnect().await;

        // The central event for our own disconnect may race the cleared target
        let _ = self.events.send(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ));
        result.map_err(SessionError::from)
    }

    async fn write(
        &mut self,
        write_type: WriteType,
        characteristic: WriteCharacteristic,
        payload: PayloadProvider,
    ) -> Result<()> {
        let link = self.shared.lock().link.clone().ok_or(SessionError::NotConnected)?;
        let target = link
            .characteristic(characteristic)
            .ok_or_else(|| SessionError::CharacteristicNotFound(characteristic.uuid().to_string()))?;

        let mode = match write_type {
            WriteType::WithResponse => BleWriteType::WithResponse,
            WriteType::WithoutResponse => BleWriteType::WithoutResponse,
        };
        let Some(data) = payload() else {
            return Ok(());
        };
        trace!(peripheral = %link.handle, len = data.len(), ?characteristic, "Writing");
        link.peripheral
            .write(target, &data, mode)
            .await
            .map_err(|e| SessionError::WriteError(e.to_string()))
    }

    fn set_block_disconnect_updates(&mut self, block: bool) {
        self.block_disconnect_updates = block;
    }

    fn block_disconnect_updates(&self) -> bool {
        self.block_disconnect_updates
    }

    fn name(&self) -> &str {
        "ble"
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.drop_link_task();
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}
