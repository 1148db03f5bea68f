//! Test utilities for driving a session without a radio
//!
//! [`MockTransport`] records every connect, disconnect and write, and can
//! report link state back through the transport event channel.
//! [`MockHandshakeFactory`] creates [`MockHandshake`] engines: a scripted
//! handshake over a toy keyed cipher whose key rotates once authenticated,
//! so tests can tell which key material a write was encrypted with.
//!
//! # Example
//!
//! ```rust,ignore
//! use scooter_session::test_utils::{TestFixture, AUTH_OK};
//!
//! #[tokio::test]
//! async fn test_session() {
//!     let session = TestFixture::new().spawn();
//!     let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
//!
//!     session.handle.connect_to(scooter, false).await.unwrap();
//!     session.notify(session.engines.seal("NBScooter01", false, AUTH_OK));
//!     session.settle().await;
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{SessionConfig, SessionConfigBuilder};
use crate::crypto::{
    CryptoIdentity, HandshakeEngine, HandshakeEngineFactory, HandshakeOutbox,
};
use crate::device::{DeviceId, DiscoveredScooter, PeripheralHandle};
use crate::error::{Result, SessionError};
use crate::model::ProtocolVariant;
use crate::session::{SessionController, SessionHandle, SessionStats};
use crate::transport::{
    event_channel, CharacteristicId, ConnectionState, PayloadProvider, TransportAdapter,
    TransportEvent, TransportEventReceiver, TransportEventSender, WriteCharacteristic, WriteType,
};

/// Chunk that completes a [`MockHandshake`]
pub const AUTH_OK: &[u8] = b"AUTH-OK";

/// Chunk that makes a [`MockHandshake`] wait for the power button
pub const BUTTON_PRESS: &[u8] = b"PRESS-POWER";

/// Chunk that makes a [`MockHandshake`] abort the session
pub const AUTH_FAIL: &[u8] = b"AUTH-FAIL";

/// First serial write of a [`MockHandshake`]
pub const HELLO: &[u8] = b"HELLO";

const TAG_LEN: usize = 4;

/// A recorded connect call
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    /// Peripheral handle passed in
    pub peripheral: PeripheralHandle,
    /// Scooter name passed in
    pub name: String,
    /// Variant passed in
    pub variant: ProtocolVariant,
}

/// A write as it went out, after the payload provider ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Write mode
    pub write_type: WriteType,
    /// Target characteristic
    pub characteristic: WriteCharacteristic,
    /// Bytes produced by the payload provider
    pub data: Vec<u8>,
}

/// Everything a [`MockTransport`] was asked to do
#[derive(Debug, Default)]
pub struct MockTransportLog {
    /// Connect calls in order
    pub connects: Vec<ConnectRecord>,
    /// Disconnect calls with their reason
    pub disconnects: Vec<Option<String>>,
    /// Completed writes in send order
    pub writes: Vec<WriteRecord>,
    /// Writes whose payload provider gave up
    pub abandoned_writes: usize,
}

#[derive(Default)]
struct MockTransportState {
    log: MockTransportLog,
    deferred: Vec<(WriteType, WriteCharacteristic, PayloadProvider)>,
    defer_writes: bool,
    fail_writes: bool,
    fail_connects: bool,
    block_disconnect_updates: bool,
}

/// Transport that records calls instead of touching a radio
///
/// Clones share the same log, so a test can keep one while the controller
/// owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
    events: Option<TransportEventSender>,
}

impl MockTransport {
    /// Create a silent mock; link state must be injected by the test
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that reports `Ready` after connect and `Disconnected`
    /// after disconnect
    pub fn with_events(events: TransportEventSender) -> Self {
        Self {
            state: Arc::default(),
            events: Some(events),
        }
    }

    /// Recorded calls
    pub fn log(&self) -> MappedMutexGuard<'_, MockTransportLog> {
        MutexGuard::map(self.state.lock(), |s| &mut s.log)
    }

    /// Hold writes until [`MockTransport::flush_deferred`]
    pub fn defer_writes(&self, defer: bool) {
        self.state.lock().defer_writes = defer;
    }

    /// Send held writes, running their payload providers now
    pub fn flush_deferred(&self) {
        let deferred = std::mem::take(&mut self.state.lock().deferred);
        for (write_type, characteristic, payload) in deferred {
            self.record_write(write_type, characteristic, payload);
        }
    }

    /// Fail every write
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Fail every connect
    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    fn record_write(
        &self,
        write_type: WriteType,
        characteristic: WriteCharacteristic,
        payload: PayloadProvider,
    ) {
        let data = payload();
        let mut state = self.state.lock();
        match data {
            Some(data) => state.log.writes.push(WriteRecord {
                write_type,
                characteristic,
                data,
            }),
            None => state.log.abandoned_writes += 1,
        }
    }

    fn report(&self, state: ConnectionState) {
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::ConnectionStateChanged(state));
        }
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn connect(
        &mut self,
        peripheral: &PeripheralHandle,
        name: &str,
        variant: ProtocolVariant,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_connects {
                return Err(SessionError::ConnectFailed {
                    device: name.to_string(),
                    reason: "simulated failure".to_string(),
                });
            }
            state.log.connects.push(ConnectRecord {
                peripheral: peripheral.clone(),
                name: name.to_string(),
                variant,
            });
        }
        self.report(ConnectionState::Ready);
        Ok(())
    }

    async fn disconnect(&mut self, reason: Option<String>) -> Result<()> {
        self.state.lock().log.disconnects.push(reason);
        self.report(ConnectionState::Disconnected);
        Ok(())
    }

    async fn write(
        &mut self,
        write_type: WriteType,
        characteristic: WriteCharacteristic,
        payload: PayloadProvider,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(SessionError::WriteError("simulated failure".to_string()));
        }
        if state.defer_writes {
            state.deferred.push((write_type, characteristic, payload));
            return Ok(());
        }
        drop(state);

        self.record_write(write_type, characteristic, payload);
        Ok(())
    }

    fn set_block_disconnect_updates(&mut self, block: bool) {
        self.state.lock().block_disconnect_updates = block;
    }

    fn block_disconnect_updates(&self) -> bool {
        self.state.lock().block_disconnect_updates
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

/// What [`MockHandshake`] engines saw
#[derive(Debug, Clone, Default)]
pub struct HandshakeLog {
    /// Scooter names engines were created for, in order
    pub created: Vec<String>,
    /// Chunks fed to `continue_authenticating`
    pub received: Vec<Vec<u8>>,
    /// Number of engine resets
    pub resets: usize,
}

fn derive_key(name: &str, authenticated: bool) -> [u8; 32] {
    let phase: &[u8] = if authenticated { b"session" } else { b"pairing" };
    let digest = Sha256::new()
        .chain_update(name.as_bytes())
        .chain_update(phase)
        .finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn tag(key: &[u8; 32], plaintext: &[u8]) -> [u8; TAG_LEN] {
    let digest = Sha256::new().chain_update(key).chain_update(plaintext).finalize();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

fn apply_keystream(key: &[u8; 32], nonce: u8, data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()] ^ nonce)
        .collect()
}

/// Encrypt `plaintext` the way a [`MockHandshake`] for `name` would
///
/// Layout: nonce, keystream-XORed body, 4-byte tag.
pub fn seal(name: &str, authenticated: bool, plaintext: &[u8]) -> Vec<u8> {
    let key = derive_key(name, authenticated);
    let nonce: u8 = rand::random();
    let mut out = Vec::with_capacity(plaintext.len() + 1 + TAG_LEN);
    out.push(nonce);
    out.extend(apply_keystream(&key, nonce, plaintext));
    out.extend_from_slice(&tag(&key, plaintext));
    out
}

/// Decrypt output of [`seal`]; `None` when the tag does not match
pub fn open(name: &str, authenticated: bool, sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < 1 + TAG_LEN {
        return None;
    }
    let key = derive_key(name, authenticated);
    let nonce = sealed[0];
    let (body, received_tag) = sealed[1..].split_at(sealed.len() - 1 - TAG_LEN);
    let plain = apply_keystream(&key, nonce, body);
    (tag(&key, &plain).as_slice() == received_tag).then_some(plain)
}

/// Scripted handshake engine
///
/// Sends [`HELLO`] when started, then reacts to [`AUTH_OK`],
/// [`BUTTON_PRESS`] and [`AUTH_FAIL`]. The cipher key is derived from the
/// scooter name and changes when the handshake completes.
pub struct MockHandshake {
    name: String,
    authenticated: bool,
    awaiting_button_press: bool,
    log: Arc<Mutex<HandshakeLog>>,
}

impl HandshakeEngine for MockHandshake {
    fn reset(&mut self) {
        self.authenticated = false;
        self.awaiting_button_press = false;
        self.log.lock().resets += 1;
    }

    fn start_authenticating(&mut self, outbox: &mut HandshakeOutbox) -> Option<ConnectionState> {
        outbox.write(HELLO, WriteCharacteristic::Serial, WriteType::WithoutResponse);
        None
    }

    fn continue_authenticating(
        &mut self,
        _outbox: &mut HandshakeOutbox,
        received: &[u8],
        _characteristic: &CharacteristicId,
    ) -> Option<ConnectionState> {
        self.log.lock().received.push(received.to_vec());
        match received {
            r if r == AUTH_OK => {
                self.authenticated = true;
                self.awaiting_button_press = false;
                Some(ConnectionState::Connected)
            }
            r if r == BUTTON_PRESS => {
                self.awaiting_button_press = true;
                None
            }
            r if r == AUTH_FAIL => Some(ConnectionState::Disconnected),
            _ => None,
        }
    }

    fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        seal(&self.name, self.authenticated, data)
    }

    fn decrypt(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        open(&self.name, self.authenticated, data)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn awaiting_button_press(&self) -> bool {
        self.awaiting_button_press
    }
}

/// Creates [`MockHandshake`] engines for every variant
///
/// Clones share the same [`HandshakeLog`].
#[derive(Clone, Default)]
pub struct MockHandshakeFactory {
    log: Arc<Mutex<HandshakeLog>>,
}

impl MockHandshakeFactory {
    /// Create a new factory
    pub fn new() -> Self {
        Self::default()
    }

    /// What engines created by this factory saw
    pub fn log(&self) -> MutexGuard<'_, HandshakeLog> {
        self.log.lock()
    }

    /// See [`seal`]
    pub fn seal(&self, name: &str, authenticated: bool, plaintext: &[u8]) -> Vec<u8> {
        seal(name, authenticated, plaintext)
    }

    /// See [`open`]
    pub fn open(&self, name: &str, authenticated: bool, sealed: &[u8]) -> Option<Vec<u8>> {
        open(name, authenticated, sealed)
    }
}

impl HandshakeEngineFactory for MockHandshakeFactory {
    fn create(
        &self,
        identity: &CryptoIdentity,
        _variant: ProtocolVariant,
    ) -> Option<Box<dyn HandshakeEngine>> {
        self.log.lock().created.push(identity.name.clone());
        Some(Box::new(MockHandshake {
            name: identity.name.clone(),
            authenticated: false,
            awaiting_button_press: false,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Test fixture for creating pre-configured sessions
pub struct TestFixture {
    /// Transport handed to the controller
    pub transport: MockTransport,
    /// Engine factory handed to the controller
    pub engines: MockHandshakeFactory,
    /// Session configuration
    pub config: SessionConfig,
    events: TransportEventSender,
    events_rx: TransportEventReceiver,
}

impl TestFixture {
    /// Create a fixture whose transport reports link state by itself
    pub fn new() -> Self {
        Self::with_config(SessionConfigBuilder::new().build())
    }

    /// Create a fixture with a custom configuration
    pub fn with_config(config: SessionConfig) -> Self {
        let (events, events_rx) = event_channel();
        Self {
            transport: MockTransport::with_events(events.clone()),
            engines: MockHandshakeFactory::new(),
            config,
            events,
            events_rx,
        }
    }

    /// Build an advertisement record
    pub fn scooter(id: &str, name: &str, service_data: &[u8]) -> DiscoveredScooter {
        DiscoveredScooter::from_advertisement(
            DeviceId::new(id),
            name,
            Bytes::copy_from_slice(service_data),
            -60,
            None,
            PeripheralHandle::new(id),
        )
    }

    /// Start a controller on its own task
    pub fn spawn(self) -> RunningSession {
        let (controller, handle) =
            SessionController::new(self.transport.clone(), &self.config, self.engines.clone());
        let task = tokio::spawn(controller.run(self.events_rx));
        RunningSession {
            handle,
            transport: self.transport,
            engines: self.engines,
            events: self.events,
            task,
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A controller running on its own task
pub struct RunningSession {
    /// Handle to the controller
    pub handle: SessionHandle,
    /// Shared view of the controller's transport
    pub transport: MockTransport,
    /// Shared view of the controller's engine factory
    pub engines: MockHandshakeFactory,
    /// Injects transport events
    pub events: TransportEventSender,
    /// The controller task
    pub task: JoinHandle<Result<()>>,
}

impl RunningSession {
    /// Inject an advertisement
    pub fn advertise(&self, record: DiscoveredScooter) {
        let _ = self.events.send(TransportEvent::Discovered(record));
    }

    /// Inject a notification on the serial RX characteristic
    pub fn notify(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::DataReceived {
            data: data.into(),
            characteristic: CharacteristicId::serial_rx(),
        });
    }

    /// Inject a link state report
    pub fn report(&self, state: ConnectionState) {
        let _ = self
            .events
            .send(TransportEvent::ConnectionStateChanged(state));
    }

    /// Wait until every event and command sent so far has been handled
    pub async fn settle(&self) -> Result<SessionStats> {
        self.handle.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let sealed = seal("NBScooter01", false, b"hello");
        assert_eq!(open("NBScooter01", false, &sealed), Some(b"hello".to_vec()));
        assert_eq!(open("NBScooter01", true, &sealed), None);
        assert_eq!(open("NBScooter02", false, &sealed), None);
        assert_eq!(open("NBScooter01", false, &[1, 2, 3]), None);
    }

    #[test]
    fn test_mock_handshake_script() {
        let factory = MockHandshakeFactory::new();
        let variant = ProtocolVariant::Ninebot { encrypted: true };
        let mut engine = factory
            .create(&CryptoIdentity::new("NBScooter01"), variant)
            .unwrap();
        let mut outbox = HandshakeOutbox::new();
        let rx = CharacteristicId::serial_rx();

        assert_eq!(engine.start_authenticating(&mut outbox), None);
        assert_eq!(outbox.take()[0].data, HELLO.to_vec());

        engine.continue_authenticating(&mut outbox, BUTTON_PRESS, &rx);
        assert!(engine.awaiting_button_press());

        assert_eq!(
            engine.continue_authenticating(&mut outbox, AUTH_OK, &rx),
            Some(ConnectionState::Connected)
        );
        assert!(engine.is_authenticated());
        assert!(!engine.awaiting_button_press());

        let sealed = engine.encrypt(b"data");
        assert_eq!(engine.decrypt(&sealed), Some(b"data".to_vec()));

        engine.reset();
        assert_eq!(factory.log().resets, 1);
        assert_eq!(factory.log().received.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_reports() {
        let (tx, mut rx) = event_channel();
        let mut transport = MockTransport::with_events(tx);
        let variant = ProtocolVariant::Xiaomi { encrypted: false };

        transport
            .connect(&PeripheralHandle::new("p"), "MIScooter01", variant)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::ConnectionStateChanged(ConnectionState::Ready))
        ));

        transport
            .write(
                WriteType::WithResponse,
                WriteCharacteristic::Upnp,
                Box::new(|| Some(vec![7])),
            )
            .await
            .unwrap();
        assert_eq!(transport.log().writes[0].data, vec![7]);

        transport.fail_writes(true);
        assert!(transport
            .write(WriteType::WithResponse, WriteCharacteristic::Upnp, Box::new(|| None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_deferred_writes_run_provider_late() {
        let mut transport = MockTransport::new();
        let value = Arc::new(Mutex::new(1u8));
        transport.defer_writes(true);

        let captured = Arc::clone(&value);
        transport
            .write(
                WriteType::WithoutResponse,
                WriteCharacteristic::Serial,
                Box::new(move || Some(vec![*captured.lock()])),
            )
            .await
            .unwrap();
        assert!(transport.log().writes.is_empty());

        *value.lock() = 2;
        transport.flush_deferred();
        assert_eq!(transport.log().writes[0].data, vec![2]);
    }
}
