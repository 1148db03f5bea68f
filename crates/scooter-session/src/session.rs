//! Session controller - connection and authentication state machine
//!
//! The controller is the single owner of session state. It consumes
//! [`TransportEvent`]s and caller commands on one task, so advertisement,
//! connection-state and notification callbacks never interleave while
//! mutating the state or the crypto context.
//!
//! # State machine
//!
//! ```text
//!  connect_to ──► Connecting ──(transport: Ready)──► Ready ──► Authenticating
//!                                                              │        ▲
//!                                              inbound chunk ──┘        │
//!                                            engine returns state ──────┘
//!                                                              │
//!                                                              ▼
//!                                                          Connected
//!  any state ──(transport: Disconnected, not suppressed | disconnect())──► Disconnected
//! ```
//!
//! # Inbound routing
//!
//! Chunks on the serial RX characteristic are decrypted first when the
//! session variant is encrypted; a rejected chunk is dropped. Until the
//! handshake engine reports itself authenticated every chunk goes to the
//! engine, never to the parser; afterwards every chunk goes to the parser,
//! never to the engine.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{SessionConfig, SessionSettings};
use crate::crypto::{CryptoContext, CryptoIdentity, HandshakeEngineFactory, HandshakeOutbox};
use crate::device::{DeviceId, DiscoveredScooter};
use crate::error::{Result, SessionError};
use crate::model::{ProtocolVariant, ScooterModel};
use crate::parser::{MessageParser, NinebotFrameParser, ScooterFrame};
use crate::registry::DiscoveryRegistry;
use crate::transport::{
    CharacteristicId, ConnectionState, PayloadProvider, TransportAdapter, TransportEvent,
    TransportEventReceiver, WriteCharacteristic, WriteType,
};

/// Crypto context shared with pending write payload providers
pub type SharedCrypto = Arc<Mutex<CryptoContext>>;

/// Creates the parser for a session's variant
pub type ParserFactory = Box<dyn Fn(ProtocolVariant) -> Box<dyn MessageParser> + Send>;

/// Upper bound on states adopted back-to-back from one handshake step
const MAX_CHAINED_TRANSITIONS: usize = 8;

/// Externally observable session fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current connection state
    pub connection_state: ConnectionState,
    /// Set once the session entered `Authenticating`; cleared on disconnect
    pub authenticating: bool,
    /// Model of the selected scooter (`None` when disconnected)
    pub model: Option<ScooterModel>,
    /// Variant of the current attempt
    pub variant: Option<ProtocolVariant>,
    /// Target device of the current attempt
    pub device: Option<DeviceId>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            authenticating: false,
            model: None,
            variant: None,
            device: None,
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Advertisements processed
    pub advertisements: u64,
    /// Connection attempts started
    pub connect_attempts: u64,
    /// Reconnects triggered by a pairing button press
    pub button_press_reconnects: u64,
    /// Chunks handed to the handshake engine
    pub handshake_chunks: u64,
    /// Chunks dropped because decryption rejected them
    pub decrypt_rejections: u64,
    /// Chunks dropped because no session was active
    pub dropped_chunks: u64,
    /// Frames delivered to subscribers
    pub frames_parsed: u64,
    /// Writes handed to the transport
    pub writes: u64,
    /// Writes dropped because no session was active
    pub dropped_writes: u64,
    /// Writes the transport failed
    pub write_failures: u64,
}

/// Commands that can be sent to the controller
#[derive(Debug)]
pub enum SessionCommand {
    /// Connect to a discovered scooter
    ConnectTo {
        /// Target
        device: DiscoveredScooter,
        /// Force encrypted Ninebot framing
        force_nb_crypto: bool,
    },
    /// Connect to a listed scooter by id
    ConnectToId {
        /// Target id
        id: DeviceId,
        /// Force encrypted Ninebot framing
        force_nb_crypto: bool,
        /// Fails when the id is not listed
        reply: oneshot::Sender<Result<()>>,
    },
    /// Tear down the session
    Disconnect,
    /// Write raw bytes
    WriteRaw {
        /// Plaintext payload
        data: Vec<u8>,
        /// Target characteristic
        characteristic: WriteCharacteristic,
        /// Write mode
        write_type: WriteType,
    },
    /// Encode a frame with the session framing and write it to the serial channel
    SendFrame {
        /// Frame to send
        frame: ScooterFrame,
        /// Fails when no session is active or the frame does not encode
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get statistics
    GetStats(oneshot::Sender<SessionStats>),
    /// Stop the controller
    Shutdown,
}

/// Handle for controlling a running [`SessionController`]
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionSnapshot>,
    frame_tx: broadcast::Sender<ScooterFrame>,
    registry: DiscoveryRegistry,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.command_tx.send(command).await?;
        Ok(())
    }

    /// Connect to a discovered scooter, superseding any current attempt
    pub async fn connect_to(&self, device: DiscoveredScooter, force_nb_crypto: bool) -> Result<()> {
        self.send(SessionCommand::ConnectTo {
            device,
            force_nb_crypto,
        })
        .await
    }

    /// Connect to a currently listed scooter by id
    pub async fn connect_to_id(&self, id: DeviceId, force_nb_crypto: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ConnectToId {
            id,
            force_nb_crypto,
            reply,
        })
        .await?;
        rx.await?
    }

    /// Disconnect from the scooter; a no-op when already disconnected
    pub async fn disconnect_from_scooter(&self) -> Result<()> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Write raw bytes; serial writes are encrypted at send time when required
    pub async fn write_raw(
        &self,
        data: impl Into<Vec<u8>>,
        characteristic: WriteCharacteristic,
        write_type: WriteType,
    ) -> Result<()> {
        self.send(SessionCommand::WriteRaw {
            data: data.into(),
            characteristic,
            write_type,
        })
        .await
    }

    /// Encode and send a protocol frame on the serial channel
    pub async fn send_frame(&self, frame: ScooterFrame) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SendFrame { frame, reply }).await?;
        rx.await?
    }

    /// Current observable session fields
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Watch observable session fields
    pub fn subscribe_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    /// Receive parsed frames of authenticated sessions
    pub fn subscribe_frames(&self) -> broadcast::Receiver<ScooterFrame> {
        self.frame_tx.subscribe()
    }

    /// Discovered scooters in first-seen order
    pub fn discovered(&self) -> Vec<DiscoveredScooter> {
        self.registry.snapshot()
    }

    /// Get session statistics
    pub async fn stats(&self) -> Result<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetStats(tx)).await?;
        Ok(rx.await?)
    }

    /// Stop the controller
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Orchestrates discovery, connection, authentication and byte routing
pub struct SessionController<T: TransportAdapter> {
    settings: SessionSettings,
    transport: T,
    registry: DiscoveryRegistry,
    crypto: SharedCrypto,
    parser_factory: ParserFactory,
    parser: Option<Box<dyn MessageParser>>,
    state: ConnectionState,
    authenticating: bool,
    model: Option<ScooterModel>,
    variant: Option<ProtocolVariant>,
    force_nb_crypto: bool,
    target: Option<DeviceId>,
    state_tx: watch::Sender<SessionSnapshot>,
    frame_tx: broadcast::Sender<ScooterFrame>,
    command_rx: mpsc::Receiver<SessionCommand>,
    stats: SessionStats,
}

impl<T: TransportAdapter> SessionController<T> {
    /// Create a controller driving `transport`
    ///
    /// `engines` supplies a fresh handshake engine for every connection
    /// attempt.
    pub fn new(
        transport: T,
        config: &SessionConfig,
        engines: impl HandshakeEngineFactory + 'static,
    ) -> (Self, SessionHandle) {
        let registry = DiscoveryRegistry::from_config(&config.discovery);
        let (command_tx, command_rx) = mpsc::channel(config.session.command_queue_size.max(1));
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (frame_tx, _) = broadcast::channel(config.session.event_queue_size.max(1));

        let handle = SessionHandle {
            command_tx,
            state_rx,
            frame_tx: frame_tx.clone(),
            registry: registry.clone(),
        };

        let controller = Self {
            settings: config.session.clone(),
            transport,
            registry,
            crypto: Arc::new(Mutex::new(CryptoContext::new(engines))),
            parser_factory: Box::new(|variant: ProtocolVariant| -> Box<dyn MessageParser> {
                Box::new(NinebotFrameParser::for_variant(variant))
            }),
            parser: None,
            state: ConnectionState::Disconnected,
            authenticating: false,
            model: None,
            variant: None,
            force_nb_crypto: false,
            target: None,
            state_tx,
            frame_tx,
            command_rx,
            stats: SessionStats::default(),
        };

        (controller, handle)
    }

    /// Replace the parser used for authenticated traffic
    pub fn with_parser_factory(
        mut self,
        factory: impl Fn(ProtocolVariant) -> Box<dyn MessageParser> + Send + 'static,
    ) -> Self {
        self.parser_factory = Box::new(factory);
        self
    }

    /// Run the controller until shutdown
    ///
    /// Transport events are drained before caller commands so a command
    /// always observes every event reported before it.
    pub async fn run(mut self, mut events: TransportEventReceiver) -> Result<()> {
        info!(transport = self.transport.name(), "Starting scooter session controller");

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) | None => {
                            info!("Session shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
            }
        }

        self.disconnect().await;
        self.registry.clear();
        info!("Scooter session controller stopped");
        Ok(())
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ConnectTo {
                device,
                force_nb_crypto,
            } => self.connect_to(device, force_nb_crypto).await,
            SessionCommand::ConnectToId {
                id,
                force_nb_crypto,
                reply,
            } => {
                let result = match self.registry.get(&id) {
                    Some(device) => {
                        self.connect_to(device, force_nb_crypto).await;
                        Ok(())
                    }
                    None => Err(SessionError::PeripheralNotFound(id.to_string())),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect => self.disconnect().await,
            SessionCommand::WriteRaw {
                data,
                characteristic,
                write_type,
            } => self.write_raw(data, characteristic, write_type).await,
            SessionCommand::SendFrame { frame, reply } => {
                let result = self.send_frame(&frame).await;
                let _ = reply.send(result);
            }
            SessionCommand::GetStats(tx) => {
                let _ = tx.send(self.stats.clone());
            }
            SessionCommand::Shutdown => {}
        }
    }

    /// Process one transport event
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(record) => self.on_discover(record).await,
            TransportEvent::ConnectionStateChanged(state) => self.on_transport_state(state).await,
            TransportEvent::DataReceived {
                data,
                characteristic,
            } => self.on_receive(&data, &characteristic).await,
        }
    }

    async fn on_discover(&mut self, record: DiscoveredScooter) {
        self.stats.advertisements += 1;
        let candidate = record.clone();
        let observation = self.registry.observe(record);

        // Any known scooter may be the one whose button was pressed
        if !self.settings.reconnect_on_button_press || !observation.service_data_changed() {
            return;
        }
        if !self.crypto.lock().awaiting_button_press() {
            return;
        }
        let Some(variant) = self.variant else {
            return;
        };

        info!(
            device = %candidate.id,
            %variant,
            "Advertisement changed while awaiting button press, reconnecting"
        );
        self.stats.button_press_reconnects += 1;

        self.transport.set_block_disconnect_updates(true);
        if let Err(e) = self
            .transport
            .disconnect(Some("re-pairing after button press".to_string()))
            .await
        {
            debug!("Error dropping link before re-pairing: {}", e);
        }
        let force = self.force_nb_crypto;
        self.begin_attempt(candidate, force, variant).await;
    }

    /// Connect to `device`, superseding any current attempt
    ///
    /// The variant is chosen from the device model and `force_nb_crypto`, and
    /// the crypto context is re-seeded immediately.
    pub async fn connect_to(&mut self, device: DiscoveredScooter, force_nb_crypto: bool) {
        let variant = device.model.protocol_variant(force_nb_crypto);
        self.begin_attempt(device, force_nb_crypto, variant).await;
    }

    async fn begin_attempt(
        &mut self,
        device: DiscoveredScooter,
        force_nb_crypto: bool,
        variant: ProtocolVariant,
    ) {
        info!(
            device = %device.id,
            name = %device.name,
            model = %device.model,
            %variant,
            "Connecting to scooter"
        );
        self.stats.connect_attempts += 1;

        self.model = Some(device.model);
        self.force_nb_crypto = force_nb_crypto;
        self.variant = Some(variant);
        self.target = Some(device.id.clone());

        let has_engine = self
            .crypto
            .lock()
            .begin(CryptoIdentity::from_scooter(&device), variant);
        self.parser = Some((self.parser_factory)(variant));

        if !has_engine {
            self.transport.set_block_disconnect_updates(false);
            self.enter_disconnected();
            return;
        }

        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self
            .transport
            .connect(&device.peripheral, &device.name, variant)
            .await
        {
            warn!(device = %device.id, "Connection failed: {}", e);
            self.transport.set_block_disconnect_updates(false);
            self.enter_disconnected();
        }
    }

    async fn on_transport_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Disconnected {
            // Suppression covers the one link dropped for the reconnect
            if self.transport.block_disconnect_updates() {
                self.transport.set_block_disconnect_updates(false);
                debug!("Suppressed disconnect report during internal reconnect");
                return;
            }
            self.enter_disconnected();
            return;
        }
        if self.target.is_none() {
            trace!(%state, "Ignoring transport state without a session");
            return;
        }
        self.apply_state(state).await;
    }

    /// Adopt `next`, following up on states that imply an action
    async fn apply_state(&mut self, mut next: ConnectionState) {
        for _ in 0..MAX_CHAINED_TRANSITIONS {
            match next {
                ConnectionState::Disconnected => {
                    self.disconnect().await;
                    return;
                }
                ConnectionState::Ready => {
                    self.set_state(ConnectionState::Ready);
                    self.transport.set_block_disconnect_updates(false);

                    if self.crypto.lock().is_authenticated() {
                        return;
                    }
                    self.set_state(ConnectionState::Authenticating);

                    let mut outbox = HandshakeOutbox::new();
                    let follow_up = self.crypto.lock().start_authenticating(&mut outbox);
                    self.flush_outbox(outbox).await;
                    match follow_up {
                        Some(state) => next = state,
                        None => return,
                    }
                }
                ConnectionState::Connected => {
                    self.set_state(ConnectionState::Connected);
                    info!(device = ?self.target, "Scooter session authenticated");
                    return;
                }
                other => {
                    self.set_state(other);
                    return;
                }
            }
        }
        warn!(state = %self.state, "Handshake kept requesting transitions, waiting for data");
    }

    async fn on_receive(&mut self, data: &[u8], characteristic: &CharacteristicId) {
        if self.state == ConnectionState::Disconnected || self.target.is_none() {
            self.stats.dropped_chunks += 1;
            trace!(len = data.len(), "Dropping chunk without an active session");
            return;
        }

        let encrypted = self.variant.is_some_and(|v| v.is_encrypted());
        let payload = if characteristic.is_serial_rx() && encrypted {
            let decrypted = self.crypto.lock().decrypt(data);
            match decrypted {
                Some(plain) => plain,
                None => {
                    self.stats.decrypt_rejections += 1;
                    trace!(len = data.len(), "Dropping chunk that failed decryption");
                    return;
                }
            }
        } else {
            data.to_vec()
        };

        let authenticated = self.crypto.lock().is_authenticated();
        if !authenticated {
            self.stats.handshake_chunks += 1;
            let mut outbox = HandshakeOutbox::new();
            let next = self
                .crypto
                .lock()
                .continue_authenticating(&mut outbox, &payload, characteristic);
            self.flush_outbox(outbox).await;
            if let Some(state) = next {
                self.apply_state(state).await;
            }
            return;
        }

        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        for frame in parser.parse(&payload) {
            self.stats.frames_parsed += 1;
            trace!(command = frame.command, argument = frame.argument, "Parsed frame");
            // No subscribers is fine
            let _ = self.frame_tx.send(frame);
        }
    }

    async fn flush_outbox(&mut self, mut outbox: HandshakeOutbox) {
        for write in outbox.take() {
            self.write_raw(write.data, write.characteristic, write.write_type)
                .await;
        }
    }

    /// Write raw bytes to the scooter
    ///
    /// Serial writes of encrypted variants are encrypted by the payload
    /// provider when the transport sends them. A transport write failure
    /// tears the session down.
    pub async fn write_raw(
        &mut self,
        data: Vec<u8>,
        characteristic: WriteCharacteristic,
        write_type: WriteType,
    ) {
        if self.state == ConnectionState::Disconnected || self.state == ConnectionState::Connecting
        {
            self.stats.dropped_writes += 1;
            debug!(state = %self.state, ?characteristic, "Dropping write without a link");
            return;
        }

        let encrypt = characteristic == WriteCharacteristic::Serial
            && self.variant.is_some_and(|v| v.is_encrypted());
        let crypto = Arc::clone(&self.crypto);
        let payload: PayloadProvider = Box::new(move || {
            if !encrypt {
                return Some(data);
            }
            let sealed = crypto.lock().encrypt(&data);
            if sealed.is_none() {
                debug!(len = data.len(), "Abandoning serial write, session keys are gone");
            }
            sealed
        });

        self.stats.writes += 1;
        if let Err(e) = self
            .transport
            .write(write_type, characteristic, payload)
            .await
        {
            warn!(?characteristic, "Write failed: {}", e);
            self.stats.write_failures += 1;
            self.disconnect().await;
        }
    }

    /// Encode `frame` with the session framing and write it to the serial channel
    pub async fn send_frame(&mut self, frame: &ScooterFrame) -> Result<()> {
        let variant = self.variant.ok_or(SessionError::NotConnected)?;
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let bytes = frame.encode(variant)?;
        self.write_raw(bytes, WriteCharacteristic::Serial, WriteType::WithoutResponse)
            .await;
        Ok(())
    }

    /// Tear down the session; idempotent
    pub async fn disconnect(&mut self) {
        self.transport.set_block_disconnect_updates(false);
        if self.state != ConnectionState::Disconnected || self.target.is_some() {
            if let Err(e) = self.transport.disconnect(None).await {
                debug!("Error disconnecting transport: {}", e);
            }
        }
        self.enter_disconnected();
    }

    fn enter_disconnected(&mut self) {
        let was = self.state;
        self.state = ConnectionState::Disconnected;
        self.authenticating = false;
        self.model = None;
        self.variant = None;
        self.force_nb_crypto = false;
        self.target = None;
        self.crypto.lock().reset();
        self.parser = None;
        self.publish();

        if was != ConnectionState::Disconnected {
            info!(from = %was, "Scooter session disconnected");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state transition");
        }
        self.state = state;
        self.authenticating = self.authenticating || state == ConnectionState::Authenticating;
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    /// Current observable session fields
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.state,
            authenticating: self.authenticating,
            model: self.model,
            variant: self.variant,
            device: self.target.clone(),
        }
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session has been authenticating since it last connected
    pub fn is_authenticating(&self) -> bool {
        self.authenticating
    }

    /// Model of the selected scooter
    pub fn model(&self) -> Option<ScooterModel> {
        self.model
    }

    /// The discovery registry
    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    /// The crypto context shared with pending writes
    pub fn crypto(&self) -> &SharedCrypto {
        &self.crypto
    }

    /// The driven transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get session statistics
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfigBuilder;
    use crate::crypto::PlaintextOnly;
    use crate::device::PeripheralHandle;
    use crate::test_utils::{MockHandshakeFactory, MockTransport, AUTH_OK, BUTTON_PRESS};
    use bytes::Bytes;

    fn scooter(id: &str, name: &str, service_data: &'static [u8]) -> DiscoveredScooter {
        DiscoveredScooter::from_advertisement(
            DeviceId::new(id),
            name,
            Bytes::from_static(service_data),
            -60,
            None,
            PeripheralHandle::new(id),
        )
    }

    fn controller(
        engines: impl HandshakeEngineFactory + 'static,
    ) -> (SessionController<MockTransport>, SessionHandle) {
        let config = SessionConfigBuilder::new().build();
        SessionController::new(MockTransport::new(), &config, engines)
    }

    async fn ready(ctl: &mut SessionController<MockTransport>) {
        ctl.handle_event(TransportEvent::ConnectionStateChanged(ConnectionState::Ready))
            .await;
    }

    async fn receive(ctl: &mut SessionController<MockTransport>, data: Vec<u8>) {
        ctl.handle_event(TransportEvent::DataReceived {
            data: Bytes::from(data),
            characteristic: CharacteristicId::serial_rx(),
        })
        .await;
    }

    #[tokio::test]
    async fn test_plaintext_session_connects() {
        let (mut ctl, handle) = controller(PlaintextOnly);
        ctl.connect_to(scooter("1", "MIScooter01", &[0x00, 0x00]), false)
            .await;

        assert_eq!(ctl.connection_state(), ConnectionState::Connecting);
        assert_eq!(ctl.model(), Some(ScooterModel::Xiaomi));
        assert_eq!(ctl.transport().log().connects.len(), 1);

        ready(&mut ctl).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connected);
        assert!(ctl.is_authenticating());
        assert_eq!(handle.snapshot().connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_missing_engine_refuses_connection() {
        let (mut ctl, _handle) = controller(PlaintextOnly);
        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;

        assert_eq!(ctl.connection_state(), ConnectionState::Disconnected);
        assert!(ctl.transport().log().connects.is_empty());
        assert_eq!(ctl.model(), None);
    }

    #[tokio::test]
    async fn test_handshake_gates_parser() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, handle) = controller(engines.clone());
        let mut frames = handle.subscribe_frames();

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Authenticating);

        // A valid frame before authentication goes to the engine only
        let frame = ScooterFrame::ninebot(0x23, 0x3E, 0x04, 0x10, vec![1, 2]);
        let encoded = frame.encode(ProtocolVariant::Ninebot { encrypted: true }).unwrap();
        let sealed = engines.seal("NBScooter01", false, &encoded);
        receive(&mut ctl, sealed).await;
        assert!(frames.try_recv().is_err());
        assert_eq!(engines.log().received.len(), 1);

        receive(&mut ctl, engines.seal("NBScooter01", false, AUTH_OK)).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connected);

        // After authentication the same frame goes to the parser only
        receive(&mut ctl, engines.seal("NBScooter01", true, &encoded)).await;
        assert_eq!(frames.try_recv().unwrap(), frame);
        assert_eq!(engines.log().received.len(), 2);
        assert_eq!(ctl.stats().frames_parsed, 1);
    }

    #[tokio::test]
    async fn test_decrypt_rejection_is_silent() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, handle) = controller(engines.clone());
        let mut frames = handle.subscribe_frames();

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        receive(&mut ctl, engines.seal("NBScooter01", false, AUTH_OK)).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connected);

        receive(&mut ctl, vec![0xDE, 0xAD, 0xBE, 0xEF]).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connected);
        assert!(frames.try_recv().is_err());
        assert_eq!(ctl.stats().decrypt_rejections, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        ctl.disconnect().await;
        assert_eq!(ctl.connection_state(), ConnectionState::Disconnected);
        assert_eq!(ctl.transport().log().disconnects.len(), 0);

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        ctl.disconnect().await;
        ctl.disconnect().await;

        assert_eq!(ctl.transport().log().disconnects.len(), 1);
        assert!(!ctl.crypto().lock().is_active());
        assert!(!ctl.is_authenticating());
        assert_eq!(ctl.model(), None);
    }

    #[tokio::test]
    async fn test_transport_disconnect_resets_session() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        assert!(ctl.is_authenticating());

        ctl.handle_event(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ))
        .await;
        assert_eq!(ctl.snapshot(), SessionSnapshot::default());
        assert_eq!(engines.log().resets, 1);

        // Late data from the dropped link is ignored
        receive(&mut ctl, engines.seal("NBScooter01", false, AUTH_OK)).await;
        assert_eq!(ctl.stats().dropped_chunks, 1);
    }

    #[tokio::test]
    async fn test_suppressed_disconnect_keeps_session() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines);

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ctl.transport.set_block_disconnect_updates(true);
        ctl.handle_event(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ))
        .await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connecting);
        assert!(ctl.crypto().lock().is_active());
    }

    #[tokio::test]
    async fn test_superseding_connect() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        ctl.connect_to(scooter("a", "MIScooterA", &[0x08, 0x00]), false).await;
        ctl.connect_to(scooter("b", "NBScooterB", b""), true).await;

        let crypto = ctl.crypto().lock();
        assert_eq!(crypto.identity().map(|i| i.name.as_str()), Some("NBScooterB"));
        assert_eq!(crypto.variant(), Some(ProtocolVariant::Ninebot { encrypted: true }));
        drop(crypto);
        assert_eq!(ctl.snapshot().device, Some(DeviceId::new("b")));
        assert_eq!(engines.log().created, vec!["MIScooterA", "NBScooterB"]);
    }

    #[tokio::test]
    async fn test_button_press_reconnects_once() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        let first = scooter("1", "NBScooter01", b"P1");
        ctl.handle_event(TransportEvent::Discovered(first.clone())).await;
        ctl.connect_to(first, true).await;
        ready(&mut ctl).await;
        receive(&mut ctl, engines.seal("NBScooter01", false, BUTTON_PRESS)).await;
        assert!(ctl.crypto().lock().awaiting_button_press());

        ctl.handle_event(TransportEvent::Discovered(scooter("1", "NBScooter01", b"P2")))
            .await;
        // Same payload again: no change signal
        ctl.handle_event(TransportEvent::Discovered(scooter("1", "NBScooter01", b"P2")))
            .await;

        {
            let log = ctl.transport().log();
            assert_eq!(log.connects.len(), 2);
            assert_eq!(log.connects[1].variant, ProtocolVariant::Ninebot { encrypted: true });
            assert_eq!(log.disconnects.len(), 1);
        }
        assert_eq!(ctl.stats().button_press_reconnects, 1);
        assert!(ctl.transport().block_disconnect_updates());

        // Suppressed disconnect of the old link, then the new link comes up
        ctl.handle_event(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ))
        .await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connecting);
        assert!(!ctl.transport().block_disconnect_updates());
        ready(&mut ctl).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Authenticating);
    }

    #[tokio::test]
    async fn test_failed_reconnect_after_button_press_disconnects() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        let first = scooter("1", "NBScooter01", b"P1");
        ctl.handle_event(TransportEvent::Discovered(first.clone())).await;
        ctl.connect_to(first, false).await;
        ready(&mut ctl).await;
        receive(&mut ctl, engines.seal("NBScooter01", false, BUTTON_PRESS)).await;
        ctl.handle_event(TransportEvent::Discovered(scooter("1", "NBScooter01", b"P2")))
            .await;
        assert_eq!(ctl.stats().button_press_reconnects, 1);

        // The old link going away is swallowed
        let lost = TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected);
        ctl.handle_event(lost.clone()).await;
        assert_eq!(ctl.connection_state(), ConnectionState::Connecting);

        // The new attempt failing is not
        ctl.handle_event(lost).await;
        assert_eq!(ctl.snapshot(), SessionSnapshot::default());
        assert!(!ctl.transport().block_disconnect_updates());
        assert!(!ctl.crypto().lock().is_active());
    }

    #[tokio::test]
    async fn test_button_press_reconnects_to_changed_scooter() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        let first = scooter("1", "NBScooter01", b"P1");
        ctl.handle_event(TransportEvent::Discovered(first.clone())).await;
        ctl.handle_event(TransportEvent::Discovered(scooter("2", "NBScooter02", b"Q1")))
            .await;
        ctl.connect_to(first, true).await;
        ready(&mut ctl).await;
        receive(&mut ctl, engines.seal("NBScooter01", false, BUTTON_PRESS)).await;

        ctl.handle_event(TransportEvent::Discovered(scooter("2", "NBScooter02", b"Q2")))
            .await;

        assert_eq!(ctl.stats().button_press_reconnects, 1);
        {
            let log = ctl.transport().log();
            assert_eq!(log.connects.len(), 2);
            assert_eq!(log.connects[1].name, "NBScooter02");
            assert_eq!(log.connects[1].variant, ProtocolVariant::Ninebot { encrypted: true });
        }
        assert_eq!(ctl.snapshot().device, Some(DeviceId::new("2")));
        assert_eq!(engines.log().created, vec!["NBScooter01", "NBScooter02"]);
    }

    #[tokio::test]
    async fn test_payload_change_without_button_wait_is_ignored() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines);

        let first = scooter("1", "NBScooter01", b"P1");
        ctl.handle_event(TransportEvent::Discovered(first.clone())).await;
        ctl.connect_to(first, false).await;
        ctl.handle_event(TransportEvent::Discovered(scooter("1", "NBScooter01", b"P2")))
            .await;

        assert_eq!(ctl.transport().log().connects.len(), 1);
    }

    #[tokio::test]
    async fn test_serial_writes_encrypted_lazily() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        let hello_count = ctl.transport().log().writes.len();

        ctl.transport.defer_writes(true);
        ctl.write_raw(b"ping".to_vec(), WriteCharacteristic::Serial, WriteType::WithoutResponse)
            .await;
        ctl.write_raw(b"ctl".to_vec(), WriteCharacteristic::Upnp, WriteType::WithResponse)
            .await;

        // Keys rotate on authentication, before the deferred write goes out
        receive(&mut ctl, engines.seal("NBScooter01", false, AUTH_OK)).await;
        ctl.transport.flush_deferred();

        let log = ctl.transport().log();
        let serial = &log.writes[hello_count];
        assert_eq!(serial.characteristic, WriteCharacteristic::Serial);
        assert_eq!(engines.open("NBScooter01", true, &serial.data), Some(b"ping".to_vec()));
        assert_eq!(log.writes[hello_count + 1].data, b"ctl".to_vec());
    }

    #[tokio::test]
    async fn test_pending_serial_write_abandoned_after_disconnect() {
        let engines = MockHandshakeFactory::new();
        let (mut ctl, _handle) = controller(engines.clone());

        ctl.connect_to(scooter("1", "NBScooter01", b""), false).await;
        ready(&mut ctl).await;
        let hello_count = ctl.transport().log().writes.len();

        ctl.transport.defer_writes(true);
        ctl.write_raw(b"ping".to_vec(), WriteCharacteristic::Serial, WriteType::WithoutResponse)
            .await;
        ctl.disconnect().await;
        ctl.transport.flush_deferred();

        let log = ctl.transport().log();
        assert_eq!(log.writes.len(), hello_count);
        assert_eq!(log.abandoned_writes, 1);
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let (mut ctl, _handle) = controller(PlaintextOnly);
        ctl.connect_to(scooter("1", "MIScooter01", &[0x00, 0x00]), false)
            .await;
        ready(&mut ctl).await;

        ctl.transport.fail_writes(true);
        ctl.write_raw(vec![1], WriteCharacteristic::Serial, WriteType::WithoutResponse)
            .await;
        assert_eq!(ctl.connection_state(), ConnectionState::Disconnected);
        assert_eq!(ctl.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn test_writes_dropped_without_link() {
        let (mut ctl, _handle) = controller(PlaintextOnly);
        ctl.write_raw(vec![1], WriteCharacteristic::Serial, WriteType::WithoutResponse)
            .await;
        assert!(ctl.transport().log().writes.is_empty());
        assert_eq!(ctl.stats().dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_send_frame_requires_connection() {
        let (mut ctl, _handle) = controller(PlaintextOnly);
        let frame = ScooterFrame::xiaomi(0x20, 0x01, 0x10, vec![0x0E]);
        assert!(matches!(
            ctl.send_frame(&frame).await,
            Err(SessionError::NotConnected)
        ));

        ctl.connect_to(scooter("1", "MIScooter01", &[0x00, 0x00]), false)
            .await;
        ready(&mut ctl).await;
        ctl.send_frame(&frame).await.unwrap();

        let log = ctl.transport().log();
        let written = &log.writes.last().unwrap().data;
        assert_eq!(&written[..2], &[0x55, 0xAA]);
    }
}
