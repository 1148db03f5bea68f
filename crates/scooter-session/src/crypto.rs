//! Crypto handshake contract and per-session crypto context
//!
//! The concrete handshake and cipher of each protocol variant are pluggable:
//! the session controller only sees a [`HandshakeEngine`], created fresh by a
//! [`HandshakeEngineFactory`] on every connection attempt and dropped again on
//! disconnect. The engine owns all key derivation; the controller treats it as
//! opaque and only asks whether it is authenticated.
//!
//! Engines never talk to the transport directly. Writes a handshake step
//! wants to make are queued in a [`HandshakeOutbox`] and flushed by the
//! controller through the same encrypt-on-write path as caller writes.

use tracing::{debug, warn};

use crate::device::DiscoveredScooter;
use crate::model::ProtocolVariant;
use crate::transport::{CharacteristicId, ConnectionState, WriteCharacteristic, WriteType};

/// Identity of the scooter a session authenticates against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoIdentity {
    /// Advertised name; the seed of most key derivations
    pub name: String,
    /// Hardware address, when known
    pub mac: Option<String>,
}

impl CryptoIdentity {
    /// Create an identity from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac: None,
        }
    }

    /// Derive the identity of a discovered scooter
    pub fn from_scooter(scooter: &DiscoveredScooter) -> Self {
        Self {
            name: scooter.name.clone(),
            mac: scooter.mac.clone(),
        }
    }
}

/// A write queued by a handshake step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundWrite {
    /// Plaintext payload
    pub data: Vec<u8>,
    /// Target characteristic
    pub characteristic: WriteCharacteristic,
    /// Write mode
    pub write_type: WriteType,
}

/// Writes queued by a handshake engine, flushed in order by the controller
#[derive(Debug, Default)]
pub struct HandshakeOutbox {
    writes: Vec<OutboundWrite>,
}

impl HandshakeOutbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write
    pub fn write(
        &mut self,
        data: impl Into<Vec<u8>>,
        characteristic: WriteCharacteristic,
        write_type: WriteType,
    ) {
        self.writes.push(OutboundWrite {
            data: data.into(),
            characteristic,
            write_type,
        });
    }

    /// Take all queued writes in order
    pub fn take(&mut self) -> Vec<OutboundWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Device- and variant-specific authentication and cipher
pub trait HandshakeEngine: Send {
    /// Clear all per-session secrets and the authenticated flag
    fn reset(&mut self);

    /// Begin the handshake
    ///
    /// Returns a state for the controller to adopt when the engine can decide
    /// immediately (e.g. plaintext variants go straight to `Connected`).
    fn start_authenticating(&mut self, outbox: &mut HandshakeOutbox) -> Option<ConnectionState>;

    /// Feed one inbound chunk; returns a state to adopt at a decision point
    fn continue_authenticating(
        &mut self,
        outbox: &mut HandshakeOutbox,
        received: &[u8],
        characteristic: &CharacteristicId,
    ) -> Option<ConnectionState>;

    /// Encrypt an outbound serial payload
    fn encrypt(&mut self, data: &[u8]) -> Vec<u8>;

    /// Decrypt an inbound serial payload; `None` rejects the chunk
    fn decrypt(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Whether the handshake has completed
    fn is_authenticated(&self) -> bool;

    /// Whether the scooter waits for its power button to confirm pairing
    fn awaiting_button_press(&self) -> bool {
        false
    }
}

/// Creates a fresh engine for each connection attempt
///
/// Returning `None` means no engine exists for the variant; the controller
/// then refuses the connection.
pub trait HandshakeEngineFactory: Send + Sync {
    /// Create an engine for `identity` speaking `variant`
    fn create(
        &self,
        identity: &CryptoIdentity,
        variant: ProtocolVariant,
    ) -> Option<Box<dyn HandshakeEngine>>;
}

impl<F> HandshakeEngineFactory for F
where
    F: Fn(&CryptoIdentity, ProtocolVariant) -> Option<Box<dyn HandshakeEngine>> + Send + Sync,
{
    fn create(
        &self,
        identity: &CryptoIdentity,
        variant: ProtocolVariant,
    ) -> Option<Box<dyn HandshakeEngine>> {
        self(identity, variant)
    }
}

/// Engine for unencrypted variants: authenticates immediately, no cipher
#[derive(Debug, Default)]
pub struct PlaintextHandshake {
    authenticated: bool,
}

impl PlaintextHandshake {
    /// Create a new plaintext engine
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandshakeEngine for PlaintextHandshake {
    fn reset(&mut self) {
        self.authenticated = false;
    }

    fn start_authenticating(&mut self, _outbox: &mut HandshakeOutbox) -> Option<ConnectionState> {
        self.authenticated = true;
        Some(ConnectionState::Connected)
    }

    fn continue_authenticating(
        &mut self,
        _outbox: &mut HandshakeOutbox,
        _received: &[u8],
        _characteristic: &CharacteristicId,
    ) -> Option<ConnectionState> {
        None
    }

    fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decrypt(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Factory that only supports unencrypted variants
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextOnly;

impl HandshakeEngineFactory for PlaintextOnly {
    fn create(
        &self,
        _identity: &CryptoIdentity,
        variant: ProtocolVariant,
    ) -> Option<Box<dyn HandshakeEngine>> {
        if variant.is_encrypted() {
            None
        } else {
            Some(Box::new(PlaintextHandshake::new()))
        }
    }
}

/// Crypto state of the current session
///
/// Holds the target identity, the selected variant and the engine created for
/// them. Re-seeded by [`CryptoContext::begin`] on every connection attempt
/// and emptied by [`CryptoContext::reset`].
pub struct CryptoContext {
    factory: Box<dyn HandshakeEngineFactory>,
    identity: Option<CryptoIdentity>,
    variant: Option<ProtocolVariant>,
    engine: Option<Box<dyn HandshakeEngine>>,
}

impl CryptoContext {
    /// Create an empty context backed by `factory`
    pub fn new(factory: impl HandshakeEngineFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            identity: None,
            variant: None,
            engine: None,
        }
    }

    /// Start a fresh context for a connection attempt
    ///
    /// Any previous engine is reset and dropped first. Returns `false` when
    /// the factory has no engine for `variant`.
    pub fn begin(&mut self, identity: CryptoIdentity, variant: ProtocolVariant) -> bool {
        self.reset();
        let engine = self.factory.create(&identity, variant);
        if engine.is_none() {
            warn!(scooter = %identity.name, %variant, "No handshake engine for variant");
        } else {
            debug!(scooter = %identity.name, %variant, "Crypto context initialised");
        }
        self.identity = Some(identity);
        self.variant = Some(variant);
        self.engine = engine;
        self.engine.is_some()
    }

    /// Clear identity, variant and all secrets
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
        self.engine = None;
        self.identity = None;
        self.variant = None;
    }

    /// Identity of the current attempt
    pub fn identity(&self) -> Option<&CryptoIdentity> {
        self.identity.as_ref()
    }

    /// Variant of the current attempt
    pub fn variant(&self) -> Option<ProtocolVariant> {
        self.variant
    }

    /// Whether an engine is installed
    pub fn is_active(&self) -> bool {
        self.engine.is_some()
    }

    /// Whether the handshake has completed
    pub fn is_authenticated(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.is_authenticated())
    }

    /// Whether the scooter waits for a pairing button press
    pub fn awaiting_button_press(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.awaiting_button_press())
    }

    /// See [`HandshakeEngine::start_authenticating`]
    pub fn start_authenticating(&mut self, outbox: &mut HandshakeOutbox) -> Option<ConnectionState> {
        self.engine.as_mut()?.start_authenticating(outbox)
    }

    /// See [`HandshakeEngine::continue_authenticating`]
    pub fn continue_authenticating(
        &mut self,
        outbox: &mut HandshakeOutbox,
        received: &[u8],
        characteristic: &CharacteristicId,
    ) -> Option<ConnectionState> {
        self.engine
            .as_mut()?
            .continue_authenticating(outbox, received, characteristic)
    }

    /// Encrypt with the current key material; `None` without an engine
    pub fn encrypt(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(self.engine.as_mut()?.encrypt(data))
    }

    /// Decrypt with the current key material; rejects without an engine
    pub fn decrypt(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.engine.as_mut()?.decrypt(data)
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("identity", &self.identity)
            .field("variant", &self.variant)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}
