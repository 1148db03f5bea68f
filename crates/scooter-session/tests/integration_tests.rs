//! Integration tests for the scooter session controller
//!
//! These tests run a controller on its own task, the way an application
//! would, and verify end-to-end behaviour including:
//! - Discovery listing and advertisement expiry
//! - Encrypted handshake, frame delivery and lazily encrypted writes
//! - Re-pairing after a power button press
//! - Disconnect handling and shutdown

use scooter_session::test_utils::{AUTH_FAIL, AUTH_OK, BUTTON_PRESS, HELLO};
use scooter_session::{
    event_channel, ConnectionState, DeviceId, MockTransport, PlaintextOnly, ProtocolVariant,
    ScooterFrame, ScooterModel, SessionConfig, SessionConfigBuilder, SessionController,
    SessionError, TestFixture, WriteCharacteristic, WriteType, VERSION,
};
use std::time::Duration;

const NINEBOT_CRYPTO: ProtocolVariant = ProtocolVariant::Ninebot { encrypted: true };

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_discovery_lists_and_expires() {
    let session = TestFixture::new().spawn();

    session.advertise(TestFixture::scooter("a", "NBScooterA", b"P1"));
    session.advertise(TestFixture::scooter("b", "MIScooterB", &[0x00, 0x00]));
    session.settle().await.unwrap();

    let listed = session.handle.discovered();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].model, ScooterModel::Ninebot);
    assert_eq!(listed[1].model, ScooterModel::Xiaomi);

    tokio::time::sleep(Duration::from_secs(3)).await;
    session.advertise(TestFixture::scooter("b", "MIScooterB", &[0x00, 0x00]));
    session.settle().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await; // a silent for 5.5s
    let ids: Vec<_> = session.handle.discovered().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![DeviceId::new("b")]);

    let stats = session.settle().await.unwrap();
    assert_eq!(stats.advertisements, 3);
}

#[tokio::test]
async fn test_connect_to_unknown_id_fails() {
    let session = TestFixture::new().spawn();

    let result = session
        .handle
        .connect_to_id(DeviceId::new("missing"), false)
        .await;
    assert!(matches!(result, Err(SessionError::PeripheralNotFound(_))));
    assert!(session.transport.log().connects.is_empty());
}

// ============================================================================
// Authenticated sessions
// ============================================================================

#[tokio::test]
async fn test_encrypted_session_end_to_end() {
    let session = TestFixture::new().spawn();
    let mut frames = session.handle.subscribe_frames();

    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P1"));
    session.settle().await.unwrap();
    session
        .handle
        .connect_to_id(DeviceId::new("1"), false)
        .await
        .unwrap();
    session.settle().await.unwrap();

    let snapshot = session.handle.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Authenticating);
    assert!(snapshot.authenticating);
    assert_eq!(snapshot.model, Some(ScooterModel::Ninebot));
    assert_eq!(snapshot.variant, Some(NINEBOT_CRYPTO));

    // The handshake's first write went out under the pairing key
    {
        let log = session.transport.log();
        assert_eq!(log.connects[0].name, "NBScooter01");
        let hello = &log.writes[0];
        assert_eq!(hello.characteristic, WriteCharacteristic::Serial);
        assert_eq!(
            session.engines.open("NBScooter01", false, &hello.data),
            Some(HELLO.to_vec())
        );
    }

    session.notify(session.engines.seal("NBScooter01", false, AUTH_OK));
    session.settle().await.unwrap();
    assert_eq!(
        session.handle.snapshot().connection_state,
        ConnectionState::Connected
    );

    // A frame split over two notifications
    let frame = ScooterFrame::ninebot(0x23, 0x3E, 0x04, 0xB0, vec![0x11; 24]);
    let encoded = frame.encode(NINEBOT_CRYPTO).unwrap();
    let (head, tail) = encoded.split_at(20);
    session.notify(session.engines.seal("NBScooter01", true, head));
    session.notify(session.engines.seal("NBScooter01", true, tail));
    session.settle().await.unwrap();
    assert_eq!(frames.recv().await.unwrap(), frame);

    // Outbound frames use the session framing and the post-handshake key
    let request = ScooterFrame::ninebot(0x3E, 0x20, 0x01, 0x10, vec![0x0E]);
    session.handle.send_frame(request.clone()).await.unwrap();
    let written = session.transport.log().writes.last().unwrap().data.clone();
    let plain = session.engines.open("NBScooter01", true, &written).unwrap();
    assert_eq!(plain, request.encode(NINEBOT_CRYPTO).unwrap());

    let stats = session.settle().await.unwrap();
    assert_eq!(stats.handshake_chunks, 1);
    assert_eq!(stats.frames_parsed, 1);
    assert_eq!(stats.connect_attempts, 1);
}

#[tokio::test]
async fn test_plaintext_xiaomi_session() {
    let config = SessionConfigBuilder::new().build();
    let (events_tx, events_rx) = event_channel();
    let transport = MockTransport::with_events(events_tx.clone());
    let (controller, handle) = SessionController::new(transport.clone(), &config, PlaintextOnly);
    let task = tokio::spawn(controller.run(events_rx));
    let mut frames = handle.subscribe_frames();

    let scooter = TestFixture::scooter("x", "MIScooter7788", &[0x00, 0x00]);
    handle.connect_to(scooter, false).await.unwrap();
    handle.stats().await.unwrap();
    assert_eq!(handle.snapshot().connection_state, ConnectionState::Connected);
    assert_eq!(
        handle.snapshot().variant,
        Some(ProtocolVariant::Xiaomi { encrypted: false })
    );

    let frame = ScooterFrame::xiaomi(0x23, 0x01, 0x1A, vec![0x10, 0x01]);
    let bytes = frame.encode(ProtocolVariant::Xiaomi { encrypted: false }).unwrap();
    events_tx
        .send(scooter_session::TransportEvent::DataReceived {
            data: bytes.into(),
            characteristic: scooter_session::CharacteristicId::serial_rx(),
        })
        .unwrap();
    assert_eq!(frames.recv().await.unwrap(), frame);

    handle
        .write_raw(vec![0x55, 0xAA], WriteCharacteristic::Serial, WriteType::WithoutResponse)
        .await
        .unwrap();
    handle.stats().await.unwrap();
    assert_eq!(transport.log().writes[0].data, vec![0x55, 0xAA]);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_force_nb_crypto_overrides_model() {
    let session = TestFixture::new().spawn();

    let scooter = TestFixture::scooter("x", "MIScooter7788", &[0x00, 0x00]);
    session.handle.connect_to(scooter, true).await.unwrap();
    session.settle().await.unwrap();

    assert_eq!(session.transport.log().connects[0].variant, NINEBOT_CRYPTO);
    assert_eq!(session.handle.snapshot().model, Some(ScooterModel::Xiaomi));
}

// ============================================================================
// Re-pairing
// ============================================================================

#[tokio::test]
async fn test_button_press_reconnects_with_same_variant() {
    let session = TestFixture::new().spawn();

    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P1"));
    session.settle().await.unwrap();
    session
        .handle
        .connect_to_id(DeviceId::new("1"), true)
        .await
        .unwrap();
    session.notify(session.engines.seal("NBScooter01", false, BUTTON_PRESS));
    session.settle().await.unwrap();

    // Pressing the power button changes the advertisement payload
    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P2"));
    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P2"));
    let stats = session.settle().await.unwrap();
    assert_eq!(stats.button_press_reconnects, 1);

    {
        let log = session.transport.log();
        assert_eq!(log.connects.len(), 2);
        assert_eq!(log.connects[1].variant, NINEBOT_CRYPTO);
        assert_eq!(log.disconnects.len(), 1);
    }

    // The suppressed disconnect did not tear the session down
    let snapshot = session.handle.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Authenticating);
    assert_eq!(snapshot.device, Some(DeviceId::new("1")));
    assert_eq!(session.engines.log().created.len(), 2);

    session.notify(session.engines.seal("NBScooter01", false, AUTH_OK));
    session.settle().await.unwrap();
    assert_eq!(
        session.handle.snapshot().connection_state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_button_press_reconnect_can_be_disabled() {
    let config = SessionConfigBuilder::new()
        .reconnect_on_button_press(false)
        .build();
    let session = TestFixture::with_config(config).spawn();

    let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
    session.advertise(scooter.clone());
    session.handle.connect_to(scooter, false).await.unwrap();
    session.settle().await.unwrap();
    session.notify(session.engines.seal("NBScooter01", false, BUTTON_PRESS));
    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P2"));
    let stats = session.settle().await.unwrap();

    assert_eq!(stats.button_press_reconnects, 0);
    assert_eq!(session.transport.log().connects.len(), 1);
}

// ============================================================================
// Disconnects and shutdown
// ============================================================================

#[tokio::test]
async fn test_failed_handshake_disconnects() {
    let session = TestFixture::new().spawn();
    let mut state = session.handle.subscribe_state();

    let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
    session.handle.connect_to(scooter, false).await.unwrap();
    session.settle().await.unwrap();
    session.notify(session.engines.seal("NBScooter01", false, AUTH_FAIL));
    session.settle().await.unwrap();

    let snapshot = state.borrow_and_update().clone();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert!(!snapshot.authenticating);
    assert_eq!(snapshot.model, None);
    assert_eq!(session.transport.log().disconnects.len(), 1);
}

#[tokio::test]
async fn test_link_loss_resets_session() {
    let session = TestFixture::new().spawn();

    let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
    session.handle.connect_to(scooter, false).await.unwrap();
    session.settle().await.unwrap();
    session.notify(session.engines.seal("NBScooter01", false, AUTH_OK));
    session.settle().await.unwrap();

    session.report(ConnectionState::Disconnected);
    session.settle().await.unwrap();

    let snapshot = session.handle.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert!(!snapshot.authenticating);
    assert_eq!(session.engines.log().resets, 1);

    // Writes without a link never reach the transport
    let writes = session.transport.log().writes.len();
    session
        .handle
        .write_raw(vec![1, 2], WriteCharacteristic::Serial, WriteType::WithoutResponse)
        .await
        .unwrap();
    let stats = session.settle().await.unwrap();
    assert_eq!(session.transport.log().writes.len(), writes);
    assert_eq!(stats.dropped_writes, 1);
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() {
    let session = TestFixture::new().spawn();

    let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
    session.handle.connect_to(scooter, false).await.unwrap();
    session.handle.disconnect_from_scooter().await.unwrap();
    session.handle.disconnect_from_scooter().await.unwrap();
    session.settle().await.unwrap();

    assert_eq!(session.transport.log().disconnects.len(), 1);
    assert_eq!(
        session.handle.snapshot().connection_state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_connect_failure_reports_disconnected() {
    let fixture = TestFixture::new();
    fixture.transport.fail_connects(true);
    let session = fixture.spawn();

    let scooter = TestFixture::scooter("1", "NBScooter01", b"P1");
    session.handle.connect_to(scooter, false).await.unwrap();
    session.settle().await.unwrap();

    let snapshot = session.handle.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert_eq!(snapshot.device, None);
}

#[tokio::test]
async fn test_shutdown_stops_controller() {
    let session = TestFixture::new().spawn();
    session.advertise(TestFixture::scooter("1", "NBScooter01", b"P1"));
    session.settle().await.unwrap();

    session.handle.shutdown().await.unwrap();
    session.task.await.unwrap().unwrap();

    assert!(session.handle.discovered().is_empty());
    assert!(matches!(
        session.handle.stats().await,
        Err(SessionError::ChannelClosed)
    ));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_from_json() {
    let config = SessionConfig::from_json_str(
        r#"{
            "discovery": { "advertisement_timeout": "3s", "name_prefixes": ["NBScooter"] },
            "session": { "reconnect_on_button_press": false }
        }"#,
    )
    .unwrap();

    assert_eq!(config.discovery.advertisement_timeout, Duration::from_secs(3));
    assert!(!config.discovery.accepts_name("MIScooter1"));
    assert!(!config.session.reconnect_on_button_press);
}

#[test]
fn test_version() {
    assert!(!VERSION.is_empty());
}
