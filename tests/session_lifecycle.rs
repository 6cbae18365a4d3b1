//! Session engine lifecycle against the simulated peripheral
//!
//! Drives a `GattSession` through connection, discovery, operations and the
//! various ways a link can end, with the tokio clock paused so watchdogs and
//! timeouts fire deterministically.
//!
//! Run with:
//!   cargo test --test session_lifecycle

use std::sync::Arc;
use std::time::Duration;

use gattlink::ble::gatt::{
    CharacteristicProperties, GattStatus, BATTERY_ID, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
    MTU_DEFAULT, MTU_MAX, MTU_MIN,
};
use gattlink::ble::simulated::{GattTableBuilder, SimOp, SimPeripheral};
use gattlink::ble::transport::{phase, GattEventReceiver};
use gattlink::model::ConnectionStage;
use gattlink::{
    ApplicationCharacteristic, ConnectionState, GattConfig, GattEvent, GattResult, GattSession,
};

const TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn session_for(sim: &SimPeripheral, events: GattEventReceiver, config: GattConfig) -> GattSession {
    GattSession::new(
        Arc::new(sim.clone()),
        events,
        vec![ApplicationCharacteristic::battery()],
        config,
    )
    .unwrap()
}

async fn wait_for(session: &GattSession, wanted: ConnectionState) {
    let mut states = session.state_stream();
    states
        .wait_for(|state| *state == wanted)
        .await
        .expect("state stream closed");
}

async fn discovered() -> (SimPeripheral, GattSession) {
    let (sim, events) = SimPeripheral::battery("Battery");
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();
    wait_for(&session, ConnectionState::ServicesDiscovered).await;
    (sim, session)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_concurrent_read_on_same_characteristic_is_busy() {
    let (sim, session) = discovered().await;
    sim.stall(SimOp::Read);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.read(BATTERY_ID, TIMEOUT).await })
    };
    // Let the first read claim its slot.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = session.read(BATTERY_ID, TIMEOUT).await.unwrap();
    assert_eq!(second, GattResult::DeviceIsBusy);
    assert_eq!(sim.calls(SimOp::Read), 1);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first, GattResult::OperationTimeout(TIMEOUT));
}

#[tokio::test(start_paused = true)]
async fn test_protocol_error_is_returned_without_retry() {
    let (sim, session) = discovered().await;
    sim.complete_with(SimOp::Read, GattStatus::READ_NOT_PERMITTED);

    let result = session.read(BATTERY_ID, TIMEOUT).await.unwrap();
    assert_eq!(result, GattResult::GattError(GattStatus::READ_NOT_PERMITTED));
    assert_eq!(sim.calls(SimOp::Read), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mtu_requests_are_clamped() {
    let (sim, session) = discovered().await;
    sim.set_max_mtu(MTU_MAX);

    let result = session.request_mtu(9000, TIMEOUT).await.unwrap();
    assert_eq!(result, GattResult::Success(MTU_MAX));
    assert_eq!(session.mtu(), MTU_MAX);

    let result = session.request_mtu(10, TIMEOUT).await.unwrap();
    assert_eq!(result, GattResult::Success(MTU_MIN));
    assert_eq!(sim.calls(SimOp::RequestMtu), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mtu_without_platform_support_short_circuits() {
    let (sim, session) = discovered().await;
    sim.set_mtu_support(false);

    let result = session.request_mtu(185, TIMEOUT).await.unwrap();
    assert_eq!(result, GattResult::Success(MTU_DEFAULT));
    assert_eq!(sim.calls(SimOp::RequestMtu), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_delivers_notifications() {
    let (sim, session) = discovered().await;
    let mut notifications = session.notifications();

    let result = session.subscribe(BATTERY_ID, TIMEOUT).await.unwrap();
    assert!(result.is_success());
    assert_eq!(sim.calls(SimOp::SetNotification), 1);
    assert_eq!(sim.calls(SimOp::WriteDescriptor), 1);

    let handle = sim.handle_of(BATTERY_LEVEL_UUID).unwrap();
    sim.notify(handle, vec![42]);

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.characteristic.id, BATTERY_ID);
    assert_eq!(notification.value, vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_pending_operation() {
    let (sim, session) = discovered().await;
    sim.stall(SimOp::Read);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.read(BATTERY_ID, Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    sim.drop_link(GattStatus::SUCCESS);

    let result = pending.await.unwrap().unwrap();
    assert!(matches!(result, GattResult::OperationException(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_duplicate_connect_is_ignored() {
    let (sim, session) = discovered().await;
    session.connect().await.unwrap();
    assert_eq!(sim.calls(SimOp::Connect), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connected_watchdog_times_out_and_closes_once() {
    let (sim, events) = SimPeripheral::battery("Slow");
    let config = GattConfig {
        service_discovery_start_delay_ms: 10_000,
        ..GattConfig::default()
    };
    let session = session_for(&sim, events, config);
    session.connect().await.unwrap();

    wait_for(
        &session,
        ConnectionState::ConnectionStageTimeout {
            stage: ConnectionStage::Connected,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(sim.is_closed());
    assert_eq!(sim.calls(SimOp::Close), 1);

    // Discovery never starts once the session has timed out.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sim.calls(SimOp::DiscoverServices), 0);

    session.close().await;
    assert_eq!(sim.calls(SimOp::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_racing_error_callback_closes_once() {
    let (sim, events) = SimPeripheral::battery("Racing");
    let config = GattConfig {
        service_discovery_start_delay_ms: 10_000,
        ..GattConfig::default()
    };
    let session = session_for(&sim, events, config);
    session.connect().await.unwrap();

    // The connected watchdog is due now; the error callback lands alongside it.
    tokio::time::sleep(Duration::from_millis(4_000)).await;
    sim.emit(GattEvent::ConnectionStateChanged {
        status: GattStatus::ERROR,
        phase: phase::CONNECTED,
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(session.state().is_terminal());
    assert_eq!(sim.calls(SimOp::Close), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sim.calls(SimOp::Close), 1);
    assert_eq!(sim.calls(SimOp::DiscoverServices), 0);
}

#[tokio::test(start_paused = true)]
async fn test_error_callback_before_watchdog_closes_once() {
    let (sim, events) = SimPeripheral::battery("Erroring");
    let config = GattConfig {
        service_discovery_start_delay_ms: 10_000,
        ..GattConfig::default()
    };
    let session = session_for(&sim, events, config);
    session.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    sim.emit(GattEvent::ConnectionStateChanged {
        status: GattStatus::ERROR,
        phase: phase::CONNECTED,
    });
    wait_for(
        &session,
        ConnectionState::ConnectionStateError {
            phase: phase::CONNECTED,
            status: GattStatus::ERROR,
        },
    )
    .await;

    // Well past the connected deadline.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sim.calls(SimOp::Close), 1);
    assert_eq!(
        session.state(),
        ConnectionState::ConnectionStateError {
            phase: phase::CONNECTED,
            status: GattStatus::ERROR,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_connected_callback_is_ignored() {
    let (sim, events) = SimPeripheral::battery("Chatty");
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();
    sim.emit(GattEvent::ConnectionStateChanged {
        status: GattStatus::SUCCESS,
        phase: phase::CONNECTED,
    });

    wait_for(&session, ConnectionState::ServicesDiscovered).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sim.calls(SimOp::DiscoverServices), 1);
    assert_eq!(session.state(), ConnectionState::ServicesDiscovered);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_discovery_times_out() {
    let (sim, events) = SimPeripheral::battery("Stalled");
    sim.stall(SimOp::DiscoverServices);
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();

    wait_for(&session, ConnectionState::ServiceDiscoveryStarted).await;
    let started = tokio::time::Instant::now();
    wait_for(&session, ConnectionState::ServicesDiscoveryTimeout).await;
    assert!(started.elapsed() >= Duration::from_secs(45));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(sim.calls(SimOp::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_error_status_closes_link() {
    let (sim, events) = SimPeripheral::battery("Flaky");
    sim.script_connect(vec![(GattStatus::ERROR, phase::CONNECTED)]);
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();

    wait_for(
        &session,
        ConnectionState::ConnectionStateError {
            phase: phase::CONNECTED,
            status: GattStatus::ERROR,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(sim.calls(SimOp::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_phase_closes_link() {
    let (sim, events) = SimPeripheral::battery("Odd");
    sim.script_connect(vec![(GattStatus::SUCCESS, 9)]);
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();

    wait_for(&session, ConnectionState::UnknownState(9)).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(sim.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_missing_capability_fails_discovery_with_single_disconnect() {
    let services = GattTableBuilder::new()
        .service(BATTERY_SERVICE_UUID)
        .characteristic(BATTERY_LEVEL_UUID, CharacteristicProperties::READ)
        .build();
    let (sim, events) = SimPeripheral::new("No Notify", services);
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();

    wait_for(&session, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(sim.calls(SimOp::Disconnect), 1);
    assert_eq!(sim.calls(SimOp::Close), 1);

    // The characteristic was found, so it is registered, but the session
    // never becomes usable.
    assert_eq!(session.registry().unwrap().len(), 1);
    assert!(!session.mark_ready());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_error_status_disconnects() {
    let (sim, events) = SimPeripheral::battery("Broken");
    sim.set_discovery_status(GattStatus::INTERNAL_ERROR);
    let session = session_for(&sim, events, GattConfig::default());
    session.connect().await.unwrap();

    wait_for(&session, ConnectionState::Disconnected).await;
    assert_eq!(sim.calls(SimOp::Disconnect), 1);
    assert!(session.registry().is_none());
}
