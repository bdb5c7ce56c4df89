//! Integration tests for the oiler client
//!
//! The client runs its real worker thread against the in-process oiler, so these cover
//! framing, sequence matching, retries and link recovery end to end.

mod common;

use common::{bus, fast_peripheral_options, wait_for, OILER_ADDRESS, OILER_ID};
use scope_oiler::error::OilerError;
use scope_oiler::hardware::oiler::protocol::StatusCode;
use scope_oiler::hardware::oiler::PeripheralClient;
use scope_oiler::hardware::simulated::{OilerBehaviour, SimulatedOiler};
use scope_oiler::messages::{DeviceKind, LinkState, StatusEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_test::assert_ok;

async fn advertised_oiler() -> SimulatedOiler {
    let oiler = SimulatedOiler::new();
    oiler.advertise(OILER_ID, OILER_ADDRESS).await;
    oiler
}

fn client(oiler: &SimulatedOiler, status: scope_oiler::messages::StatusBus) -> PeripheralClient {
    PeripheralClient::spawn(Arc::new(oiler.clone()), fast_peripheral_options(), status).unwrap()
}

async fn connected_client(oiler: &SimulatedOiler) -> PeripheralClient {
    let client = client(oiler, bus());
    client.connect(OILER_ADDRESS).await.unwrap();
    client
}

// =============================================================================
// Address resolution
// =============================================================================

#[tokio::test]
async fn test_cached_address_skips_scan() {
    let oiler = advertised_oiler().await;
    let client = client(&oiler, bus());

    let mut known = BTreeMap::new();
    known.insert(OILER_ID.to_string(), "CACHED:01".to_string());

    let resolved = client.resolve_address("a009", &known).await.unwrap();
    assert_eq!(resolved.identity, OILER_ID);
    assert_eq!(resolved.address, "CACHED:01");
    assert!(!resolved.discovered);
    assert_eq!(oiler.scans().await, 0);
    client.shutdown().await;
}

#[tokio::test]
async fn test_cache_miss_scans_and_announces() {
    let oiler = advertised_oiler().await;
    let status = bus();
    let mut events = status.subscribe();
    let client = client(&oiler, status);

    let resolved = client.resolve_address(OILER_ID, &BTreeMap::new()).await.unwrap();
    assert_eq!(resolved.address, OILER_ADDRESS);
    assert!(resolved.discovered);
    assert_eq!(oiler.scans().await, 1);

    let event = wait_for(&mut events, |e| matches!(e, StatusEvent::AddressDiscovered { .. })).await;
    assert_eq!(
        event,
        StatusEvent::AddressDiscovered {
            identity: OILER_ID.to_string(),
            address: OILER_ADDRESS.to_string(),
        }
    );
    // Scanning never leaves the client looking connected
    assert_eq!(client.state(), LinkState::Disconnected);
    client.shutdown().await;
}

#[tokio::test]
async fn test_scan_miss_is_connection_error() {
    let oiler = SimulatedOiler::new();
    let client = client(&oiler, bus());

    let result = client.scan("ZZ99").await;
    assert!(matches!(result, Err(OilerError::Connection(_))));
    client.shutdown().await;
}

// =============================================================================
// Connecting
// =============================================================================

#[tokio::test]
async fn test_connect_reads_battery() {
    let oiler = advertised_oiler().await;
    oiler
        .set_behaviour(OilerBehaviour {
            battery_millivolts: 3700,
            on_usb_power: true,
            ..OilerBehaviour::default()
        })
        .await;
    let client = connected_client(&oiler).await;

    assert!(client.is_connected());
    let reading = client.battery().expect("battery read on connect");
    assert!((reading.voltage - 3.7).abs() < 1e-6);
    assert!(reading.on_usb_power);
    client.shutdown().await;
}

#[tokio::test]
async fn test_connect_retries_refused_opens() {
    let oiler = advertised_oiler().await;
    oiler.refuse_opens(1).await;
    let client = client(&oiler, bus());

    assert_ok!(client.connect(OILER_ADDRESS).await);
    assert_eq!(oiler.opens().await, 2);
    client.shutdown().await;
}

#[tokio::test]
async fn test_connect_gives_up_after_attempts() {
    let oiler = advertised_oiler().await;
    oiler.refuse_opens(10).await;
    let client = client(&oiler, bus());

    let result = client.connect(OILER_ADDRESS).await;
    assert!(matches!(result, Err(OilerError::Connection(_))));
    assert_eq!(oiler.opens().await, 2);
    assert_eq!(client.state(), LinkState::Disconnected);
    client.shutdown().await;
}

#[tokio::test]
async fn test_missing_service_is_protocol_error_without_retry() {
    let oiler = advertised_oiler().await;
    oiler
        .set_behaviour(OilerBehaviour {
            missing_service: true,
            ..OilerBehaviour::default()
        })
        .await;
    let client = client(&oiler, bus());

    let result = client.connect(OILER_ADDRESS).await;
    assert!(matches!(result, Err(OilerError::Protocol(_))));
    assert_eq!(oiler.opens().await, 1);
    assert!(!client.is_connected());
    client.shutdown().await;
}

#[tokio::test]
async fn test_commands_require_connection() {
    let oiler = advertised_oiler().await;
    let client = client(&oiler, bus());

    assert!(matches!(client.dispense(10).await, Err(OilerError::Connection(_))));
    assert!(matches!(client.ping().await, Err(OilerError::Connection(_))));
    client.shutdown().await;
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn test_dispense_and_battery_round_trip() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;

    assert_ok!(client.dispense(50).await);
    assert_ok!(client.dispense(75).await);
    assert_ok!(client.ping().await);
    assert_eq!(oiler.dispensed().await, vec![50, 75]);

    let reading = client.query_battery().await.unwrap();
    assert!((reading.voltage - 3.9).abs() < 1e-6);
    assert!(!reading.on_usb_power);
    client.shutdown().await;
}

#[tokio::test]
async fn test_oversized_dispense_is_rejected_locally() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;

    let result = client.dispense(70_000).await;
    assert!(matches!(result, Err(OilerError::Protocol(_))));
    assert!(oiler.dispensed().await.is_empty());
    assert!(client.is_connected());
    client.shutdown().await;
}

#[tokio::test]
async fn test_device_status_becomes_device_error() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;
    oiler
        .set_behaviour(OilerBehaviour {
            dispense_status: StatusCode::LowBattery,
            ..OilerBehaviour::default()
        })
        .await;

    match client.dispense(50).await {
        Err(OilerError::Device { code, message }) => {
            assert_eq!(code, 3);
            assert!(message.contains("battery"), "message was {message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
    // Device errors leave the link up
    assert!(client.is_connected());
    assert_ok!(client.ping().await);
    client.shutdown().await;
}

#[tokio::test]
async fn test_stale_frames_are_discarded() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;
    oiler
        .set_behaviour(OilerBehaviour {
            stale_frames: 2,
            ..OilerBehaviour::default()
        })
        .await;

    assert_ok!(client.dispense(20).await);
    assert_eq!(oiler.dispensed().await, vec![20]);
    client.shutdown().await;
}

#[tokio::test]
async fn test_only_stale_reply_times_out() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;
    oiler
        .set_behaviour(OilerBehaviour {
            stale_frames: 1,
            answer: false,
            ..OilerBehaviour::default()
        })
        .await;

    let result = client.dispense(20).await;
    assert!(matches!(result, Err(OilerError::Timeout { .. })));

    // The link survives a timeout and the next exchange lines up again
    oiler.set_behaviour(OilerBehaviour::default()).await;
    assert_ok!(client.ping().await);
    client.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_replies_are_reassembled() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;
    oiler
        .set_behaviour(OilerBehaviour {
            chunk_size: Some(1),
            stale_frames: 1,
            ..OilerBehaviour::default()
        })
        .await;

    let reading = client.query_battery().await.unwrap();
    assert!((reading.voltage - 3.9).abs() < 1e-6);
    assert_ok!(client.dispense(5).await);
    client.shutdown().await;
}

// =============================================================================
// Link lifecycle
// =============================================================================

#[tokio::test]
async fn test_disconnect_is_idempotent_and_does_not_reconnect() {
    let oiler = advertised_oiler().await;
    let client = connected_client(&oiler).await;
    assert_eq!(oiler.opens().await, 1);

    client.disconnect().await;
    client.disconnect().await;
    assert_eq!(client.state(), LinkState::Disconnected);
    assert!(!oiler.is_linked().await);

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(oiler.opens().await, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn test_severed_link_is_reported_and_restored() {
    let oiler = advertised_oiler().await;
    let status = bus();
    let mut events = status.subscribe();
    let client = client(&oiler, status);
    client.connect(OILER_ADDRESS).await.unwrap();

    oiler.sever_link().await;

    wait_for(&mut events, |e| {
        matches!(e, StatusEvent::LinkLost { device: DeviceKind::Peripheral, .. })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            StatusEvent::Link {
                device: DeviceKind::Peripheral,
                state: LinkState::Connected,
            }
        )
    })
    .await;

    assert_eq!(oiler.opens().await, 2);
    assert_ok!(client.dispense(10).await);
    client.shutdown().await;
}

#[tokio::test]
async fn test_link_lost_mid_dispense_is_not_resent() {
    let oiler = advertised_oiler().await;
    let status = bus();
    let mut events = status.subscribe();
    let client = client(&oiler, status);
    client.connect(OILER_ADDRESS).await.unwrap();

    // The oiler accepts the dispense but the reply never makes it back
    oiler
        .set_behaviour(OilerBehaviour {
            answer: false,
            ..OilerBehaviour::default()
        })
        .await;
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.dispense(10).await }
    });

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while oiler.dispensed().await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispense never reached the oiler");
    oiler.sever_link().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(OilerError::Connection(reason)) if reason.contains("dispense")));

    wait_for(&mut events, |e| {
        matches!(e, StatusEvent::LinkLost { device: DeviceKind::Peripheral, .. })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            StatusEvent::Link {
                device: DeviceKind::Peripheral,
                state: LinkState::Connected,
            }
        )
    })
    .await;
    assert_eq!(oiler.opens().await, 2);
    assert_eq!(oiler.dispensed().await, vec![10]);
    client.shutdown().await;
}

#[tokio::test]
async fn test_commands_rejected_while_reconnecting() {
    let oiler = advertised_oiler().await;
    let status = bus();
    let mut events = status.subscribe();
    let options = scope_oiler::hardware::oiler::PeripheralOptions {
        reconnect_backoff: std::time::Duration::from_millis(500),
        ..fast_peripheral_options()
    };
    let client = PeripheralClient::spawn(Arc::new(oiler.clone()), options, status).unwrap();
    client.connect(OILER_ADDRESS).await.unwrap();

    // Every reconnection attempt fails
    oiler.refuse_opens(10).await;
    oiler.sever_link().await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            StatusEvent::Link {
                state: LinkState::Reconnecting { .. },
                ..
            }
        )
    })
    .await;

    let result = client.dispense(10).await;
    assert!(matches!(result, Err(OilerError::Connection(reason)) if reason.contains("reconnecting")));

    // Disconnect abandons the recovery
    client.disconnect().await;
    assert_eq!(client.state(), LinkState::Disconnected);
    assert!(oiler.dispensed().await.is_empty());
    client.shutdown().await;
}
