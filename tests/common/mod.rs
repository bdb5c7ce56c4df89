//! Shared helpers for the integration tests.

#![allow(dead_code)]

use scope_oiler::config::Settings;
use scope_oiler::hardware::instrument::InstrumentOptions;
use scope_oiler::hardware::oiler::PeripheralOptions;
use scope_oiler::messages::{StatusEvent, StatusBus};
use std::time::Duration;
use tokio::sync::broadcast;

pub const OILER_ID: &str = "A009";
pub const OILER_ADDRESS: &str = "SIM:00:00:00:00:A9";

/// Oiler timings short enough for tests.
pub fn fast_peripheral_options() -> PeripheralOptions {
    PeripheralOptions {
        scan_window: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
        command_timeout: Duration::from_millis(300),
        dispense_timeout: Duration::from_millis(300),
        connect_attempts: 2,
        connect_retry_delay: Duration::from_millis(10),
        reconnect_attempts: 3,
        reconnect_backoff: Duration::from_millis(20),
    }
}

/// Controller timings short enough for tests.
pub fn fast_instrument_options() -> InstrumentOptions {
    InstrumentOptions {
        connect_timeout: Duration::from_millis(500),
        command_timeout: Duration::from_millis(300),
        move_timeout: Duration::from_millis(300),
    }
}

/// Defaults without the stock device cache.
pub fn empty_cache_settings() -> Settings {
    let mut settings = Settings::default();
    settings.peripheral.known_peripherals.clear();
    settings.peripheral.identity = OILER_ID.to_string();
    settings
}

/// Wait for the first status event matching `predicate`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<StatusEvent>,
    predicate: impl Fn(&StatusEvent) -> bool,
) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for status event")
}

pub fn bus() -> StatusBus {
    StatusBus::new(256)
}
