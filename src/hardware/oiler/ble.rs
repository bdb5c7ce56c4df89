//! Bluetooth Low Energy backend for the oiler, built on `bluest`.
//!
//! Only compiled with the `ble` feature. The adapter is acquired lazily on first use so
//! that constructing the client never touches the system radio.

use super::transport::{
    start_forwarder, CommandLink, FrameWriter, WirelessAdapter, UART_NOTIFY_UUID,
    UART_SERVICE_UUID, UART_WRITE_UUID,
};
use crate::error::{AppResult, OilerError};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

fn uuid(value: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| OilerError::Protocol(format!("bad uuid {value}: {e}")))
}

fn ble_error(context: &str, err: bluest::Error) -> OilerError {
    OilerError::Connection(format!("{context}: {err}"))
}

/// Oiler transport over the host Bluetooth adapter.
#[derive(Default)]
pub struct BluestAdapter {
    adapter: OnceCell<Adapter>,
    /// Devices seen while scanning, keyed by address string
    seen: Mutex<HashMap<String, Device>>,
}

impl BluestAdapter {
    /// Adapter that acquires the system radio on first use.
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> AppResult<&Adapter> {
        self.adapter
            .get_or_try_init(|| async {
                let adapter = Adapter::default().await.ok_or_else(|| {
                    OilerError::Connection("no Bluetooth adapter found".to_string())
                })?;
                adapter
                    .wait_available()
                    .await
                    .map_err(|e| ble_error("Bluetooth adapter unavailable", e))?;
                info!("Bluetooth adapter ready");
                Ok(adapter)
            })
            .await
    }

    /// Scan until `matches` accepts a device or `window` elapses.
    async fn scan_until(
        &self,
        window: Duration,
        matches: impl Fn(&Device, Option<&str>) -> bool,
    ) -> AppResult<Option<Device>> {
        let adapter = self.adapter().await?;
        let mut scan = Box::pin(
            adapter
                .scan(&[])
                .await
                .map_err(|e| ble_error("scan failed", e))?,
        );

        let found = tokio::time::timeout(window, async {
            while let Some(advert) = scan.next().await {
                let local_name = advert.adv_data.local_name.as_deref();
                if matches(&advert.device, local_name) {
                    return Some(advert.device);
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        if let Some(device) = &found {
            self.seen
                .lock()
                .await
                .insert(device.id().to_string().to_ascii_uppercase(), device.clone());
        }
        Ok(found)
    }
}

#[async_trait]
impl WirelessAdapter for BluestAdapter {
    async fn scan_for(&self, name: &str, window: Duration) -> AppResult<Option<String>> {
        let wanted = name.to_ascii_uppercase();
        let device = self
            .scan_until(window, |device, local_name| {
                let advertised = local_name
                    .map(str::to_string)
                    .or_else(|| device.name().ok());
                advertised.is_some_and(|n| n.to_ascii_uppercase() == wanted)
            })
            .await?;
        Ok(device.map(|d| d.id().to_string()))
    }

    async fn open(&self, address: &str) -> AppResult<CommandLink> {
        let key = address.to_ascii_uppercase();
        let cached = self.seen.lock().await.get(&key).cloned();
        let device = match cached {
            Some(device) => device,
            None => {
                debug!(%address, "Address not seen yet, scanning for it");
                self.scan_until(Duration::from_secs(10), |device, _| {
                    device.id().to_string().to_ascii_uppercase() == key
                })
                .await?
                .ok_or_else(|| OilerError::Connection(format!("oiler {address} not in range")))?
            }
        };

        let adapter = self.adapter().await?;
        adapter
            .connect_device(&device)
            .await
            .map_err(|e| ble_error("connect failed", e))?;

        match attach(adapter, device.clone()).await {
            Ok(link) => {
                info!(%address, "Oiler UART service ready");
                Ok(link)
            }
            Err(e) => {
                if let Err(close) = adapter.disconnect_device(&device).await {
                    warn!(%address, "Disconnect after failed setup failed: {}", close);
                }
                Err(e)
            }
        }
    }
}

/// Locate the UART characteristics and subscribe to notifications on a connected device.
async fn attach(adapter: &Adapter, device: Device) -> AppResult<CommandLink> {
    let service = device
        .discover_services_with_uuid(uuid(UART_SERVICE_UUID)?)
        .await
        .map_err(|e| ble_error("service discovery failed", e))?
        .into_iter()
        .next()
        .ok_or_else(|| OilerError::Protocol("missing service".to_string()))?;

    let write = find_characteristic(&service, UART_WRITE_UUID).await?;
    let notify = find_characteristic(&service, UART_NOTIFY_UUID).await?;

    let watcher = adapter.clone();
    let watched = device.clone();
    let inbound = start_forwarder(move |ready, tx| async move {
        let mut events = match watcher.device_connection_events(&watched).await {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                let _ = ready.send(Err(ble_error("connection events unavailable", e)));
                return;
            }
        };
        let mut notifications = match notify.notify().await {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                let _ = ready.send(Err(ble_error("notification subscribe failed", e)));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        loop {
            tokio::select! {
                chunk = notifications.next() => match chunk {
                    Some(Ok(data)) => {
                        if tx.send(Bytes::from(data)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Oiler notification error: {}", e);
                        break;
                    }
                    None => break,
                },
                event = events.next() => {
                    if matches!(event, None | Some(bluest::ConnectionEvent::Disconnected)) {
                        break;
                    }
                }
            }
        }
        debug!("Oiler notification forwarder stopped");
    })
    .await?;

    Ok(CommandLink {
        writer: Box::new(BluestWriter {
            adapter: adapter.clone(),
            device,
            characteristic: write,
        }),
        inbound,
    })
}

async fn find_characteristic(service: &bluest::Service, id: &str) -> AppResult<Characteristic> {
    service
        .discover_characteristics_with_uuid(uuid(id)?)
        .await
        .map_err(|e| ble_error("characteristic discovery failed", e))?
        .into_iter()
        .next()
        .ok_or_else(|| OilerError::Protocol("missing service".to_string()))
}

struct BluestWriter {
    adapter: Adapter,
    device: Device,
    characteristic: Characteristic,
}

#[async_trait]
impl FrameWriter for BluestWriter {
    async fn write_frame(&mut self, frame: Bytes) -> AppResult<()> {
        self.characteristic
            .write(&frame)
            .await
            .map_err(|e| ble_error("write failed", e))
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.device.is_connected().await {
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(|e| ble_error("disconnect failed", e))?;
        }
        Ok(())
    }
}
