//! Wireless transport seam.
//!
//! The peripheral actor only needs two things from the radio stack: find an advertised
//! device and open a bidirectional byte link to it. [`WirelessAdapter`] is that seam.
//! The BLE backend lives in `ble.rs`; `hardware::simulated::SimulatedOiler` implements the
//! same trait in-process.

use crate::error::{AppResult, OilerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Nordic UART service carrying oiler frames.
pub const UART_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Characteristic the host writes requests to.
pub const UART_WRITE_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
/// Characteristic the oiler notifies responses on.
pub const UART_NOTIFY_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Advertised local name prefix; the identity follows it.
pub const ADVERTISED_NAME_PREFIX: &str = "OILBOY_";

/// Name an oiler with `identity` advertises under.
pub fn advertised_name(identity: &str) -> String {
    format!("{ADVERTISED_NAME_PREFIX}{}", identity.trim().to_ascii_uppercase())
}

/// Outbound half of an open link.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one encoded frame.
    async fn write_frame(&mut self, frame: Bytes) -> AppResult<()>;

    /// Close the link. Must be safe to call on an already closed link.
    async fn close(&mut self) -> AppResult<()>;
}

/// An open link to the oiler.
///
/// `inbound` yields raw notification chunks. The channel closing means the link is gone.
pub struct CommandLink {
    /// Request path
    pub writer: Box<dyn FrameWriter>,
    /// Notification chunks, in arrival order
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for CommandLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLink").finish_non_exhaustive()
    }
}

/// Radio stack as seen by the peripheral actor.
#[async_trait]
pub trait WirelessAdapter: Send + Sync {
    /// Actively scan for up to `window` for a device advertising `name`
    /// (case-insensitive). Returns its address.
    async fn scan_for(&self, name: &str, window: Duration) -> AppResult<Option<String>>;

    /// Connect to `address` and locate the UART service.
    async fn open(&self, address: &str) -> AppResult<CommandLink>;
}

/// Start a notification forwarder and wait until its subscription is live.
///
/// `forwarder` runs on its own task. It must report through the first argument once it
/// is subscribed (or failed to), then push notification chunks into the second until the
/// link goes away. Returning only after that report means the first request written to
/// the link cannot race the subscription.
pub async fn start_forwarder<F, Fut>(forwarder: F) -> AppResult<mpsc::UnboundedReceiver<Bytes>>
where
    F: FnOnce(oneshot::Sender<AppResult<()>>, mpsc::UnboundedSender<Bytes>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, inbound) = mpsc::unbounded_channel();
    let (ready, subscribed) = oneshot::channel();
    tokio::spawn(forwarder(ready, tx));
    match subscribed.await {
        Ok(Ok(())) => Ok(inbound),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(OilerError::Connection(
            "notification forwarder stopped before subscribing".to_string(),
        )),
    }
}
