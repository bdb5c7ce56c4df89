//! Wireless oiler client.
//!
//! The oiler link is owned by a single actor running on a dedicated OS thread
//! (`oiler-wireless`) with its own current-thread tokio runtime, so radio callbacks and
//! scan windows never compete with the instrument client or the sequencer for worker
//! threads. Callers hold a cheap, cloneable [`PeripheralClient`] handle and talk to the
//! actor through an `mpsc` command channel with `oneshot` replies.
//!
//! ```text
//! PeripheralClient ──PeripheralCommand──> actor (oiler-wireless thread)
//!        ^                                   │  owns CommandLink, decoder, seq counter
//!        └──────── oneshot reply ────────────┘
//!                                            └──> StatusBus (link state, battery, discovery)
//! ```
//!
//! Link state is additionally mirrored into a `watch` channel so `state()` is a
//! non-blocking read.

mod actor;
#[cfg(feature = "ble")]
pub mod ble;
pub mod protocol;
pub mod transport;

pub use transport::{CommandLink, FrameWriter, WirelessAdapter};

use crate::config::normalize_identity;
use crate::error::{AppResult, OilerError};
use crate::hardware::capabilities::Dispenser;
use crate::messages::{BatteryReading, LinkState, StatusBus};
use actor::{PeripheralActor, PeripheralCommand};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

/// Timing and retry policy for the oiler link.
#[derive(Debug, Clone)]
pub struct PeripheralOptions {
    /// How long one address scan may run
    pub scan_window: Duration,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Bound on ping and battery round-trips
    pub command_timeout: Duration,
    /// Bound on a dispense round-trip (the pump runs before it answers)
    pub dispense_timeout: Duration,
    /// Attempts made by an explicit connect
    pub connect_attempts: u32,
    /// Pause between explicit connect attempts
    pub connect_retry_delay: Duration,
    /// Attempts made after an unexpected link loss
    pub reconnect_attempts: u32,
    /// First reconnection delay; doubles on every attempt
    pub reconnect_backoff: Duration,
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(24),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(3),
            dispense_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

impl PeripheralOptions {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Outcome of resolving an identity to a wireless address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Normalized identity that was resolved
    pub identity: String,
    /// Wireless hardware address
    pub address: String,
    /// True when the address came from a scan rather than the cache; the caller
    /// decides whether to persist it.
    pub discovered: bool,
}

/// Handle to the oiler actor.
///
/// Cloning is cheap; all clones drive the same link. The actor stops when the last
/// handle is dropped or [`PeripheralClient::shutdown`] is called.
#[derive(Clone)]
pub struct PeripheralClient {
    commands: mpsc::Sender<PeripheralCommand>,
    state: watch::Receiver<LinkState>,
    battery: watch::Receiver<Option<BatteryReading>>,
}

impl std::fmt::Debug for PeripheralClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralClient")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl PeripheralClient {
    /// Start the `oiler-wireless` thread and return a handle to it.
    pub fn spawn(
        adapter: Arc<dyn WirelessAdapter>,
        options: PeripheralOptions,
        status: StatusBus,
    ) -> AppResult<Self> {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (battery_tx, battery_rx) = watch::channel(None);

        let actor = PeripheralActor::new(adapter, options, status, state_tx, battery_tx);

        std::thread::Builder::new()
            .name("oiler-wireless".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start oiler runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(actor.run(command_rx));
                debug!("Oiler thread exiting");
            })?;

        info!("Oiler worker started");
        Ok(Self {
            commands: command_tx,
            state: state_rx,
            battery: battery_rx,
        })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> PeripheralCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| OilerError::Connection("oiler worker has stopped".to_string()))?;
        rx.await
            .map_err(|_| OilerError::Connection("oiler worker dropped the request".to_string()))?
    }

    /// Resolve `identity` to an address, preferring the `known` cache.
    ///
    /// On a cache miss a scan runs for up to the configured window. A discovered
    /// address is returned (and announced on the status bus) but never persisted here.
    pub async fn resolve_address(
        &self,
        identity: &str,
        known: &BTreeMap<String, String>,
    ) -> AppResult<ResolvedAddress> {
        let identity = normalize_identity(identity);
        if let Some(address) = known.get(&identity) {
            debug!(%identity, %address, "Using cached oiler address");
            return Ok(ResolvedAddress {
                identity,
                address: address.clone(),
                discovered: false,
            });
        }
        self.scan(&identity).await
    }

    /// Scan for `identity`, ignoring any cached address.
    pub async fn scan(&self, identity: &str) -> AppResult<ResolvedAddress> {
        let identity = normalize_identity(identity);
        let address = self
            .call(|response| PeripheralCommand::Scan {
                identity: identity.clone(),
                response,
            })
            .await?;
        Ok(ResolvedAddress {
            identity,
            address,
            discovered: true,
        })
    }

    /// Connect to `address`, retrying per the options.
    pub async fn connect(&self, address: &str) -> AppResult<()> {
        let address = address.to_string();
        self.call(|response| PeripheralCommand::Connect { address, response })
            .await
    }

    /// Drop the link. Never fails and never triggers reconnection.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PeripheralCommand::Disconnect { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Dispense `amount_steps` pump steps.
    pub async fn dispense(&self, amount_steps: u32) -> AppResult<()> {
        self.call(|response| PeripheralCommand::Dispense {
            amount_steps,
            response,
        })
        .await
    }

    /// Ask the oiler for a fresh battery reading.
    pub async fn query_battery(&self) -> AppResult<BatteryReading> {
        self.call(|response| PeripheralCommand::QueryBattery { response })
            .await
    }

    /// Liveness round-trip.
    pub async fn ping(&self) -> AppResult<()> {
        self.call(|response| PeripheralCommand::Ping { response })
            .await
    }

    /// Last battery reading seen, without talking to the device.
    pub fn battery(&self) -> Option<BatteryReading> {
        *self.battery.borrow()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Whether commands can be sent.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch link state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Close the link and stop the worker thread.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(PeripheralCommand::Shutdown).await;
    }
}

#[async_trait]
impl Dispenser for PeripheralClient {
    async fn dispense(&self, amount_steps: u32) -> AppResult<()> {
        PeripheralClient::dispense(self, amount_steps).await
    }
}
