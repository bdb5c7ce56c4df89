//! Oiler link actor.
//!
//! Sole owner of the wireless link. Commands are processed one at a time, so at most
//! one request is ever in flight and responses can be matched by sequence number alone.

use super::protocol::{decode_battery, FrameDecoder, Opcode, Request, Response, SequenceCounter};
use super::transport::{advertised_name, CommandLink, FrameWriter, WirelessAdapter};
use super::PeripheralOptions;
use crate::error::{AppResult, OilerError};
use crate::messages::{BatteryReading, DeviceKind, LinkState, StatusBus, StatusEvent};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub(crate) enum PeripheralCommand {
    Scan {
        identity: String,
        response: oneshot::Sender<AppResult<String>>,
    },
    Connect {
        address: String,
        response: oneshot::Sender<AppResult<()>>,
    },
    Disconnect {
        response: oneshot::Sender<()>,
    },
    Dispense {
        amount_steps: u32,
        response: oneshot::Sender<AppResult<()>>,
    },
    QueryBattery {
        response: oneshot::Sender<AppResult<BatteryReading>>,
    },
    Ping {
        response: oneshot::Sender<AppResult<()>>,
    },
    Shutdown,
}

impl PeripheralCommand {
    /// Answer with `err` without touching the link.
    fn reject(self, err: OilerError) {
        match self {
            Self::Scan { response, .. } => {
                let _ = response.send(Err(err));
            }
            Self::Connect { response, .. }
            | Self::Dispense { response, .. }
            | Self::Ping { response } => {
                let _ = response.send(Err(err));
            }
            Self::QueryBattery { response } => {
                let _ = response.send(Err(err));
            }
            Self::Disconnect { response } => {
                let _ = response.send(());
            }
            Self::Shutdown => {}
        }
    }
}

struct ActiveLink {
    address: String,
    writer: Box<dyn FrameWriter>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    decoder: FrameDecoder,
}

impl ActiveLink {
    fn new(address: &str, link: CommandLink) -> Self {
        Self {
            address: address.to_string(),
            writer: link.writer,
            inbound: link.inbound,
            decoder: FrameDecoder::new(),
        }
    }
}

pub(crate) struct PeripheralActor {
    adapter: Arc<dyn WirelessAdapter>,
    options: PeripheralOptions,
    status: StatusBus,
    state_tx: watch::Sender<LinkState>,
    battery_tx: watch::Sender<Option<BatteryReading>>,
    link: Option<ActiveLink>,
    seq: SequenceCounter,
    /// Set when a request noticed the link vanish; handled once the reply is sent.
    lost: Option<String>,
    running: bool,
}

impl PeripheralActor {
    pub(crate) fn new(
        adapter: Arc<dyn WirelessAdapter>,
        options: PeripheralOptions,
        status: StatusBus,
        state_tx: watch::Sender<LinkState>,
        battery_tx: watch::Sender<Option<BatteryReading>>,
    ) -> Self {
        Self {
            adapter,
            options,
            status,
            state_tx,
            battery_tx,
            link: None,
            seq: SequenceCounter::default(),
            lost: None,
            running: true,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<PeripheralCommand>) {
        info!("Oiler actor started");

        while self.running {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PeripheralCommand::Shutdown) | None => self.running = false,
                    Some(command) => self.handle(command).await,
                },
                chunk = next_chunk(&mut self.link) => match chunk {
                    Some(chunk) => self.discard_unsolicited(&chunk),
                    None => self.lost = Some("link closed by peer".to_string()),
                },
            }

            if let Some(reason) = self.lost.take() {
                self.recover(reason, &mut commands).await;
            }
        }

        self.close_link().await;
        info!("Oiler actor stopped");
    }

    async fn handle(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::Scan { identity, response } => {
                let result = self.scan(&identity).await;
                let _ = response.send(result);
            }
            PeripheralCommand::Connect { address, response } => {
                let result = self.connect(&address).await;
                let _ = response.send(result);
            }
            PeripheralCommand::Disconnect { response } => {
                self.close_link().await;
                let _ = response.send(());
            }
            PeripheralCommand::Dispense {
                amount_steps,
                response,
            } => {
                let timeout = self.options.dispense_timeout;
                let result = self
                    .request(|seq| Request::dispense(seq, amount_steps), timeout)
                    .await
                    .map(|_| ());
                if result.is_ok() {
                    info!(amount_steps, "Dispense acknowledged");
                }
                let _ = response.send(result);
            }
            PeripheralCommand::QueryBattery { response } => {
                let _ = response.send(self.refresh_battery().await);
            }
            PeripheralCommand::Ping { response } => {
                let timeout = self.options.command_timeout;
                let result = self
                    .request(|seq| Ok(Request::ping(seq)), timeout)
                    .await
                    .map(|_| ());
                let _ = response.send(result);
            }
            PeripheralCommand::Shutdown => self.running = false,
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
        self.status.link(DeviceKind::Peripheral, state);
    }

    #[instrument(skip(self))]
    async fn scan(&mut self, identity: &str) -> AppResult<String> {
        let name = advertised_name(identity);
        let window = self.options.scan_window;
        let previous = *self.state_tx.borrow();
        if self.link.is_none() {
            self.set_state(LinkState::Scanning);
        }

        info!(%name, ?window, "Scanning for oiler");
        let found = self.adapter.scan_for(&name, window).await;

        if self.link.is_none() {
            self.set_state(previous);
        }

        match found? {
            Some(address) => {
                info!(%name, %address, "Oiler discovered");
                self.status.publish(StatusEvent::AddressDiscovered {
                    identity: identity.to_string(),
                    address: address.clone(),
                });
                Ok(address)
            }
            None => Err(OilerError::Connection(format!(
                "no oiler advertising {name} found within {window:?}"
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn connect(&mut self, address: &str) -> AppResult<()> {
        if let Some(link) = &self.link {
            if link.address == address {
                debug!("Already connected");
                return Ok(());
            }
            self.close_link().await;
        }

        let attempts = self.options.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.set_state(LinkState::Connecting);
            match self.open(address).await {
                Ok(link) => {
                    self.link = Some(ActiveLink::new(address, link));
                    self.set_state(LinkState::Connected);
                    info!(attempt, "Oiler connected");

                    if let Err(e) = self.refresh_battery().await {
                        warn!("Battery query after connect failed: {}", e);
                    }
                    return Ok(());
                }
                Err(e @ OilerError::Protocol(_)) => {
                    self.set_state(LinkState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, attempts, "Oiler connection attempt failed: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.options.connect_retry_delay).await;
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected);
        Err(OilerError::Connection(format!(
            "could not connect to oiler {address} after {attempts} attempts: {last_error}"
        )))
    }

    async fn open(&self, address: &str) -> AppResult<CommandLink> {
        let timeout = self.options.connect_timeout;
        match tokio::time::timeout(timeout, self.adapter.open(address)).await {
            Ok(result) => result,
            Err(_) => Err(OilerError::timeout(format!("connect to {address}"), timeout)),
        }
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.writer.close().await {
                debug!("Error while closing oiler link: {}", e);
            }
            info!(address = %link.address, "Oiler disconnected");
        }
        if !matches!(*self.state_tx.borrow(), LinkState::Disconnected) {
            self.set_state(LinkState::Disconnected);
        }
    }

    async fn refresh_battery(&mut self) -> AppResult<BatteryReading> {
        let timeout = self.options.command_timeout;
        let payload = self
            .request(|seq| Ok(Request::battery(seq)), timeout)
            .await?;
        let reading = decode_battery(&payload)?;
        debug!(voltage = reading.voltage, usb = reading.on_usb_power, "Battery reading");
        self.battery_tx.send_replace(Some(reading));
        self.status.publish(StatusEvent::Battery(reading));
        Ok(reading)
    }

    /// Send one request and wait for the response carrying its sequence number.
    ///
    /// Responses with any other sequence number are dropped. Link loss fails the
    /// request with `Connection` and schedules recovery.
    async fn request(
        &mut self,
        build: impl FnOnce(u16) -> AppResult<Request>,
        timeout: Duration,
    ) -> AppResult<Bytes> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| OilerError::Connection("oiler is not connected".to_string()))?;

        let request = build(self.seq.next())?;
        let opcode = request.opcode;
        let seq = request.seq;

        if let Err(e) = link.writer.write_frame(request.encode()).await {
            self.lost = Some(format!("write failed: {e}"));
            return Err(OilerError::Connection(format!(
                "link lost while sending {}: {e}",
                opcode.name()
            )));
        }
        debug!(op = opcode.name(), seq, "Request sent");

        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = link.decoder.next_frame() {
                match Response::decode(frame) {
                    Ok(response) if response.seq == seq => return response.into_result(opcode),
                    Ok(response) => warn!(
                        expected = seq,
                        received = response.seq,
                        "Discarding response with mismatched sequence number"
                    ),
                    Err(e) => warn!("Discarding malformed frame: {}", e),
                }
            }

            match tokio::time::timeout_at(deadline, link.inbound.recv()).await {
                Ok(Some(chunk)) => link.decoder.push(&chunk),
                Ok(None) => {
                    self.lost = Some(format!("link lost during {}", opcode.name()));
                    return Err(OilerError::Connection(format!(
                        "link lost during {}",
                        opcode.name()
                    )));
                }
                Err(_) => {
                    link.decoder.clear();
                    return Err(OilerError::timeout(opcode.name(), timeout));
                }
            }
        }
    }

    fn discard_unsolicited(&mut self, chunk: &[u8]) {
        if let Some(link) = self.link.as_mut() {
            link.decoder.push(chunk);
            while let Some(frame) = link.decoder.next_frame() {
                warn!(len = frame.len(), "Discarding unsolicited frame from oiler");
            }
        }
    }

    /// Handle an unexpected link loss: announce it, then try to get the link back
    /// with exponential backoff while refusing other work.
    async fn recover(&mut self, reason: String, commands: &mut mpsc::Receiver<PeripheralCommand>) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let _ = link.writer.close().await;
        let address = link.address;

        warn!(%address, %reason, "Oiler link lost");
        self.status.publish(StatusEvent::LinkLost {
            device: DeviceKind::Peripheral,
            reason,
        });
        self.set_state(LinkState::Disconnected);

        let max_attempts = self.options.reconnect_attempts;
        for attempt in 1..=max_attempts {
            self.set_state(LinkState::Reconnecting {
                attempt,
                max_attempts,
            });

            let sleep = tokio::time::sleep(self.options.reconnect_delay(attempt));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(PeripheralCommand::Disconnect { response }) => {
                            info!("Reconnection abandoned on request");
                            self.set_state(LinkState::Disconnected);
                            let _ = response.send(());
                            return;
                        }
                        Some(PeripheralCommand::Shutdown) | None => {
                            self.running = false;
                            self.set_state(LinkState::Disconnected);
                            return;
                        }
                        Some(command) => command.reject(OilerError::Connection(
                            "oiler link is reconnecting".to_string(),
                        )),
                    },
                }
            }

            match self.open(&address).await {
                Ok(link) => {
                    self.link = Some(ActiveLink::new(&address, link));
                    self.set_state(LinkState::Connected);
                    info!(attempt, "Oiler link restored");
                    return;
                }
                Err(e) => warn!(attempt, max_attempts, "Reconnection attempt failed: {}", e),
            }
        }

        error!(%address, "Giving up on oiler after {} reconnection attempts", max_attempts);
        self.set_state(LinkState::Disconnected);
    }
}

async fn next_chunk(link: &mut Option<ActiveLink>) -> Option<Bytes> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}
