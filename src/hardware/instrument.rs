//! Stage/objective controller client.
//!
//! The controller speaks a line-oriented ASCII protocol over TCP: one LF-terminated
//! request, one LF-terminated reply.
//!
//! Protocol Overview:
//! - Handshake: `HELLO` → `OK <ident>`
//! - Success:   `OK` or `OK <value>`
//! - Failure:   `ERR <code> <message>` (reported as [`OilerError::Device`])
//! - Anything else is a protocol violation
//!
//! Exchanges are half-duplex and serialized by a mutex around the socket, the same
//! transaction pattern the serial drivers use. A reply that does not arrive in time
//! closes the link, because a late reply would otherwise be read as the answer to the
//! next request. For the same reason an exchange abandoned by its caller (the future
//! dropped between request and reply) leaves the link marked in flight, and the next
//! request closes it instead of reading the orphaned reply.
//!
//! # Example Usage
//!
//! ```no_run
//! use scope_oiler::config::InstrumentEndpoint;
//! use scope_oiler::hardware::instrument::InstrumentClient;
//! use scope_oiler::messages::StatusBus;
//!
//! #[tokio::main]
//! async fn main() -> scope_oiler::error::AppResult<()> {
//!     let client = InstrumentClient::new(StatusBus::default());
//!     client.connect(&InstrumentEndpoint::default()).await?;
//!
//!     let objective = client.get_objective().await?;
//!     println!("Objective: {}", objective);
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

use crate::config::InstrumentEndpoint;
use crate::error::{AppResult, OilerError};
use crate::hardware::capabilities::{InstrumentControl, ZMove};
use crate::messages::{DeviceKind, LinkState, StatusBus, StatusEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Bounds on controller round-trips.
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    /// Socket open plus handshake
    pub connect_timeout: Duration,
    /// Queries
    pub command_timeout: Duration,
    /// Objective switches and focus moves, which answer only once motion completes
    pub move_timeout: Duration,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            move_timeout: Duration::from_secs(30),
        }
    }
}

/// One turret position as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    /// Turret position
    pub position: u32,
    /// Label configured on the controller, e.g. `63x Oil`
    pub name: String,
}

struct Link {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: String,
    /// Set while a request awaits its reply
    in_flight: bool,
}

/// Client for the stage/objective controller.
///
/// Implements the [`InstrumentControl`] capability used by the procedure sequencer.
pub struct InstrumentClient {
    /// Socket halves, held for the duration of each exchange
    link: Mutex<Option<Link>>,
    state: watch::Sender<LinkState>,
    /// Refreshed by every successful objective query or switch
    last_objective: watch::Sender<Option<u32>>,
    status: StatusBus,
    options: InstrumentOptions,
}

impl InstrumentClient {
    /// Disconnected client with default timeouts.
    pub fn new(status: StatusBus) -> Self {
        Self::with_options(status, InstrumentOptions::default())
    }

    /// Disconnected client with explicit timeouts.
    pub fn with_options(status: StatusBus, options: InstrumentOptions) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (last_objective, _) = watch::channel(None);
        Self {
            link: Mutex::new(None),
            state,
            last_objective,
            status,
            options,
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
        self.status.link(DeviceKind::Instrument, state);
    }

    /// Open the socket and perform the handshake.
    ///
    /// An existing link is closed first. Any failure, including a missing handshake
    /// reply, is reported as `Connection`.
    #[instrument(skip(self), fields(address = %endpoint.address()))]
    pub async fn connect(&self, endpoint: &InstrumentEndpoint) -> AppResult<()> {
        let mut guard = self.link.lock().await;
        if let Some(mut old) = guard.take() {
            let _ = old.writer.shutdown().await;
        }

        self.set_state(LinkState::Connecting);
        let address = endpoint.address();
        let bound = self.options.connect_timeout;

        let attempt = tokio::time::timeout(bound, async {
            let stream = TcpStream::connect(&address).await.map_err(|e| {
                OilerError::Connection(format!("cannot reach controller at {address}: {e}"))
            })?;
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            let mut link = Link {
                reader: BufReader::new(read_half),
                writer: write_half,
                peer: address.clone(),
                in_flight: false,
            };
            let reply = exchange(&mut link, "HELLO").await?;
            let ident = parse_reply(&reply).map_err(|e| {
                OilerError::Connection(format!("handshake with {address} rejected: {e}"))
            })?;
            Ok::<_, OilerError>((link, ident))
        })
        .await;

        match attempt {
            Ok(Ok((link, ident))) => {
                info!(controller = %ident, "Connected to stage/objective controller");
                *guard = Some(link);
                self.set_state(LinkState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(LinkState::Disconnected);
                Err(match e {
                    OilerError::Connection(_) => e,
                    other => OilerError::Connection(other.to_string()),
                })
            }
            Err(_) => {
                self.set_state(LinkState::Disconnected);
                Err(OilerError::Connection(format!(
                    "no handshake from controller at {address} within {bound:?}"
                )))
            }
        }
    }

    /// Close the link. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            let _ = link.writer.shutdown().await;
            info!(peer = %link.peer, "Disconnected from controller");
        }
        if !matches!(*self.state.borrow(), LinkState::Disconnected) {
            self.set_state(LinkState::Disconnected);
        }
    }

    /// Send one request and return the reply payload after `OK`.
    #[instrument(skip(self, timeout), level = "debug")]
    async fn transaction(&self, command: &str, timeout: Duration) -> AppResult<String> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| OilerError::Connection("controller is not connected".to_string()))?;

        if link.in_flight {
            *guard = None;
            let reason = format!("previous exchange abandoned before its reply, '{command}' not sent");
            self.link_lost(reason.clone());
            return Err(OilerError::Connection(reason));
        }

        link.in_flight = true;
        match tokio::time::timeout(timeout, exchange(link, command)).await {
            Ok(Ok(reply)) => {
                link.in_flight = false;
                debug!(%reply, "Controller replied");
                parse_reply(&reply)
            }
            Ok(Err(e)) => {
                *guard = None;
                self.link_lost(e.to_string());
                Err(e)
            }
            Err(_) => {
                *guard = None;
                self.link_lost(format!("no reply to '{command}' within {timeout:?}"));
                Err(OilerError::timeout(command, timeout))
            }
        }
    }

    fn link_lost(&self, reason: String) {
        warn!(%reason, "Controller link closed");
        self.status.publish(StatusEvent::LinkLost {
            device: DeviceKind::Instrument,
            reason,
        });
        self.set_state(LinkState::Disconnected);
    }

    /// Current turret position.
    pub async fn get_objective(&self) -> AppResult<u32> {
        let reply = self
            .transaction("GET OBJECTIVE", self.options.command_timeout)
            .await?;
        let index = reply
            .trim()
            .parse::<u32>()
            .map_err(|_| OilerError::Protocol(format!("unparsable objective index '{reply}'")))?;
        self.last_objective.send_replace(Some(index));
        Ok(index)
    }

    /// Switch the turret. Returns once the controller reports the move complete.
    pub async fn set_objective(&self, index: u32) -> AppResult<()> {
        self.transaction(&format!("SET OBJECTIVE {index}"), self.options.move_timeout)
            .await?;
        self.last_objective.send_replace(Some(index));
        info!(index, "Objective switched");
        Ok(())
    }

    /// Move the focus drive.
    pub async fn move_z(&self, movement: ZMove) -> AppResult<()> {
        let command = format!("MOVE Z {} {:.3}", movement.mode(), movement.microns());
        self.transaction(&command, self.options.move_timeout).await?;
        debug!(?movement, "Focus moved");
        Ok(())
    }

    /// Current focus position in microns.
    pub async fn get_z(&self) -> AppResult<f64> {
        let reply = self.transaction("GET Z", self.options.command_timeout).await?;
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| OilerError::Protocol(format!("unparsable focus position '{reply}'")))
    }

    /// Turret inventory.
    pub async fn list_objectives(&self) -> AppResult<Vec<Objective>> {
        let reply = self
            .transaction("LIST OBJECTIVES", self.options.command_timeout)
            .await?;
        parse_objectives(&reply)
    }

    /// Turret position of the objective called `name` (case-insensitive).
    pub async fn find_objective(&self, name: &str) -> AppResult<u32> {
        self.list_objectives()
            .await?
            .into_iter()
            .find(|o| o.name.eq_ignore_ascii_case(name.trim()))
            .map(|o| o.position)
            .ok_or_else(|| OilerError::Protocol(format!("unknown objective '{name}'")))
    }

    /// Objective seen by the last successful query or switch. Informational only.
    pub fn last_known_objective(&self) -> Option<u32> {
        *self.last_objective.borrow()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Whether commands can be sent.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe link state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl InstrumentControl for InstrumentClient {
    async fn get_objective(&self) -> AppResult<u32> {
        InstrumentClient::get_objective(self).await
    }

    async fn set_objective(&self, index: u32) -> AppResult<()> {
        InstrumentClient::set_objective(self, index).await
    }

    async fn move_z(&self, movement: ZMove) -> AppResult<()> {
        InstrumentClient::move_z(self, movement).await
    }
}

async fn exchange(link: &mut Link, command: &str) -> AppResult<String> {
    let payload = format!("{command}\n");
    link.writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| OilerError::Connection(format!("write to controller failed: {e}")))?;
    link.writer
        .flush()
        .await
        .map_err(|e| OilerError::Connection(format!("write to controller failed: {e}")))?;

    let mut line = String::new();
    let read = link
        .reader
        .read_line(&mut line)
        .await
        .map_err(|e| OilerError::Connection(format!("read from controller failed: {e}")))?;
    if read == 0 {
        return Err(OilerError::Connection(
            "controller closed the connection".to_string(),
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Classify one reply line, returning the payload of an `OK` reply.
pub fn parse_reply(line: &str) -> AppResult<String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(' ') {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "OK" => Ok(rest.to_string()),
        "ERR" => {
            let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
            let code = code
                .parse::<i32>()
                .map_err(|_| OilerError::Protocol(format!("malformed error reply '{line}'")))?;
            Err(OilerError::Device {
                code,
                message: message.trim().to_string(),
            })
        }
        _ => Err(OilerError::Protocol(format!("unexpected reply '{line}'"))),
    }
}

/// Parse `<pos>=<name>|<pos>=<name>…`.
fn parse_objectives(payload: &str) -> AppResult<Vec<Objective>> {
    payload
        .split('|')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (position, name) = entry
                .split_once('=')
                .ok_or_else(|| OilerError::Protocol(format!("malformed objective '{entry}'")))?;
            let position = position
                .trim()
                .parse::<u32>()
                .map_err(|_| OilerError::Protocol(format!("malformed objective '{entry}'")))?;
            Ok(Objective {
                position,
                name: name.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_reply_payload() {
        assert_eq!(parse_reply("OK 3\n").unwrap(), "3");
        assert_eq!(parse_reply("OK").unwrap(), "");
    }

    #[test]
    fn err_reply_is_device_error() {
        match parse_reply("ERR 12 turret jammed") {
            Err(OilerError::Device { code, message }) => {
                assert_eq!(code, 12);
                assert_eq!(message, "turret jammed");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert!(matches!(parse_reply("HELLO?"), Err(OilerError::Protocol(_))));
        assert!(matches!(parse_reply("ERR x"), Err(OilerError::Protocol(_))));
    }

    #[test]
    fn objectives_inventory() {
        let list = parse_objectives("0=10x | 1=60x Oil|2=100x Oil").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list[1],
            Objective {
                position: 1,
                name: "60x Oil".to_string()
            }
        );
        assert!(parse_objectives("").unwrap().is_empty());
        assert!(parse_objectives("1-60x").is_err());
    }
}
