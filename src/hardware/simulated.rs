//! Protocol-level device simulators.
//!
//! Unlike the capability mocks, these speak the real wire protocols, so the production
//! clients run unmodified against them:
//!
//! - `SimulatedController` - TCP server implementing the controller's line protocol
//! - `SimulatedOiler` - [`WirelessAdapter`] answering binary oiler frames in-process
//!
//! Both back the CLI `--simulate` mode and the integration tests.

use crate::config::InstrumentEndpoint;
use crate::error::{AppResult, OilerError};
use crate::hardware::instrument::Objective;
use crate::hardware::oiler::protocol::{
    encode_battery, FrameDecoder, Opcode, Request, Response, StatusCode,
};
use crate::hardware::oiler::transport::{CommandLink, FrameWriter, WirelessAdapter};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

// =============================================================================
// SimulatedController
// =============================================================================

/// Scripted answer for requests starting with a given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Send this line instead of the normal answer
    Line(String),
    /// Never answer
    Silent,
    /// Close the connection
    Hangup,
}

#[derive(Debug)]
struct ControllerState {
    objective: u32,
    z: f64,
    objectives: Vec<Objective>,
    requests: Vec<String>,
    scripts: Vec<(String, ScriptedReply)>,
    move_latency: Duration,
}

/// In-process stage/objective controller on a loopback port.
///
/// The listener task is aborted when the simulator is dropped.
#[derive(Debug)]
pub struct SimulatedController {
    addr: SocketAddr,
    state: Arc<Mutex<ControllerState>>,
    task: JoinHandle<()>,
}

impl SimulatedController {
    /// Start listening on an ephemeral loopback port with the turret at `objective`.
    pub async fn start(objective: u32) -> AppResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ControllerState {
            objective,
            z: 0.0,
            objectives: vec![
                Objective {
                    position: 0,
                    name: "Oiler".to_string(),
                },
                Objective {
                    position: 1,
                    name: "10x".to_string(),
                },
                Objective {
                    position: 2,
                    name: "20x".to_string(),
                },
                Objective {
                    position: 3,
                    name: "63x Oil".to_string(),
                },
                Objective {
                    position: 4,
                    name: "100x Oil".to_string(),
                },
            ],
            requests: Vec::new(),
            scripts: Vec::new(),
            move_latency: Duration::ZERO,
        }));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "Simulated controller accepted connection");
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        info!(%addr, "Simulated controller listening");
        Ok(Self { addr, state, task })
    }

    /// Endpoint for connecting to this simulator.
    pub fn endpoint(&self) -> InstrumentEndpoint {
        InstrumentEndpoint {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    /// Answer requests starting with `prefix` with `reply` until cleared.
    pub async fn script(&self, prefix: &str, reply: ScriptedReply) {
        self.state
            .lock()
            .await
            .scripts
            .push((prefix.to_string(), reply));
    }

    /// Back to normal answers.
    pub async fn clear_scripts(&self) {
        self.state.lock().await.scripts.clear();
    }

    /// Delay objective switches and focus moves by `latency`.
    pub async fn set_move_latency(&self, latency: Duration) {
        self.state.lock().await.move_latency = latency;
    }

    /// Every request line received, in order, across all connections.
    pub async fn requests(&self) -> Vec<String> {
        self.state.lock().await.requests.clone()
    }

    /// Current turret position.
    pub async fn objective(&self) -> u32 {
        self.state.lock().await.objective
    }

    /// Current focus position.
    pub async fn z(&self) -> f64 {
        self.state.lock().await.z
    }
}

impl Drop for SimulatedController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ControllerState>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request = line.trim().to_string();
        let (scripted, latency) = {
            let mut state = state.lock().await;
            state.requests.push(request.clone());
            let scripted = state
                .scripts
                .iter()
                .find(|(prefix, _)| request.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone());
            (scripted, state.move_latency)
        };

        let reply = match scripted {
            Some(ScriptedReply::Line(line)) => line,
            Some(ScriptedReply::Silent) => continue,
            Some(ScriptedReply::Hangup) => break,
            None => {
                let is_move = request.starts_with("SET OBJECTIVE") || request.starts_with("MOVE Z");
                if is_move && !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                answer(&request, &mut *state.lock().await)
            }
        };

        if write_half
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
}

fn answer(request: &str, state: &mut ControllerState) -> String {
    let words: Vec<&str> = request.split_whitespace().collect();
    match words.as_slice() {
        ["HELLO"] => "OK SimulatedController".to_string(),
        ["GET", "OBJECTIVE"] => format!("OK {}", state.objective),
        ["SET", "OBJECTIVE", index] => match index.parse::<u32>() {
            Ok(index) if state.objectives.iter().any(|o| o.position == index) => {
                state.objective = index;
                "OK".to_string()
            }
            _ => format!("ERR 2 no objective at position {index}"),
        },
        ["MOVE", "Z", mode, value] => match (*mode, value.parse::<f64>()) {
            ("REL", Ok(delta)) => {
                state.z += delta;
                "OK".to_string()
            }
            ("ABS", Ok(target)) => {
                state.z = target;
                "OK".to_string()
            }
            _ => "ERR 3 malformed move".to_string(),
        },
        ["GET", "Z"] => format!("OK {:.3}", state.z),
        ["LIST", "OBJECTIVES"] => {
            let listing: Vec<String> = state
                .objectives
                .iter()
                .map(|o| format!("{}={}", o.position, o.name))
                .collect();
            format!("OK {}", listing.join("|"))
        }
        _ => "ERR 1 unknown command".to_string(),
    }
}

// =============================================================================
// SimulatedOiler
// =============================================================================

/// How the simulated oiler answers.
#[derive(Debug, Clone)]
pub struct OilerBehaviour {
    /// Reported battery voltage
    pub battery_millivolts: u16,
    /// Reported power source
    pub on_usb_power: bool,
    /// Status returned for dispense requests
    pub dispense_status: StatusCode,
    /// Frames with a wrong sequence number sent ahead of each reply
    pub stale_frames: usize,
    /// Whether the real reply is sent at all
    pub answer: bool,
    /// Open succeeds but the UART service is absent
    pub missing_service: bool,
    /// Split reply bytes into notifications of this size
    pub chunk_size: Option<usize>,
    /// Delay before the reply is delivered
    pub response_delay: Duration,
}

impl Default for OilerBehaviour {
    fn default() -> Self {
        Self {
            battery_millivolts: 3900,
            on_usb_power: false,
            dispense_status: StatusCode::Ok,
            stale_frames: 0,
            answer: true,
            missing_service: false,
            chunk_size: None,
            response_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct OilerState {
    behaviour: OilerBehaviour,
    /// Advertised name (upper case) → address
    advertised: HashMap<String, String>,
    to_host: Option<mpsc::UnboundedSender<Bytes>>,
    generation: u64,
    refuse_opens: usize,
    opens: usize,
    scans: usize,
    dispensed: Vec<u16>,
}

/// In-process oiler reachable through the [`WirelessAdapter`] seam.
#[derive(Debug, Clone, Default)]
pub struct SimulatedOiler {
    state: Arc<Mutex<OilerState>>,
}

impl SimulatedOiler {
    /// Oiler advertising nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise as `OILBOY_<identity>` at `address`.
    pub async fn advertise(&self, identity: &str, address: &str) {
        let name = crate::hardware::oiler::transport::advertised_name(identity);
        self.state
            .lock()
            .await
            .advertised
            .insert(name, address.to_string());
    }

    /// Replace how subsequent requests are answered.
    pub async fn set_behaviour(&self, behaviour: OilerBehaviour) {
        self.state.lock().await.behaviour = behaviour;
    }

    /// Fail the next `count` open attempts with `Connection`.
    pub async fn refuse_opens(&self, count: usize) {
        self.state.lock().await.refuse_opens = count;
    }

    /// Drop the current link from the device side.
    pub async fn sever_link(&self) {
        self.state.lock().await.to_host = None;
    }

    /// Open attempts so far, refused ones included.
    pub async fn opens(&self) -> usize {
        self.state.lock().await.opens
    }

    /// Scans so far.
    pub async fn scans(&self) -> usize {
        self.state.lock().await.scans
    }

    /// Accepted dispense amounts, in order.
    pub async fn dispensed(&self) -> Vec<u16> {
        self.state.lock().await.dispensed.clone()
    }

    /// Whether a link to the host is open.
    pub async fn is_linked(&self) -> bool {
        self.state.lock().await.to_host.is_some()
    }
}

#[async_trait]
impl WirelessAdapter for SimulatedOiler {
    async fn scan_for(&self, name: &str, window: Duration) -> AppResult<Option<String>> {
        let found = {
            let mut state = self.state.lock().await;
            state.scans += 1;
            state.advertised.get(&name.to_ascii_uppercase()).cloned()
        };
        if found.is_none() {
            tokio::time::sleep(window).await;
        }
        Ok(found)
    }

    async fn open(&self, address: &str) -> AppResult<CommandLink> {
        let mut state = self.state.lock().await;
        state.opens += 1;

        if !state
            .advertised
            .values()
            .any(|a| a.eq_ignore_ascii_case(address))
        {
            return Err(OilerError::Connection(format!("no device at {address}")));
        }
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(OilerError::Connection("simulated connect failure".to_string()));
        }
        if state.behaviour.missing_service {
            return Err(OilerError::Protocol("missing service".to_string()));
        }

        let (tx, inbound) = mpsc::unbounded_channel();
        state.to_host = Some(tx);
        state.generation += 1;

        Ok(CommandLink {
            writer: Box::new(SimulatedWriter {
                state: self.state.clone(),
                generation: state.generation,
                decoder: FrameDecoder::new(),
            }),
            inbound,
        })
    }
}

struct SimulatedWriter {
    state: Arc<Mutex<OilerState>>,
    generation: u64,
    decoder: FrameDecoder,
}

#[async_trait]
impl FrameWriter for SimulatedWriter {
    async fn write_frame(&mut self, frame: Bytes) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let to_host = match &state.to_host {
            Some(tx) if state.generation == self.generation => tx.clone(),
            _ => return Err(OilerError::Connection("link severed".to_string())),
        };

        self.decoder.push(&frame);
        while let Some(raw) = self.decoder.next_frame() {
            let request = Request::decode(raw).map_err(OilerError::Protocol)?;
            let reply = respond(&request, &mut state);
            let behaviour = state.behaviour.clone();

            let mut out = BytesMut::new();
            for n in 0..behaviour.stale_frames {
                let stale = request.seq.wrapping_add(1000 + n as u16);
                out.extend_from_slice(&Response::ok(stale, Bytes::new()).encode());
            }
            if behaviour.answer {
                out.extend_from_slice(&reply.encode());
            }
            deliver(to_host.clone(), out.freeze(), &behaviour);
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.generation == self.generation {
            state.to_host = None;
        }
        Ok(())
    }
}

fn respond(request: &Request, state: &mut OilerState) -> Response {
    match request.opcode {
        Opcode::Ping => Response::ok(request.seq, Bytes::new()),
        Opcode::Battery => Response::ok(
            request.seq,
            encode_battery(
                state.behaviour.battery_millivolts,
                state.behaviour.on_usb_power,
            ),
        ),
        Opcode::Dispense => match (request.dispense_steps(), state.behaviour.dispense_status) {
            (None, _) => Response {
                seq: request.seq,
                status: StatusCode::InvalidArgument,
                payload: Bytes::new(),
            },
            (Some(steps), StatusCode::Ok) => {
                state.dispensed.push(steps);
                Response::ok(request.seq, Bytes::new())
            }
            (Some(_), status) => Response {
                seq: request.seq,
                status,
                payload: Bytes::new(),
            },
        },
    }
}

fn deliver(to_host: mpsc::UnboundedSender<Bytes>, bytes: Bytes, behaviour: &OilerBehaviour) {
    let chunk_size = behaviour.chunk_size.unwrap_or(bytes.len()).max(1);
    let delay = behaviour.response_delay;
    let send = move || {
        for chunk in bytes.chunks(chunk_size) {
            let _ = to_host.send(Bytes::copy_from_slice(chunk));
        }
    };
    if delay.is_zero() {
        send();
    } else {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send();
        });
    }
}
