//! Message types crossing thread and runtime boundaries.
//!
//! The device clients and the sequencer never share mutable connection objects with
//! their callers. Everything the presentation layer learns arrives as one of the
//! immutable values defined here:
//!
//! ```text
//! wireless thread ──┐
//!                   ├── StatusEvent (broadcast) ──> presentation / CLI
//! instrument task ──┘
//! sequencer task ────── RunEvent (mpsc) ─────────> presentation / CLI
//! ```
//!
//! Status is published on a `broadcast` channel so any number of observers can attach;
//! publishing never fails when nobody is listening. Run progress goes through a plain
//! `mpsc` channel owned by whoever started the run.

use crate::error::ErrorKind;
use crate::procedures::{ProcedureKind, RunOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Which of the two devices a status message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Stage/objective controller
    Instrument,
    /// Wireless oiler
    Peripheral,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instrument => write!(f, "instrument"),
            Self::Peripheral => write!(f, "oiler"),
        }
    }
}

/// Connection lifecycle shared by both clients.
///
/// `Scanning` and `Reconnecting` only occur on the wireless link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max_attempts: u32 },
}

impl LinkState {
    /// True only for `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Last battery report from the oiler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// Cell voltage in volts
    pub voltage: f32,
    /// Whether the oiler is running from USB power
    pub on_usb_power: bool,
}

/// Asynchronous status reported by the device clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// A connection changed state
    Link { device: DeviceKind, state: LinkState },
    /// The link dropped without being asked to
    LinkLost { device: DeviceKind, reason: String },
    /// A battery reading arrived
    Battery(BatteryReading),
    /// Scanning found the address for an identity; the caller decides whether to persist it
    AddressDiscovered { identity: String, address: String },
}

/// Progress of one procedure run, in the order it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    Started {
        run_id: Uuid,
        kind: ProcedureKind,
    },
    StepStarted {
        step: usize,
        name: String,
    },
    StepCompleted {
        step: usize,
        name: String,
    },
    StepFailed {
        step: usize,
        name: String,
        kind: ErrorKind,
        reason: String,
    },
    Finished {
        run_id: Uuid,
        outcome: RunOutcome,
    },
}

/// Fan-out publisher for [`StatusEvent`]s.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a link state transition.
    pub fn link(&self, device: DeviceKind, state: LinkState) {
        self.publish(StatusEvent::Link { device, state });
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(64)
    }
}
