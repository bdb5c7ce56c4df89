//! Mock Capability Implementations
//!
//! In-memory stand-ins for the two capabilities the sequencer drives. They record every
//! call so tests can assert on exact device traffic, and can be told to fail a specific
//! call to exercise the failure paths.
//!
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockInstrument` - objective turret and focus drive
//! - `MockDispenser` - oiler pump
//!
//! For protocol-level simulation (real sockets and frames) see [`crate::hardware::simulated`].

use crate::error::{AppResult, OilerError};
use crate::hardware::capabilities::{Dispenser, InstrumentControl, ZMove};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Error a mock produces when told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// `Device` error with code 99
    Device,
    /// `Timeout` error
    Timeout,
    /// `Connection` error, as if the link dropped
    Connection,
}

impl MockFailure {
    fn to_error(self, operation: &str) -> OilerError {
        match self {
            MockFailure::Device => OilerError::Device {
                code: 99,
                message: format!("simulated {operation} failure"),
            },
            MockFailure::Timeout => OilerError::timeout(operation, Duration::from_millis(10)),
            MockFailure::Connection => {
                OilerError::Connection(format!("link lost during {operation}"))
            }
        }
    }
}

// =============================================================================
// MockInstrument
// =============================================================================

/// Instrument operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentOp {
    GetObjective,
    SetObjective,
    MoveZ,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentCall {
    GetObjective,
    SetObjective(u32),
    MoveZ(ZMove),
}

impl InstrumentCall {
    fn op(&self) -> InstrumentOp {
        match self {
            Self::GetObjective => InstrumentOp::GetObjective,
            Self::SetObjective(_) => InstrumentOp::SetObjective,
            Self::MoveZ(_) => InstrumentOp::MoveZ,
        }
    }
}

#[derive(Debug)]
struct InstrumentState {
    objective: u32,
    z: f64,
    calls: Vec<InstrumentCall>,
}

/// Mock stage/objective controller.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockInstrument::new(3).failing(InstrumentOp::MoveZ, 1, MockFailure::Device);
/// assert!(stage.move_z(ZMove::Relative(50.0)).await.is_err());
/// assert_eq!(stage.calls().await, vec![InstrumentCall::MoveZ(ZMove::Relative(50.0))]);
/// ```
#[derive(Debug)]
pub struct MockInstrument {
    state: Mutex<InstrumentState>,
    failure: Option<(InstrumentOp, usize, MockFailure)>,
    latency: Duration,
}

impl MockInstrument {
    /// Mock with the turret at `objective` and focus at 0.
    pub fn new(objective: u32) -> Self {
        Self {
            state: Mutex::new(InstrumentState {
                objective,
                z: 0.0,
                calls: Vec::new(),
            }),
            failure: None,
            latency: Duration::ZERO,
        }
    }

    /// Fail the `occurrence`-th (1-based) call of `op`.
    #[must_use]
    pub fn failing(mut self, op: InstrumentOp, occurrence: usize, failure: MockFailure) -> Self {
        self.failure = Some((op, occurrence, failure));
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call received, in order.
    pub async fn calls(&self) -> Vec<InstrumentCall> {
        self.state.lock().await.calls.clone()
    }

    /// Current turret position.
    pub async fn objective(&self) -> u32 {
        self.state.lock().await.objective
    }

    /// Current focus position.
    pub async fn z(&self) -> f64 {
        self.state.lock().await.z
    }

    /// Record `call` and decide whether it fails.
    async fn record(&self, call: InstrumentCall) -> AppResult<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let mut state = self.state.lock().await;
        let op = call.op();
        state.calls.push(call);
        let seen = state.calls.iter().filter(|c| c.op() == op).count();

        match self.failure {
            Some((fail_op, occurrence, failure)) if fail_op == op && occurrence == seen => {
                Err(failure.to_error(&format!("{op:?}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl InstrumentControl for MockInstrument {
    async fn get_objective(&self) -> AppResult<u32> {
        self.record(InstrumentCall::GetObjective).await?;
        Ok(self.state.lock().await.objective)
    }

    async fn set_objective(&self, index: u32) -> AppResult<()> {
        self.record(InstrumentCall::SetObjective(index)).await?;
        self.state.lock().await.objective = index;
        Ok(())
    }

    async fn move_z(&self, movement: ZMove) -> AppResult<()> {
        self.record(InstrumentCall::MoveZ(movement)).await?;
        let mut state = self.state.lock().await;
        state.z = match movement {
            ZMove::Relative(delta) => state.z + delta,
            ZMove::Absolute(target) => target,
        };
        Ok(())
    }
}

// =============================================================================
// MockDispenser
// =============================================================================

type DispenseHook = Box<dyn Fn(u32) + Send + Sync>;

/// Mock oiler pump.
pub struct MockDispenser {
    dispensed: Mutex<Vec<u32>>,
    failure: Option<MockFailure>,
    latency: Duration,
    hook: Option<DispenseHook>,
}

impl std::fmt::Debug for MockDispenser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDispenser")
            .field("failure", &self.failure)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for MockDispenser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDispenser {
    /// Dispenser that succeeds immediately.
    pub fn new() -> Self {
        Self {
            dispensed: Mutex::new(Vec::new()),
            failure: None,
            latency: Duration::ZERO,
            hook: None,
        }
    }

    /// Fail every dispense.
    #[must_use]
    pub fn failing(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run `hook` after every successful dispense.
    #[must_use]
    pub fn on_dispense(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Amounts dispensed so far, in order.
    pub async fn dispensed(&self) -> Vec<u32> {
        self.dispensed.lock().await.clone()
    }
}

#[async_trait]
impl Dispenser for MockDispenser {
    async fn dispense(&self, amount_steps: u32) -> AppResult<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if let Some(failure) = self.failure {
            return Err(failure.to_error("dispense"));
        }
        self.dispensed.lock().await.push(amount_steps);
        if let Some(hook) = &self.hook {
            hook(amount_steps);
        }
        Ok(())
    }
}
