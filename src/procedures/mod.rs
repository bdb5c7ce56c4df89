//! Oiling procedures.
//!
//! Two procedures share one parameterized six-step list:
//!
//! ```text
//!  1. capture current objective     (re-oil: becomes the return target)
//!  2. switch to the service objective
//!  3. dispense
//!  4. raise stage   (+raise, relative)
//!  5. lower stage   (-raise, relative)
//!  6. return to objective           (low-to-high: caller target; re-oil: captured)
//! ```
//!
//! # State machine
//!
//! ```text
//! Idle ──run()──> Running(1) ──> … ──> Running(6) ──> Succeeded
//!                     │                    │
//!                     ├── step error ──────┴──> FailedAtStep(i)
//!                     └── cancel observed before step i ──> Aborted
//! ```
//!
//! Any failure stops the run immediately; device operations are never retried and
//! nothing is rolled back beyond the built-in raise/lower pairing. Cancellation is only
//! observed between steps, so a started dispense or move always completes.
//!
//! At most one run is active at a time; a second request fails with `Busy` and never
//! interleaves device commands with the active run.

pub mod guard;
pub mod result;
pub mod step;

pub use guard::{CancelFlag, RunGuard};
pub use result::{ProcedureRun, RunOutcome};
pub use step::{StepAction, StepRecord, StepStatus};

use crate::config::OperationalSettings;
use crate::error::{AppResult, OilerError};
use crate::hardware::capabilities::{Dispenser, InstrumentControl, ZMove};
use crate::messages::RunEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Which procedure to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureKind {
    /// Oil, then switch to the caller's (typically higher-magnification) objective
    LowToHigh { target_objective: u32 },
    /// Oil, then return to whatever objective was in place
    ReOil,
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowToHigh { target_objective } => {
                write!(f, "low-to-high (target objective {target_objective})")
            }
            Self::ReOil => write!(f, "re-oil"),
        }
    }
}

/// Numeric inputs of a run, taken from the settings snapshot when the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureParams {
    /// Turret position switched to at step 2
    pub service_objective: u32,
    /// Pump steps dispensed at step 3
    pub dispense_amount: u32,
    /// Distance raised at step 4 and lowered again at step 5
    pub raise_microns: f64,
}

impl From<&OperationalSettings> for ProcedureParams {
    fn from(settings: &OperationalSettings) -> Self {
        Self {
            service_objective: settings.service_objective_index,
            dispense_amount: settings.default_dispense_amount,
            raise_microns: settings.service_raise_microns,
        }
    }
}

/// The step list for `kind`.
pub fn plan(kind: ProcedureKind, params: &ProcedureParams) -> Vec<StepAction> {
    let target = match kind {
        ProcedureKind::LowToHigh { target_objective } => Some(target_objective),
        ProcedureKind::ReOil => None,
    };
    vec![
        StepAction::CaptureObjective,
        StepAction::SelectServiceObjective(params.service_objective),
        StepAction::Dispense(params.dispense_amount),
        StepAction::RaiseStage(params.raise_microns),
        StepAction::LowerStage(params.raise_microns),
        StepAction::ReturnToObjective(target),
    ]
}

/// Runs procedures against a pair of capabilities.
///
/// Cloning shares the busy slot and the cancel flag.
#[derive(Clone)]
pub struct Sequencer {
    instrument: Arc<dyn InstrumentControl>,
    dispenser: Arc<dyn Dispenser>,
    active: Arc<AtomicBool>,
    cancel: CancelFlag,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Sequencer driving `instrument` and `dispenser`, initially idle.
    pub fn new(instrument: Arc<dyn InstrumentControl>, dispenser: Arc<dyn Dispenser>) -> Self {
        Self {
            instrument,
            dispenser,
            active: Arc::new(AtomicBool::new(false)),
            cancel: CancelFlag::new(),
        }
    }

    /// Run `kind` to completion on the caller's task.
    ///
    /// Fails only with `Busy`; every other outcome is reported in the returned run.
    pub async fn run(
        &self,
        kind: ProcedureKind,
        params: ProcedureParams,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> AppResult<ProcedureRun> {
        let guard = self.claim()?;
        Ok(self.execute(guard, kind, params, events).await)
    }

    /// Start `kind` on a tokio worker task.
    ///
    /// The busy check happens before this returns.
    pub fn spawn(
        &self,
        kind: ProcedureKind,
        params: ProcedureParams,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> AppResult<JoinHandle<ProcedureRun>> {
        let guard = self.claim()?;
        let sequencer = self.clone();
        Ok(tokio::spawn(async move {
            sequencer.execute(guard, kind, params, events).await
        }))
    }

    /// Request cancellation of the active run. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.trigger("cancelled by operator");
        info!("Cancellation requested, stopping at the next step boundary");
        true
    }

    /// Whether a run (or a manual reservation) holds the slot.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the run slot for a manual device operation.
    ///
    /// While the returned guard lives, procedure requests fail with `Busy`.
    pub fn reserve(&self) -> AppResult<RunGuard> {
        RunGuard::acquire(&self.active)
    }

    /// Handle on the flag `cancel` sets.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn claim(&self) -> AppResult<RunGuard> {
        let guard = RunGuard::acquire(&self.active).inspect_err(|_| {
            warn!("Procedure rejected, another run is active");
        })?;
        self.cancel.reset();
        Ok(guard)
    }

    async fn execute(
        &self,
        _guard: RunGuard,
        kind: ProcedureKind,
        params: ProcedureParams,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> ProcedureRun {
        let emit = |event: RunEvent| {
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut steps: Vec<StepRecord> = plan(kind, &params)
            .into_iter()
            .enumerate()
            .map(|(i, action)| StepRecord {
                number: i + 1,
                action,
                status: StepStatus::Pending,
            })
            .collect();

        info!(%run_id, %kind, ?params, "Procedure started");
        emit(RunEvent::Started { run_id, kind });

        let mut return_objective = match kind {
            ProcedureKind::LowToHigh { target_objective } => Some(target_objective),
            ProcedureKind::ReOil => None,
        };
        let mut outcome = RunOutcome::Succeeded;

        for step in steps.iter_mut() {
            if self.cancel.is_triggered() {
                warn!(%run_id, before_step = step.number, "Procedure aborted");
                outcome = RunOutcome::Aborted {
                    before_step: step.number,
                };
                break;
            }

            let name = step.name().to_string();
            info!(%run_id, step = step.number, %name, "Step started");
            emit(RunEvent::StepStarted {
                step: step.number,
                name: name.clone(),
            });

            match self.perform(step.action, kind, &mut return_objective).await {
                Ok(()) => {
                    step.status = StepStatus::Done;
                    emit(RunEvent::StepCompleted {
                        step: step.number,
                        name,
                    });
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    error!(%run_id, step = step.number, %name, "Step failed: {}", e);
                    emit(RunEvent::StepFailed {
                        step: step.number,
                        name,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                    outcome = RunOutcome::FailedAtStep {
                        step: step.number,
                        kind: e.kind(),
                        reason: e.to_string(),
                    };
                    break;
                }
            }
        }

        info!(%run_id, %outcome, "Procedure finished");
        emit(RunEvent::Finished {
            run_id,
            outcome: outcome.clone(),
        });

        ProcedureRun {
            run_id,
            kind,
            steps,
            return_objective,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn perform(
        &self,
        action: StepAction,
        kind: ProcedureKind,
        return_objective: &mut Option<u32>,
    ) -> AppResult<()> {
        match action {
            StepAction::CaptureObjective => {
                let current = self.instrument.get_objective().await?;
                match kind {
                    ProcedureKind::ReOil => {
                        *return_objective = Some(current);
                        info!(objective = current, "Captured objective to return to");
                    }
                    ProcedureKind::LowToHigh { .. } => {
                        info!(objective = current, "Starting from objective");
                    }
                }
                Ok(())
            }
            StepAction::SelectServiceObjective(index) => {
                self.instrument.set_objective(index).await
            }
            StepAction::Dispense(amount) => self.dispenser.dispense(amount).await,
            StepAction::RaiseStage(microns) => {
                self.instrument.move_z(ZMove::Relative(microns)).await
            }
            StepAction::LowerStage(microns) => {
                self.instrument.move_z(ZMove::Relative(-microns)).await
            }
            StepAction::ReturnToObjective(target) => {
                let target = target.or(*return_objective).ok_or_else(|| {
                    OilerError::Protocol("no objective recorded to return to".to_string())
                })?;
                self.instrument.set_objective(target).await
            }
        }
    }
}
