//! Procedure steps.
//!
//! Both procedures share one six-step list; only the step-1 role and the step-6 target
//! differ by procedure kind.

use serde::{Deserialize, Serialize};

/// The operation a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepAction {
    /// Read the current objective (restoration target for re-oiling)
    CaptureObjective,
    /// Swing the service position into place
    SelectServiceObjective(u32),
    /// Dispense the given number of pump steps
    Dispense(u32),
    /// Relative focus move up by the given microns
    RaiseStage(f64),
    /// Relative focus move down by the given microns
    LowerStage(f64),
    /// Restore the working objective. `None` means "the objective captured at step 1".
    ReturnToObjective(Option<u32>),
}

impl StepAction {
    /// Stable snake_case name used in events and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CaptureObjective => "capture_objective",
            Self::SelectServiceObjective(_) => "select_service_objective",
            Self::Dispense(_) => "dispense",
            Self::RaiseStage(_) => "raise_stage",
            Self::LowerStage(_) => "lower_stage",
            Self::ReturnToObjective(_) => "return_to_objective",
        }
    }
}

/// Per-step progress within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not started; stays here when an earlier step failed or the run was cancelled
    Pending,
    Done,
    Failed,
}

/// One step of a run and how far it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the run
    pub number: usize,
    /// What the step does
    pub action: StepAction,
    /// Progress so far
    pub status: StepStatus,
}

impl StepRecord {
    /// Name of the step's action.
    pub fn name(&self) -> &'static str {
        self.action.name()
    }
}
