//! Procedure run records.
//!
//! A [`ProcedureRun`] is returned for every run that got past the busy check, whatever
//! its outcome. Runs are never persisted.

use super::step::{StepRecord, StepStatus};
use super::ProcedureKind;
use crate::error::{AppResult, ErrorKind, OilerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// All six steps completed
    Succeeded,
    /// Step `step` (1-based) failed; later steps never ran
    FailedAtStep {
        step: usize,
        kind: ErrorKind,
        reason: String,
    },
    /// The operator cancelled before step `before_step` started
    Aborted { before_step: usize },
}

impl RunOutcome {
    /// Whether every step completed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The outcome as a `Result`, for callers that propagate with `?`.
    ///
    /// Cancellation maps to [`OilerError::Aborted`]; a failed step keeps its kind.
    pub fn to_result(&self) -> AppResult<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Aborted { .. } => Err(OilerError::Aborted),
            Self::FailedAtStep { step, kind, reason } => Err(OilerError::StepFailed {
                step: *step,
                kind: *kind,
                reason: reason.clone(),
            }),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedAtStep { step, kind, reason } => {
                write!(f, "failed at step {step} ({kind}): {reason}")
            }
            Self::Aborted { before_step } => write!(f, "aborted before step {before_step}"),
        }
    }
}

/// Record of one procedure run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRun {
    /// Correlates the run's events
    pub run_id: Uuid,
    /// Procedure that ran
    pub kind: ProcedureKind,
    /// All six steps in order, including those that never ran
    pub steps: Vec<StepRecord>,
    /// Objective restored at step 6: the caller's target for low-to-high, the
    /// captured objective for re-oiling (unknown until step 1 completes)
    pub return_objective: Option<u32>,
    /// Terminal outcome
    pub outcome: RunOutcome,
    /// When the busy check passed
    pub started_at: DateTime<Utc>,
    /// When the terminal outcome was decided
    pub finished_at: DateTime<Utc>,
}

impl ProcedureRun {
    /// Steps with the given status, in order.
    pub fn steps_with(&self, status: StepStatus) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |s| s.status == status)
    }

    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
