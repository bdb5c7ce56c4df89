//! Run exclusivity and cancellation
//!
//! Two small synchronization primitives used by the sequencer:
//!
//! - `RunGuard`: RAII claim on the single-active-run slot. Released on drop, so a run
//!   that panics or whose task is aborted can never wedge the sequencer in "busy".
//! - `CancelFlag`: operator cancellation request, observed at step boundaries only.

use crate::error::{AppResult, OilerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Run Guard
// =============================================================================

/// Claim on the single-active-run slot.
#[derive(Debug)]
pub struct RunGuard {
    active: Arc<AtomicBool>,
}

impl RunGuard {
    /// Claim the slot, or fail with `Busy` if a run already holds it.
    pub fn acquire(active: &Arc<AtomicBool>) -> AppResult<Self> {
        active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| OilerError::Busy)?;
        debug!("Run slot acquired");
        Ok(Self {
            active: active.clone(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Run slot released during panic");
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Cancel Flag
// =============================================================================

/// Shared cancellation request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<std::sync::RwLock<Option<String>>>,
}

impl CancelFlag {
    /// Untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn trigger(&self, reason: impl Into<String>) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
    }

    /// Whether cancellation was requested since the last reset.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given with the request.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear a stale request before a new run starts.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }
}
