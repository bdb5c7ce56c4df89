//! Device Capabilities
//!
//! The procedure sequencer never talks to a concrete client. It drives two small
//! capability traits, one per physical function it needs:
//!
//! - the stage/objective controller implements [`InstrumentControl`]
//! - the oiler implements [`Dispenser`]
//!
//! Tests and the simulated CLI mode substitute the mocks in [`crate::hardware::mock`].
//!
//! # Design
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`AppResult`] so the sequencer can classify failures
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn raise_and_return<T: InstrumentControl>(stage: &T, microns: f64) -> AppResult<()> {
//!     stage.move_z(ZMove::Relative(microns)).await?;
//!     stage.move_z(ZMove::Relative(-microns)).await
//! }
//! ```

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Focus moves
// =============================================================================

/// A focus (Z) move request in microns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ZMove {
    /// Move by the given signed distance
    Relative(f64),
    /// Move to the given position
    Absolute(f64),
}

impl ZMove {
    /// Protocol keyword for the move mode.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Relative(_) => "REL",
            Self::Absolute(_) => "ABS",
        }
    }

    /// Distance or target in microns.
    pub fn microns(&self) -> f64 {
        match self {
            Self::Relative(v) | Self::Absolute(v) => *v,
        }
    }
}

// =============================================================================
// Capability traits
// =============================================================================

/// Objective turret and focus drive.
#[async_trait]
pub trait InstrumentControl: Send + Sync {
    /// Current turret position.
    async fn get_objective(&self) -> AppResult<u32>;

    /// Switch the turret and wait for the move to complete.
    async fn set_objective(&self, index: u32) -> AppResult<()>;

    /// Move the focus drive. Returns once the controller acknowledges.
    async fn move_z(&self, movement: ZMove) -> AppResult<()>;
}

/// Fluid dispenser.
#[async_trait]
pub trait Dispenser: Send + Sync {
    /// Dispense `amount_steps` pump steps and wait for the acknowledgement.
    async fn dispense(&self, amount_steps: u32) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_move_accessors() {
        let up = ZMove::Relative(50.0);
        assert_eq!(up.mode(), "REL");
        assert_eq!(up.microns(), 50.0);
        assert_eq!(ZMove::Absolute(-1.5).mode(), "ABS");
    }
}
