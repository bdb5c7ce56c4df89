//! Hardware layer.
//!
//! - `capabilities` - the traits the procedures drive
//! - `instrument` - stage/objective controller client (TCP)
//! - `oiler` - wireless oiler client (dedicated thread + actor)
//! - `mock` - capability mocks with call recording
//! - `simulated` - wire-level simulators for both devices

pub mod capabilities;
pub mod instrument;
pub mod mock;
pub mod oiler;
pub mod simulated;

pub use capabilities::{Dispenser, InstrumentControl, ZMove};
