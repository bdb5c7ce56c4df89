//! # Scope Oiler Core Library
//!
//! This crate coordinates a microscope stage/objective controller (reached over TCP) and
//! a wireless oiler (reached over Bluetooth Low Energy) through the objective oiling
//! procedures. The `scope-oiler` binary is a thin command-line front-end over it.
//!
//! ## Crate Structure
//!
//! - **`app`**: the `Orchestrator` facade that front-ends talk to. Owns the settings
//!   snapshot, both device clients and the sequencer.
//! - **`config`**: the persisted settings document, its validation and atomic saving.
//! - **`error`**: the `OilerError` taxonomy shared by every component.
//! - **`hardware`**: capability traits, the controller and oiler clients, mocks and
//!   wire-level simulators.
//! - **`logging`**: `tracing` subscriber setup for binaries.
//! - **`messages`**: status and run-progress messages crossing thread boundaries.
//! - **`procedures`**: the six-step oiling sequencer.

pub mod app;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod procedures;

pub use app::Orchestrator;
pub use error::{AppResult, OilerError};
