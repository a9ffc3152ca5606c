//! Orchestration core for setting up, tuning, and shutting down the
//! superconducting RF cavities of an accelerator.
//!
//! The machine is modeled as a containment hierarchy (machine → linac →
//! cryomodule → rack → cavity) built once at startup from [`config::Settings`].
//! Cavities are the controllable leaves: each owns its channel bindings, a
//! cooperative [`abort::AbortState`], a [`stepper::StepperTuner`] for coarse
//! frequency moves, and a fixed-order setup state machine (SSA calibration,
//! tuning, characterization, RF ramp). The [`orchestrator::SetupOrchestrator`]
//! resolves operator targets to cavity sets and fans commands out, one tokio
//! task per cavity.
//!
//! All hardware access goes through the [`channel::ChannelAccess`] trait;
//! [`channel::SimChannelService`] backs the tests and the demo binary.

pub mod abort;
pub mod cavity;
pub mod channel;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod orchestrator;
pub mod persist;
pub mod ramp;
pub mod status;
pub mod stepper;

pub use error::{SetupError, SetupResult};
