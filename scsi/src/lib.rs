//! Parallel SCSI initiator protocol engine.
//!
//! This crate drives one SCSI-2 bus as the initiator: it owns the
//! start queue and the per-target/per-LUN state, establishes and tears
//! down nexuses, runs tagged queuing, negotiates synchronous and wide
//! transfer modes, and recovers from timeouts and protocol violations.
//! The adapter hardware sits behind the [`hba::HbaDriver`] trait; the
//! host above sits behind [`hba::Submitter`].
//!
//! The engine is single-threaded and callback-driven. The host forwards
//! adapter events through [`engine::Engine::on_event`] (or lets
//! [`engine::Engine::poll`] pump a polled adapter), drives the deadline
//! supervisor with [`engine::Engine::tick`] at a steady rate, and never
//! re-enters the engine from a completion callback.
//!
//! By depending only on `alloc`, the engine runs unchanged inside the
//! kernel and under `cargo test` on the host.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cdb;
pub mod command;
pub mod device;
pub mod engine;
pub mod error;
pub mod hba;
pub mod msg;
mod msgin;
pub mod msgout;
mod nexus;
pub mod queue;

pub use command::{CmdId, Command, TagKind};
pub use engine::{AbortOutcome, Engine, EngineConfig, ResetScope, Stats};
pub use error::{CmdError, ScsiStatus, SubmitError};
pub use hba::{BusEvent, BusPhase, DataDir, DataRegion, HbaDriver, SelectOutcome, Submitter, SyncParams};
