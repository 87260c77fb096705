//! Capability traits at the engine's two seams.
//!
//! [`HbaDriver`] is implemented by the hardware-specific collaborator that
//! actually drives the bus signals; [`Submitter`] by the host layer that
//! created the command and wants it back. The engine is written entirely
//! against these traits and owns no hardware knowledge of its own.

use crate::command::Command;

/// Bus information-transfer phases as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    /// Initiator sends CDB bytes.
    CommandOut,
    /// Target sends data to the initiator.
    DataIn,
    /// Initiator sends data to the target.
    DataOut,
    /// Target sends message bytes.
    MessageIn,
    /// Initiator sends message bytes (requested via ATN).
    MessageOut,
    /// Target sends the status byte.
    StatusIn,
    /// Nobody owns the bus.
    BusFree,
}

/// Asynchronous notifications from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// The bus moved to a new information-transfer phase; ask
    /// [`HbaDriver::current_phase`] which one.
    PhaseChange,
    /// A target won arbitration and reselected us.
    Reselected {
        /// SCSI id of the reselecting target.
        target: u8,
    },
    /// The adapter latched a parity error on an incoming byte.
    ParityError {
        /// Information-transfer phase the bad byte arrived in.
        phase: BusPhase,
    },
    /// The bus went free.
    BusFree,
}

/// Outcome of an arbitration + selection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Target selected; phase events follow.
    Ok,
    /// Arbitration lost to another initiator or a reselecting target.
    Lost,
    /// The adapter cannot start a selection right now.
    Busy,
}

/// An opaque host-side data buffer the adapter can move bytes of.
///
/// The engine only does cursor arithmetic on it; the adapter owns the
/// actual access (DMA or PIO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRegion {
    /// Address meaningful to the adapter (bus or physical).
    pub addr: u64,
    /// Total length in bytes.
    pub len: u32,
}

/// Data transfer direction from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    /// No data phase expected.
    None,
    /// Read: target to initiator.
    In,
    /// Write: initiator to target.
    Out,
}

/// The physical bus adapter, consumed by the engine.
///
/// Methods take `&mut self`; the host serializes all engine entry points
/// (see the crate-level concurrency contract), so the adapter never sees
/// reentrant calls.
pub trait HbaDriver {
    /// Arbitrates for the bus and selects `target` with ATN asserted.
    fn arbitrate_and_select(&mut self, target: u8) -> SelectOutcome;

    /// The phase currently asserted on the bus.
    fn current_phase(&self) -> BusPhase;

    /// Sends engine-owned bytes (command-out and message-out phases).
    /// Returns the number of bytes the target accepted.
    fn send_bytes(&mut self, bytes: &[u8]) -> usize;

    /// Receives into an engine-owned buffer (message-in and status-in
    /// phases). Returns the number of bytes received.
    fn recv_bytes(&mut self, buf: &mut [u8]) -> usize;

    /// Moves up to `len` bytes of a host buffer starting at `offset`.
    /// Returns the number of bytes actually moved.
    fn data_transfer(&mut self, dir: DataDir, region: DataRegion, offset: u32, len: u32) -> u32;

    /// Asserts the attention line, requesting a message-out phase.
    fn assert_attention(&mut self);

    /// Releases the attention line.
    fn release_attention(&mut self);

    /// Hard-resets the bus. Every nexus on the bus is gone afterwards.
    fn reset_bus(&mut self);

    /// Pumps one pending bus event, for hosts without interrupt delivery.
    fn poll(&mut self) -> Option<BusEvent>;
}

/// Negotiated synchronous parameters reported to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParams {
    /// Transfer period factor.
    pub period: u8,
    /// REQ/ACK offset.
    pub offset: u8,
}

/// The command-submission layer above the engine.
pub trait Submitter {
    /// Final delivery of a submitted command, exactly once. Ownership of
    /// the command returns to the submitter.
    fn on_command_complete(&mut self, cmd: Command);

    /// Informational: transfer agreement reached with a target.
    /// `sync` is `None` for asynchronous; `wide` is the width exponent.
    fn on_negotiation_result(&mut self, target: u8, sync: Option<SyncParams>, wide: u8) {
        let _ = (target, sync, wide);
    }
}
