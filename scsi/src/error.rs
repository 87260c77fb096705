//! Error accumulation, status bytes, and the retry-disposition classifier.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Errors accumulated against a command over its lifetime.
    ///
    /// Several may apply to one command; the full set is delivered with
    /// the final completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdError: u16 {
        /// The target never answered selection.
        const SELECTION_TIMEOUT = 1 << 0;
        /// BUSY status received.
        const BUSY_STATUS = 1 << 1;
        /// QUEUE FULL status received on a tagged command.
        const QUEUE_FULL = 1 << 2;
        /// Bus parity error during a transfer.
        const PARITY = 1 << 3;
        /// The target released the bus outside a disconnect/complete context.
        const UNEXPECTED_BUS_FREE = 1 << 4;
        /// CHECK CONDITION status; sense data attached when autosense ran.
        const CHECK_CONDITION = 1 << 5;
        /// Aborted on request or as part of recovery.
        const ABORTED = 1 << 6;
        /// The supervisor's deadline expired.
        const TIMEOUT = 1 << 7;
        /// The target moved more data than the command described.
        const DATA_OVERRUN = 1 << 8;
        /// Engine-detected invariant violation (nexus mismatch and the like).
        const PROTO_FATAL = 1 << 9;
    }
}

/// SCSI status byte, as far as the engine interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    /// GOOD.
    Good,
    /// CHECK CONDITION; sense data must be retrieved.
    CheckCondition,
    /// CONDITION MET.
    ConditionMet,
    /// BUSY; the target cannot accept the command right now.
    Busy,
    /// INTERMEDIATE; a linked command completed.
    Intermediate,
    /// INTERMEDIATE-CONDITION MET.
    IntermediateConditionMet,
    /// RESERVATION CONFLICT.
    ReservationConflict,
    /// COMMAND TERMINATED.
    CommandTerminated,
    /// QUEUE FULL; the target's command queue is exhausted.
    QueueFull,
    /// Anything else.
    Unknown(u8),
}

impl ScsiStatus {
    /// Decodes a raw status byte (reserved bits masked per SCSI-2).
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x3E {
            0x00 => Self::Good,
            0x02 => Self::CheckCondition,
            0x04 => Self::ConditionMet,
            0x08 => Self::Busy,
            0x10 => Self::Intermediate,
            0x14 => Self::IntermediateConditionMet,
            0x18 => Self::ReservationConflict,
            0x22 => Self::CommandTerminated,
            0x28 => Self::QueueFull,
            _ => Self::Unknown(byte),
        }
    }

    /// True for the two linked-command intermediate statuses.
    #[must_use]
    pub fn is_intermediate(self) -> bool {
        matches!(self, Self::Intermediate | Self::IntermediateConditionMet)
    }
}

/// Errors returned from the engine's submission surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The adapter is shut down or was never started.
    Inactive,
    /// The adapter cannot accept work right now.
    Busy,
    /// No such command (abort of an unknown or already completed handle).
    NotFound,
    /// Target or LUN outside the addressable range, or self-addressed.
    BadAddress,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("adapter inactive"),
            Self::Busy => f.write_str("adapter busy"),
            Self::NotFound => f.write_str("no such command"),
            Self::BadAddress => f.write_str("bad target/LUN address"),
        }
    }
}

/// What to do with a command whose bus transaction has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry immediately; no charge against the retry budget.
    RetryNow,
    /// Retry after backoff; charged against the retry budget.
    RetryBackoff,
    /// Run an internal REQUEST SENSE before deciding.
    NeedsSense,
    /// Hand back to the submitter with the accumulated error set.
    Fatal,
}

/// Classifies a command's accumulated errors into a disposition.
///
/// `no_retry` reflects the command's flag; `retries`/`budget` are the
/// count already consumed and the configured ceiling. Order matters:
/// fatal conditions dominate, then sense retrieval, then the local
/// recoveries that are never surfaced.
#[must_use]
pub fn classify(
    errors: CmdError,
    no_retry: bool,
    sensed: bool,
    retries: u8,
    budget: u8,
) -> Disposition {
    if errors.intersects(CmdError::PROTO_FATAL | CmdError::ABORTED | CmdError::TIMEOUT) {
        // A timed-out command already consumed its whole deadline;
        // retrying it would double every stall.
        return Disposition::Fatal;
    }
    if errors.contains(CmdError::CHECK_CONDITION) {
        // Once sense data is attached the command is done.
        if sensed {
            return Disposition::Fatal;
        }
        return Disposition::NeedsSense;
    }
    if no_retry {
        return Disposition::Fatal;
    }
    if errors.intersects(CmdError::BUSY_STATUS | CmdError::QUEUE_FULL) {
        return Disposition::RetryNow;
    }
    if errors.intersects(
        CmdError::SELECTION_TIMEOUT | CmdError::PARITY | CmdError::UNEXPECTED_BUS_FREE,
    ) {
        if retries >= budget {
            return Disposition::Fatal;
        }
        return Disposition::RetryBackoff;
    }
    // Data overrun with nothing else: surface it.
    Disposition::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_with_reserved_bits_masked() {
        assert_eq!(ScsiStatus::from_byte(0x00), ScsiStatus::Good);
        assert_eq!(ScsiStatus::from_byte(0x02), ScsiStatus::CheckCondition);
        assert_eq!(ScsiStatus::from_byte(0x08), ScsiStatus::Busy);
        assert_eq!(ScsiStatus::from_byte(0x28), ScsiStatus::QueueFull);
        // Vendor bits outside 0x3E must not change the meaning.
        assert_eq!(ScsiStatus::from_byte(0x42), ScsiStatus::CheckCondition);
    }

    #[test]
    fn busy_and_queue_full_retry_without_charge() {
        assert_eq!(
            classify(CmdError::BUSY_STATUS, false, false, 0, 3),
            Disposition::RetryNow
        );
        assert_eq!(
            classify(CmdError::QUEUE_FULL, false, false, 3, 3),
            Disposition::RetryNow
        );
    }

    #[test]
    fn transient_bus_errors_retry_until_budget() {
        assert_eq!(
            classify(CmdError::SELECTION_TIMEOUT, false, false, 0, 3),
            Disposition::RetryBackoff
        );
        assert_eq!(
            classify(CmdError::PARITY, false, false, 2, 3),
            Disposition::RetryBackoff
        );
        assert_eq!(
            classify(CmdError::UNEXPECTED_BUS_FREE, false, false, 3, 3),
            Disposition::Fatal
        );
    }

    #[test]
    fn check_condition_wants_sense() {
        assert_eq!(
            classify(CmdError::CHECK_CONDITION, false, false, 0, 3),
            Disposition::NeedsSense
        );
        // After autosense the command is delivered, not re-sensed.
        assert_eq!(
            classify(CmdError::CHECK_CONDITION, false, true, 0, 3),
            Disposition::Fatal
        );
    }

    #[test]
    fn no_retry_flag_is_final() {
        assert_eq!(
            classify(CmdError::SELECTION_TIMEOUT, true, false, 0, 3),
            Disposition::Fatal
        );
    }

    #[test]
    fn hard_errors_dominate() {
        assert_eq!(
            classify(CmdError::PROTO_FATAL | CmdError::BUSY_STATUS, false, false, 0, 3),
            Disposition::Fatal
        );
        assert_eq!(
            classify(CmdError::TIMEOUT, false, false, 0, 3),
            Disposition::Fatal
        );
        assert_eq!(
            classify(CmdError::ABORTED | CmdError::CHECK_CONDITION, false, false, 0, 3),
            Disposition::Fatal
        );
    }
}
