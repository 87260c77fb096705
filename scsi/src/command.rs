//! The command object and its invariant-preserving state.
//!
//! One [`Command`] exists per logical I/O request, owned by the engine
//! from submission until the completion callback. Queue membership is an
//! explicit [`CmdPlace`] field that only the engine's mutators touch; the
//! derived disconnect counters must never diverge from it.

use bitflags::bitflags;

use crate::error::{CmdError, ScsiStatus};
use crate::hba::{DataDir, DataRegion};
use crate::msgout::OutMsgSet;

/// Handle to a command inside the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdId(pub(crate) u32);

/// Maximum CDB length the engine carries.
pub const MAX_CDB: usize = 12;

/// Size of the engine-owned inline buffer used by internal commands.
pub const INLINE_BUF: usize = 64;

/// Queue-tag flavor for tagged commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// SIMPLE QUEUE TAG; the target may reorder.
    Simple,
    /// ORDERED QUEUE TAG; executes after everything before it.
    Ordered,
    /// HEAD OF QUEUE TAG; executes next.
    Head,
}

bitflags! {
    /// Command lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u8 {
        /// Engine-issued (probe or autosense); destroyed on completion
        /// instead of being handed to the submitter.
        const INTERNAL = 1 << 0;
        /// Goes to the head of the start queue.
        const URGENT = 1 << 1;
        /// Never retried; first failure is final.
        const NO_RETRY = 1 << 2;
        /// Autosense has run for this command; sense data is attached.
        const AUTOSENSE = 1 << 3;
        /// Part of a contingent-allegiance recovery; bypasses the tag
        /// window and the CA admission block.
        const CA_RECOVERY = 1 << 4;
        /// Suppress per-command logging.
        const SILENT = 1 << 5;
        /// An abort was requested while the command was off the bus.
        const ABORT_PENDING = 1 << 6;
    }
}

/// Where a command currently lives.
///
/// While a command is outstanding on the bus it is in exactly one of
/// `StartQueue`, `Active`, or `Disconnected`. `Parked` holds a command
/// whose transaction ended but whose sense data is still being fetched;
/// `Detached` is the transitional state around creation and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdPlace {
    /// Not in any engine queue.
    Detached,
    /// Waiting in the start queue.
    StartQueue,
    /// The active nexus.
    Active,
    /// On its LUN's disconnect queue.
    Disconnected,
    /// Held awaiting autosense results.
    Parked,
}

/// The data buffer a command transfers against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBuf {
    /// No data phase.
    None,
    /// Host-owned buffer, moved by the adapter.
    Region(DataRegion),
    /// Small engine-owned buffer (internal probes and sense).
    Inline,
}

/// Transfer pointer: a cursor over the command's data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataPtr {
    /// Byte offset of the next transfer.
    pub offset: u32,
    /// Bytes still expected.
    pub remaining: u32,
}

impl DataPtr {
    /// Rewinds the cursor by `n` bytes (wide residue, modify pointer).
    pub fn rewind(&mut self, n: u32) {
        let n = n.min(self.offset);
        self.offset -= n;
        self.remaining += n;
    }

    /// Advances the cursor by `n` transferred bytes.
    pub fn advance(&mut self, n: u32) {
        let n = n.min(self.remaining);
        self.offset += n;
        self.remaining -= n;
    }
}

/// Sense data captured by autosense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Raw sense bytes.
    pub bytes: [u8; 18],
    /// Valid length.
    pub len: u8,
}

/// One logical I/O request.
#[derive(Debug, Clone)]
pub struct Command {
    /// Target SCSI id.
    pub target: u8,
    /// Logical unit number.
    pub lun: u8,
    /// Queue tag, unassigned until allocation.
    pub(crate) tag: Option<u8>,
    /// Tag flavor used when tagged.
    pub(crate) tag_kind: TagKind,
    pub(crate) cdb: [u8; MAX_CDB],
    pub(crate) cdb_len: u8,
    /// Transfer direction recorded at submission; validated against the
    /// phase the target actually enters.
    pub dir: DataDir,
    pub(crate) buf: DataBuf,
    pub(crate) inline: [u8; INLINE_BUF],
    pub(crate) cur: DataPtr,
    pub(crate) saved: DataPtr,
    pub(crate) flags: CmdFlags,
    pub(crate) place: CmdPlace,
    /// Retries consumed against the budget.
    pub(crate) retries: u8,
    /// Selection attempts that lost arbitration or found the HBA busy.
    pub(crate) sel_retries: u8,
    /// Ticks left before the supervisor forces recovery.
    pub(crate) deadline: u32,
    pub(crate) errors: CmdError,
    pub(crate) status: Option<ScsiStatus>,
    pub(crate) sense: Option<SenseData>,
    /// Message-out kinds waiting to be sent for this command.
    pub(crate) msg_pending: OutMsgSet,
    /// For autosense: the command whose sense this one fetches.
    pub(crate) sense_for: Option<CmdId>,
}

impl Command {
    /// Creates a command for the given nexus and CDB.
    ///
    /// # Panics
    ///
    /// Panics if `cdb` is empty or longer than [`MAX_CDB`].
    #[must_use]
    pub fn new(target: u8, lun: u8, cdb: &[u8], dir: DataDir, buf: Option<DataRegion>) -> Self {
        assert!(!cdb.is_empty() && cdb.len() <= MAX_CDB);
        let mut bytes = [0u8; MAX_CDB];
        bytes[..cdb.len()].copy_from_slice(cdb);
        let len = buf.map_or(0, |r| r.len);
        Self {
            target,
            lun,
            tag: None,
            tag_kind: TagKind::Simple,
            cdb: bytes,
            cdb_len: cdb.len() as u8,
            dir,
            buf: buf.map_or(DataBuf::None, DataBuf::Region),
            inline: [0; INLINE_BUF],
            cur: DataPtr {
                offset: 0,
                remaining: len,
            },
            saved: DataPtr {
                offset: 0,
                remaining: len,
            },
            flags: CmdFlags::empty(),
            place: CmdPlace::Detached,
            retries: 0,
            sel_retries: 0,
            deadline: 0,
            errors: CmdError::empty(),
            status: None,
            sense: None,
            msg_pending: OutMsgSet::empty(),
            sense_for: None,
        }
    }

    /// Internal engine command with an inline data buffer of `len` bytes.
    pub(crate) fn internal(target: u8, lun: u8, cdb: &[u8], dir: DataDir, len: u32) -> Self {
        let mut cmd = Self::new(target, lun, cdb, dir, None);
        cmd.flags = CmdFlags::INTERNAL | CmdFlags::URGENT | CmdFlags::SILENT;
        cmd.buf = if len == 0 { DataBuf::None } else { DataBuf::Inline };
        cmd.cur.remaining = len;
        cmd.saved.remaining = len;
        cmd
    }

    /// Marks the command urgent (head of the start queue).
    #[must_use]
    pub fn urgent(mut self) -> Self {
        self.flags |= CmdFlags::URGENT;
        self
    }

    /// Disables retries; the first failure completes the command.
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.flags |= CmdFlags::NO_RETRY;
        self
    }

    /// Requests an ordered or head-of-queue tag instead of simple.
    #[must_use]
    pub fn tag_kind(mut self, kind: TagKind) -> Self {
        self.tag_kind = kind;
        self
    }

    /// The queue tag, once allocated.
    #[must_use]
    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    /// Accumulated error set.
    #[must_use]
    pub fn errors(&self) -> CmdError {
        self.errors
    }

    /// Final (or most recent) SCSI status byte.
    #[must_use]
    pub fn status(&self) -> Option<ScsiStatus> {
        self.status
    }

    /// Sense data, when autosense ran.
    #[must_use]
    pub fn sense(&self) -> Option<&SenseData> {
        self.sense.as_ref()
    }

    /// Bytes left untransferred (the residual).
    #[must_use]
    pub fn residual(&self) -> u32 {
        self.cur.remaining
    }

    /// True once the command completed without anything to report.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && matches!(self.status, Some(ScsiStatus::Good))
    }

    /// The CDB bytes.
    #[must_use]
    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    /// Charges an error to the command.
    pub(crate) fn fail(&mut self, err: CmdError) {
        self.errors |= err;
    }

    /// Resets per-attempt state before a retry leaves the completion path.
    pub(crate) fn rewind_for_retry(&mut self) {
        self.tag = None;
        self.status = None;
        self.cur = DataPtr {
            offset: 0,
            remaining: self.saved.remaining + self.saved.offset,
        };
        self.saved = self.cur;
        self.msg_pending = OutMsgSet::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Command {
        Command::new(
            2,
            0,
            &[0x28, 0, 0, 0, 0, 8, 0, 0, 16, 0],
            DataDir::In,
            Some(DataRegion {
                addr: 0x1000,
                len: 8192,
            }),
        )
    }

    #[test]
    fn new_command_is_detached_and_untagged() {
        let c = cmd();
        assert_eq!(c.place, CmdPlace::Detached);
        assert_eq!(c.tag(), None);
        assert_eq!(c.residual(), 8192);
        assert!(c.errors().is_empty());
    }

    #[test]
    fn pointer_advance_and_rewind() {
        let mut p = DataPtr {
            offset: 0,
            remaining: 100,
        };
        p.advance(60);
        assert_eq!((p.offset, p.remaining), (60, 40));
        p.rewind(1);
        assert_eq!((p.offset, p.remaining), (59, 41));
        // Advancing past the end saturates.
        p.advance(1000);
        assert_eq!((p.offset, p.remaining), (100, 0));
        // Rewinding past the start saturates.
        p.rewind(1000);
        assert_eq!((p.offset, p.remaining), (0, 100));
    }

    #[test]
    fn retry_rewind_restores_full_transfer() {
        let mut c = cmd();
        c.tag = Some(3);
        c.cur.advance(4096);
        c.saved = c.cur;
        c.status = Some(ScsiStatus::Busy);
        c.rewind_for_retry();
        assert_eq!(c.tag(), None);
        assert_eq!(c.status(), None);
        assert_eq!(c.residual(), 8192);
        assert_eq!(c.cur.offset, 0);
    }

    #[test]
    fn builder_flags() {
        let c = cmd().urgent().no_retry();
        assert!(c.flags.contains(CmdFlags::URGENT | CmdFlags::NO_RETRY));
        let i = Command::internal(1, 0, &crate::cdb::inquiry(), DataDir::In, 36);
        assert!(i.flags.contains(CmdFlags::INTERNAL | CmdFlags::SILENT));
        assert_eq!(i.buf, DataBuf::Inline);
    }
}
