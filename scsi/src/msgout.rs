//! Message-out composition.
//!
//! A priority-ordered set of pending message kinds is drained one kind
//! per message-out opportunity. The composer remembers the exact bytes of
//! the last message sent: if the target re-enters message-out without an
//! intervening ATN release, the same bytes go out again, verbatim. A sent
//! kind is cleared from its pending set exactly once; a MESSAGE REJECT
//! routes to the kind's error handler instead.

use bitflags::bitflags;

use crate::command::{CmdFlags, TagKind};
use crate::device::{LunCaps, NegoPhase, SetupMsgs};
use crate::engine::{Engine, FreeCause, NexusState};
use crate::error::CmdError;
use crate::hba::{HbaDriver, Submitter, SyncParams};
use crate::msg;

bitflags! {
    /// Pending message-out kinds. Bit order is priority order: the
    /// lowest set bit is composed first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutMsgSet: u16 {
        /// BUS DEVICE RESET.
        const BUS_DEVICE_RESET = 1 << 0;
        /// MESSAGE REJECT.
        const REJECT = 1 << 1;
        /// MESSAGE PARITY ERROR (ask the target to resend).
        const PARITY = 1 << 2;
        /// IDENTIFY.
        const IDENTIFY = 1 << 3;
        /// ABORT.
        const ABORT = 1 << 4;
        /// ABORT TAG.
        const ABORT_TAG = 1 << 5;
        /// CLEAR QUEUE.
        const CLEAR_QUEUE = 1 << 6;
        /// TERMINATE I/O PROCESS.
        const TERMINATE = 1 << 7;
        /// SIMPLE/ORDERED/HEAD queue tag.
        const QUEUE_TAG = 1 << 8;
        /// Wide negotiation.
        const WDTR = 1 << 9;
        /// Synchronous negotiation.
        const SDTR = 1 << 10;
        /// NO OPERATION.
        const NOOP = 1 << 11;
    }
}

impl OutMsgSet {
    /// The highest-priority (lowest bit) pending kind.
    #[must_use]
    pub fn first(self) -> Option<OutMsgSet> {
        if self.is_empty() {
            return None;
        }
        let bit = self.bits() & self.bits().wrapping_neg();
        Some(Self::from_bits_retain(bit))
    }
}

/// Composer state carried by the engine.
#[derive(Debug)]
pub(crate) struct MsgOutState {
    /// Bus-level pending kinds not tied to a command (reject, parity,
    /// reset, a reselection-phase abort-tag).
    pub bus_pending: OutMsgSet,
    /// The kind most recently sent; consulted by MESSAGE REJECT.
    pub last_kind: Option<OutMsgSet>,
    pub last_bytes: [u8; 8],
    pub last_len: u8,
    /// Set after a send; a message-out re-entry while armed replays the
    /// same bytes. Any other phase clears it (acceptance).
    pub resend_armed: bool,
}

impl MsgOutState {
    pub(crate) fn new() -> Self {
        Self {
            bus_pending: OutMsgSet::empty(),
            last_kind: None,
            last_bytes: [0; 8],
            last_len: 0,
            resend_armed: false,
        }
    }

    /// Records a send for reject lookup and verbatim replay.
    fn record(&mut self, kind: OutMsgSet, bytes: &[u8]) {
        self.last_kind = Some(kind);
        self.last_bytes[..bytes.len()].copy_from_slice(bytes);
        self.last_len = bytes.len() as u8;
        self.resend_armed = true;
    }

    /// Acceptance: the target moved on without asking again.
    pub(crate) fn accept(&mut self) {
        self.resend_armed = false;
    }
}

impl<H: HbaDriver, S: Submitter> Engine<H, S> {
    /// Services one message-out phase.
    pub(crate) fn handle_message_out(&mut self) {
        // Replay verbatim if the target asks again before accepting.
        if self.msgout.resend_armed && self.pending_msgs().is_empty() {
            let len = self.msgout.last_len as usize;
            let bytes = self.msgout.last_bytes;
            log::debug!("scsi: msgout replayed ({len} bytes)");
            self.hba.release_attention();
            self.hba.send_bytes(&bytes[..len]);
            return;
        }

        let Some(kind) = self.pending_msgs().first() else {
            // Target requested a message we do not owe it.
            self.hba.release_attention();
            self.hba.send_bytes(&[msg::M_NOOP]);
            self.msgout.record(OutMsgSet::NOOP, &[msg::M_NOOP]);
            return;
        };

        let mut bytes = [0u8; 8];
        let len = self.compose(kind, &mut bytes);
        self.clear_pending(kind);
        self.msgout.record(kind, &bytes[..len]);

        if self.pending_msgs().is_empty() {
            self.hba.release_attention();
        }
        self.hba.send_bytes(&bytes[..len]);
        self.after_send(kind);
    }

    /// The union of bus-level, command-level and target-setup kinds.
    fn pending_msgs(&self) -> OutMsgSet {
        let mut set = self.msgout.bus_pending;
        if let NexusState::Established { target, cmd, .. } = self.nexus {
            set |= self.cmd(cmd).msg_pending;
            if let Some(t) = self.target(target) {
                if t.setup.contains(SetupMsgs::WIDE) {
                    set |= OutMsgSet::WDTR;
                }
                if t.setup.contains(SetupMsgs::SYNC) {
                    set |= OutMsgSet::SDTR;
                }
            }
        }
        set
    }

    /// Removes `kind` from whichever set it is pending in.
    fn clear_pending(&mut self, kind: OutMsgSet) {
        self.msgout.bus_pending.remove(kind);
        if let NexusState::Established { target, cmd, .. } = self.nexus {
            self.cmd_mut(cmd).msg_pending.remove(kind);
            let t = self.target_mut(target);
            if kind == OutMsgSet::WDTR {
                t.setup.remove(SetupMsgs::WIDE);
            }
            if kind == OutMsgSet::SDTR {
                t.setup.remove(SetupMsgs::SYNC);
            }
        }
    }

    /// Builds the bytes for one kind; returns the length.
    fn compose(&mut self, kind: OutMsgSet, out: &mut [u8; 8]) -> usize {
        match kind {
            OutMsgSet::BUS_DEVICE_RESET => put1(out, msg::M_RESET),
            OutMsgSet::REJECT => put1(out, msg::M_REJECT),
            OutMsgSet::PARITY => put1(out, msg::M_PARITY),
            OutMsgSet::ABORT => put1(out, msg::M_ABORT),
            OutMsgSet::ABORT_TAG => put1(out, msg::M_ABORT_TAG),
            OutMsgSet::CLEAR_QUEUE => put1(out, msg::M_CLEAR_QUEUE),
            OutMsgSet::TERMINATE => put1(out, msg::M_TERMINATE),
            OutMsgSet::NOOP => put1(out, msg::M_NOOP),
            OutMsgSet::IDENTIFY => {
                let (target, lun, cmd) = self.established().expect("identify without nexus");
                // Probes and recovery commands run connected.
                let disc = self
                    .target(target)
                    .and_then(|t| t.luns.get(&lun))
                    .is_some_and(|l| l.caps.contains(LunCaps::DISCONNECT))
                    && !self
                        .cmd(cmd)
                        .flags
                        .intersects(CmdFlags::CA_RECOVERY | CmdFlags::INTERNAL);
                put1(out, msg::identify(lun, disc))
            }
            OutMsgSet::QUEUE_TAG => {
                let (_, _, cmd) = self.established().expect("tag without nexus");
                let c = self.cmd(cmd);
                let code = match c.tag_kind {
                    TagKind::Simple => msg::M_SIMPLE_TAG,
                    TagKind::Head => msg::M_HEAD_TAG,
                    TagKind::Ordered => msg::M_ORDERED_TAG,
                };
                let tag = c.tag.expect("queue tag message without a tag");
                out[0] = code;
                out[1] = tag;
                2
            }
            OutMsgSet::SDTR => {
                let (target, ..) = self.established().expect("sdtr without nexus");
                let t = self.target_mut(target);
                let (period, offset) = if t.nego == NegoPhase::SyncReply {
                    (t.reply_period, t.reply_offset)
                } else {
                    t.nego = NegoPhase::SyncSent;
                    (t.goal_period, t.goal_offset)
                };
                out[..5].copy_from_slice(&[msg::M_EXTENDED, 3, msg::MX_SYNC, period, offset]);
                5
            }
            OutMsgSet::WDTR => {
                let (target, ..) = self.established().expect("wdtr without nexus");
                let t = self.target_mut(target);
                let width = if t.nego == NegoPhase::WideReply {
                    t.reply_width
                } else {
                    t.nego = NegoPhase::WideSent;
                    t.goal_width
                };
                out[..4].copy_from_slice(&[msg::M_EXTENDED, 2, msg::MX_WIDE, width]);
                4
            }
            _ => put1(out, msg::M_NOOP),
        }
    }

    /// Post-send bookkeeping per kind.
    fn after_send(&mut self, kind: OutMsgSet) {
        match kind {
            OutMsgSet::ABORT
            | OutMsgSet::ABORT_TAG
            | OutMsgSet::CLEAR_QUEUE
            | OutMsgSet::BUS_DEVICE_RESET => {
                // The target answers these by going bus free. TERMINATE
                // is not among them: it answers with a status phase.
                self.expect_free = FreeCause::Abort;
            }
            OutMsgSet::SDTR => {
                if let NexusState::Established { target, .. } = self.nexus {
                    let t = self.target_mut(target);
                    if t.nego == NegoPhase::SyncReply {
                        // Our answer to a target-initiated exchange
                        // concludes it.
                        t.period = t.reply_period;
                        t.offset = t.reply_offset;
                        t.nego = NegoPhase::Idle;
                        self.notify_negotiation(target);
                    }
                }
            }
            OutMsgSet::WDTR => {
                if let NexusState::Established { target, .. } = self.nexus {
                    let t = self.target_mut(target);
                    if t.nego == NegoPhase::WideReply {
                        t.width = t.reply_width;
                        t.nego = NegoPhase::Idle;
                        self.notify_negotiation(target);
                    }
                }
            }
            _ => {}
        }
    }

    /// MESSAGE REJECT arrived: exactly one error handler for the kind
    /// that was outstanding; it must not remain pending.
    pub(crate) fn msg_rejected(&mut self) {
        let Some(kind) = self.msgout.last_kind.take() else {
            log::warn!("scsi: MESSAGE REJECT with nothing outstanding");
            return;
        };
        self.msgout.resend_armed = false;

        match kind {
            OutMsgSet::SDTR => {
                if let NexusState::Established { target, .. } = self.nexus {
                    log::info!("scsi{target}: sync negotiation rejected, async");
                    let t = self.target_mut(target);
                    t.offset = 0;
                    t.period = 0;
                    t.nego = NegoPhase::Idle;
                    self.notify_negotiation(target);
                }
            }
            OutMsgSet::WDTR => {
                if let NexusState::Established { target, .. } = self.nexus {
                    log::info!("scsi{target}: wide negotiation rejected, 8-bit");
                    let t = self.target_mut(target);
                    t.width = 0;
                    t.nego = NegoPhase::Idle;
                    self.notify_negotiation(target);
                }
            }
            OutMsgSet::QUEUE_TAG => {
                // The device lied about tagged queuing; drop it and run
                // the command untagged.
                if let NexusState::Established { target, lun, cmd } = self.nexus {
                    log::warn!("scsi{target}:{lun}: queue tag rejected, tags disabled");
                    if let Some(tag) = self.cmd(cmd).tag {
                        let l = self.lun_mut(target, lun);
                        let _ = l.release_tag(tag);
                        l.caps.remove(LunCaps::TAGGED);
                        l.window = 1;
                        l.max_window = 1;
                        l.untagged_busy = true;
                        self.cmd_mut(cmd).tag = None;
                    }
                }
            }
            OutMsgSet::IDENTIFY => {
                // A target that rejects IDENTIFY cannot be spoken to.
                if let NexusState::Established { target, lun, cmd } = self.nexus {
                    log::error!("scsi{target}:{lun}: IDENTIFY rejected, aborting");
                    self.cmd_mut(cmd).fail(CmdError::ABORTED);
                    self.cmd_mut(cmd).msg_pending |= OutMsgSet::ABORT;
                    self.hba.assert_attention();
                }
            }
            _ => {
                log::debug!("scsi: reject of {kind:?} ignored");
            }
        }
    }

    /// Reports the agreed transfer mode upward.
    pub(crate) fn notify_negotiation(&mut self, target: u8) {
        let Some(t) = self.target(target) else { return };
        let sync = (t.offset > 0).then(|| SyncParams {
            period: t.period,
            offset: t.offset,
        });
        let wide = t.width;
        self.submitter.on_negotiation_result(target, sync, wide);
    }
}

fn put1(out: &mut [u8; 8], byte: u8) -> usize {
    out[0] = byte;
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_bit_order() {
        let set = OutMsgSet::SDTR | OutMsgSet::IDENTIFY | OutMsgSet::QUEUE_TAG;
        assert_eq!(set.first(), Some(OutMsgSet::IDENTIFY));
        let set = OutMsgSet::NOOP | OutMsgSet::REJECT;
        assert_eq!(set.first(), Some(OutMsgSet::REJECT));
        assert_eq!(OutMsgSet::empty().first(), None);
    }

    #[test]
    fn reset_outranks_everything() {
        let all = OutMsgSet::all();
        assert_eq!(all.first(), Some(OutMsgSet::BUS_DEVICE_RESET));
    }

    #[test]
    fn record_and_accept_cycle() {
        let mut st = MsgOutState::new();
        st.record(OutMsgSet::SDTR, &[1, 3, 1, 25, 8]);
        assert!(st.resend_armed);
        assert_eq!(st.last_len, 5);
        st.accept();
        assert!(!st.resend_armed);
        // Reject lookup still knows the kind after acceptance.
        assert_eq!(st.last_kind, Some(OutMsgSet::SDTR));
    }
}
