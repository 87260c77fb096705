//! Message-in accumulation and dispatch.
//!
//! Bytes arrive one at a time; they are collected in the owning target's
//! message buffer until the length table says the message is complete,
//! then parsed and dispatched. Unknown messages are answered with
//! MESSAGE REJECT under ATN.

use crate::command::{CmdFlags, CmdPlace};
use crate::device::{LunCaps, NegoPhase, SetupMsgs};
use crate::engine::{Engine, FreeCause, NexusState};
use crate::error::CmdError;
use crate::hba::{HbaDriver, Submitter};
use crate::msg::{self, ParsedMsg};
use crate::msgout::OutMsgSet;

impl<H: HbaDriver, S: Submitter> Engine<H, S> {
    /// Services one message-in phase, draining all bytes the target has.
    pub(crate) fn handle_message_in(&mut self) {
        let Some(target) = self.msg_target() else {
            // Message-in with no nexus of any kind: drain and drop.
            let mut junk = [0u8; 1];
            while self.hba.recv_bytes(&mut junk) == 1 {}
            log::warn!("scsi: message-in without a nexus, discarded");
            return;
        };

        let mut byte = [0u8; 1];
        while self.hba.recv_bytes(&mut byte) == 1 {
            // Bytes past the buffer are counted but not stored; the
            // length is always derivable from the stored prefix.
            let complete = {
                let t = self.target_mut(target);
                let len = t.msglen as usize;
                if len < t.msgbuf.len() {
                    t.msgbuf[len] = byte[0];
                }
                t.msglen += 1;
                let counted = t.msglen as usize;
                let stored = counted.min(t.msgbuf.len());
                msg::expected_len(&t.msgbuf[..stored]) == Some(counted)
            };
            if complete {
                let (buf, counted) = {
                    let t = self.target_mut(target);
                    let b = t.msgbuf;
                    let c = t.msglen as usize;
                    t.msglen = 0;
                    (b, c)
                };
                if counted > buf.len() {
                    log::warn!("scsi{target}: {counted}-byte message too long, rejecting");
                    self.msgout.bus_pending |= OutMsgSet::REJECT;
                    self.hba.assert_attention();
                } else {
                    self.dispatch_msg(target, msg::parse(&buf[..counted]));
                }
                // A handler may have torn the nexus down; stop draining
                // bytes that no longer belong to this connection.
                if self.msg_target() != Some(target) {
                    break;
                }
            }
        }
    }

    /// The target a message-in belongs to, established or reselecting.
    pub(crate) fn msg_target(&self) -> Option<u8> {
        match self.nexus {
            NexusState::Established { target, .. } | NexusState::Reselecting { target, .. } => {
                Some(target)
            }
            NexusState::Idle => None,
        }
    }

    fn dispatch_msg(&mut self, target: u8, parsed: ParsedMsg) {
        match parsed {
            ParsedMsg::CommandComplete => self.expect_free = FreeCause::Complete,
            ParsedMsg::Disconnect => self.expect_free = FreeCause::Disconnect,
            ParsedMsg::LinkedComplete => self.linked_continue(),
            ParsedMsg::SaveDataPointer => {
                if let Some((.., id)) = self.established() {
                    let c = self.cmd_mut(id);
                    c.saved = c.cur;
                }
            }
            ParsedMsg::RestorePointers => {
                if let Some((.., id)) = self.established() {
                    let c = self.cmd_mut(id);
                    c.cur = c.saved;
                }
            }
            ParsedMsg::MessageReject => self.msg_rejected(),
            ParsedMsg::NoOp => {}
            ParsedMsg::MessageParityError => {
                // The target mangled our last message; re-arm the
                // composer so the next message-out replays it verbatim.
                log::debug!("scsi{target}: message parity reported, will replay");
                self.msgout.resend_armed = true;
                self.hba.assert_attention();
            }
            ParsedMsg::Identify { lun } => self.msgin_identify(target, lun),
            ParsedMsg::QueueTag { tag } => self.msgin_queue_tag(target, tag),
            ParsedMsg::Sdtr { period, offset } => self.msgin_sdtr(target, period, offset),
            ParsedMsg::Wdtr { width } => self.msgin_wdtr(target, width),
            ParsedMsg::IgnoreWideResidue { residue } => {
                if let Some((.., id)) = self.established() {
                    self.cmd_mut(id).cur.rewind(u32::from(residue));
                }
            }
            ParsedMsg::ModifyDataPointer { delta } => {
                if let Some((.., id)) = self.established() {
                    let c = self.cmd_mut(id);
                    if delta >= 0 {
                        c.cur.advance(delta as u32);
                    } else {
                        c.cur.rewind(delta.unsigned_abs());
                    }
                }
            }
            ParsedMsg::Unsupported(code) => {
                log::debug!("scsi{target}: unsupported message {code:#04x}, rejecting");
                self.msgout.bus_pending |= OutMsgSet::REJECT;
                self.hba.assert_attention();
            }
        }
    }

    /// IDENTIFY from the target: names the LUN of a reselection, or
    /// re-asserts the LUN of the live nexus.
    fn msgin_identify(&mut self, target: u8, lun: u8) {
        match self.nexus {
            NexusState::Reselecting { lun: None, .. } => {
                let has_work = self
                    .lun(target, lun)
                    .is_some_and(|l| !l.disc_queue.is_empty());
                if !has_work {
                    // Reselected for a nexus we do not have.
                    log::error!("scsi{target}:{lun}: reselection with no disconnected work");
                    self.msgout.bus_pending |= OutMsgSet::ABORT;
                    self.hba.assert_attention();
                    return;
                }
                self.nexus = NexusState::Reselecting {
                    target,
                    lun: Some(lun),
                };
                // An untagged nexus is fully named by IDENTIFY alone.
                let untagged = self
                    .lun(target, lun)
                    .and_then(|l| {
                        l.disc_queue
                            .iter()
                            .copied()
                            .find(|&id| self.cmd(id).tag.is_none())
                    });
                if let Some(id) = untagged {
                    self.reestablish(target, lun, id);
                }
            }
            NexusState::Established { lun: cur, .. } => {
                if cur != lun {
                    log::error!("scsi{target}: IDENTIFY names LUN {lun} mid-nexus (have {cur})");
                    self.fail_active(CmdError::PROTO_FATAL);
                }
            }
            _ => {
                log::warn!("scsi{target}: stray IDENTIFY ignored");
            }
        }
    }

    /// Queue tag after a reselection IDENTIFY: completes the nexus.
    fn msgin_queue_tag(&mut self, target: u8, tag: u8) {
        match self.nexus {
            NexusState::Reselecting {
                lun: Some(lun), ..
            } => {
                let found = self.lun(target, lun).and_then(|l| {
                    l.disc_queue
                        .iter()
                        .copied()
                        .find(|&id| self.cmd(id).tag == Some(tag))
                });
                if let Some(id) = found {
                    self.reestablish(target, lun, id);
                } else {
                    // Unknown tag: kill that task, keep the rest of the
                    // LUN's queue intact.
                    log::error!("scsi{target}:{lun}: reselection with unknown tag {tag}");
                    self.msgout.bus_pending |= OutMsgSet::ABORT_TAG;
                    self.hba.assert_attention();
                }
            }
            NexusState::Established { cmd, .. } => {
                if self.cmd(cmd).tag != Some(tag) {
                    log::error!("scsi{target}: tag {tag} does not match the live nexus");
                    self.fail_active(CmdError::PROTO_FATAL);
                }
            }
            _ => {
                log::warn!("scsi{target}: queue tag before IDENTIFY, rejecting");
                self.msgout.bus_pending |= OutMsgSet::REJECT;
                self.hba.assert_attention();
            }
        }
    }

    /// SDTR from the target: either the answer to our request or a
    /// target-initiated exchange we must answer.
    fn msgin_sdtr(&mut self, target: u8, period: u8, offset: u8) {
        let cfg = self.config;
        let t = self.target_mut(target);
        if t.nego == NegoPhase::SyncSent {
            // Their answer; clamp to what we asked for.
            let off = offset.min(t.goal_offset);
            let per = period.max(t.goal_period);
            if offset == 0 {
                log::info!("scsi{target}: target declined sync, running async");
            }
            t.offset = if off > 0 && per > 0 { off } else { 0 };
            t.period = per;
            t.nego = NegoPhase::Idle;
            self.notify_negotiation(target);
        } else {
            // Target-initiated; clamp to our limits and answer.
            let off = offset.min(cfg.max_offset);
            let per = period.max(cfg.min_period);
            t.reply_period = per;
            t.reply_offset = off;
            t.nego = NegoPhase::SyncReply;
            t.setup.remove(SetupMsgs::SYNC);
            self.msgout.bus_pending |= OutMsgSet::SDTR;
            self.hba.assert_attention();
        }
    }

    /// WDTR, same shape as SDTR.
    fn msgin_wdtr(&mut self, target: u8, width: u8) {
        let cfg = self.config;
        let t = self.target_mut(target);
        if t.nego == NegoPhase::WideSent {
            t.width = width.min(t.goal_width);
            t.nego = NegoPhase::Idle;
            self.notify_negotiation(target);
        } else {
            t.reply_width = width.min(cfg.max_wide);
            t.nego = NegoPhase::WideReply;
            t.setup.remove(SetupMsgs::WIDE);
            self.msgout.bus_pending |= OutMsgSet::WDTR;
            self.hba.assert_attention();
        }
    }

    /// Charges a protocol error to the active command and forces a
    /// bus-reset recovery cycle.
    ///
    /// A target that violates the phase rules cannot be trusted to
    /// honor an abort message either; recovery completes the command
    /// and requeues everything else.
    pub(crate) fn fail_active(&mut self, err: CmdError) {
        let Some((.., id)) = self.established() else { return };
        self.cmd_mut(id).fail(err);
        self.bus_reset_recovery();
    }

    /// LINKED COMMAND COMPLETE: deliver the finished command and put its
    /// successor on the same nexus without an intervening selection.
    fn linked_continue(&mut self) {
        let Some((target, lun, id)) = self.established() else { return };
        // A leftover on the current pointer means the chain's data
        // pointers are out of step with the target.
        let aligned = self.cmd(id).cur.remaining == 0;
        self.detach_active(id);
        self.finish(id);

        // The link only holds on a LUN that declared the capability,
        // with matched pointers and nothing needing renegotiation.
        let clean = aligned
            && self
                .lun(target, lun)
                .is_some_and(|l| l.caps.contains(LunCaps::LINKED))
            && self
                .target(target)
                .is_none_or(|t| t.setup.is_empty() && t.nego == NegoPhase::Idle);
        let next = self.start_queue.iter().find(|&nid| {
            let c = self.cmd(nid);
            c.target == target && c.lun == lun && !c.flags.contains(CmdFlags::INTERNAL)
        });

        match next {
            Some(nid) if clean => {
                self.start_queue.take(nid);
                self.lun_mut(target, lun).untagged_busy = true;
                self.cmd_mut(nid).place = CmdPlace::Active;
                self.nexus = NexusState::Established {
                    target,
                    lun,
                    cmd: nid,
                };
                self.expect_free = FreeCause::Unexpected;
            }
            _ => {
                // Nothing to link to (or state drifted): break the chain.
                // The abort rides on bus-level pending since the finished
                // command is already delivered.
                log::warn!("scsi{target}:{lun}: linked command with no successor, aborting link");
                self.msgout.bus_pending |= OutMsgSet::ABORT;
                self.hba.assert_attention();
            }
        }
    }
}
