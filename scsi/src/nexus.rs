//! Phase-by-phase nexus servicing.
//!
//! The adapter reports phase changes, reselections and bus free; this
//! module walks the active command through them. Phase mismatches charge
//! `PROTO_FATAL` and abort the task rather than guessing.

use crate::command::DataBuf;
use crate::device::NegoPhase;
use crate::engine::{Engine, FreeCause, NexusState};
use crate::error::{CmdError, ScsiStatus};
use crate::hba::{BusEvent, BusPhase, DataDir, HbaDriver, Submitter};
use crate::msgout::OutMsgSet;

impl<H: HbaDriver, S: Submitter> Engine<H, S> {
    /// Entry point for one adapter event.
    pub fn on_event(&mut self, ev: BusEvent) {
        match ev {
            BusEvent::PhaseChange => {
                let phase = self.hba.current_phase();
                self.handle_phase(phase);
            }
            BusEvent::Reselected { target } => self.handle_reselected(target),
            BusEvent::ParityError { phase } => self.handle_parity(phase),
            BusEvent::BusFree => self.handle_bus_free(),
        }
    }

    /// Adapter-latched parity error on a received byte.
    fn handle_parity(&mut self, phase: BusPhase) {
        if phase == BusPhase::MessageIn {
            // Drop the partial message and ask the target to resend it.
            if let Some(target) = self.msg_target() {
                self.target_mut(target).msglen = 0;
            }
            self.msgout.bus_pending |= OutMsgSet::PARITY;
            self.hba.assert_attention();
            return;
        }
        // A corrupt data or status byte ends the transaction; the
        // classifier retries the command on a fresh connection.
        if let Some((.., id)) = self.established() {
            log::warn!("scsi: parity error in {phase:?}, aborting the transaction");
            let tagged = self.cmd(id).tag.is_some();
            let c = self.cmd_mut(id);
            c.fail(CmdError::PARITY);
            c.msg_pending |= if tagged {
                OutMsgSet::ABORT_TAG
            } else {
                OutMsgSet::ABORT
            };
            self.hba.assert_attention();
        }
    }

    fn handle_phase(&mut self, phase: BusPhase) {
        self.phases_seen = true;
        if phase != BusPhase::MessageOut {
            // Target moved on; the last message-out was accepted.
            self.msgout.accept();
        }
        match phase {
            BusPhase::CommandOut => self.handle_command_phase(),
            BusPhase::DataIn | BusPhase::DataOut => self.handle_data_phase(phase),
            BusPhase::StatusIn => self.handle_status_phase(),
            BusPhase::MessageOut => self.handle_message_out(),
            BusPhase::MessageIn => self.handle_message_in(),
            BusPhase::BusFree => self.handle_bus_free(),
        }
    }

    /// Command phase: ship the CDB.
    fn handle_command_phase(&mut self) {
        let Some((target, _, id)) = self.established() else {
            log::error!("scsi: command phase without an established nexus");
            self.bus_reset_recovery();
            return;
        };

        // Entering command phase with a negotiation still unanswered
        // means the target ignored it; fall back to defaults.
        let t = self.target_mut(target);
        match t.nego {
            NegoPhase::SyncSent => {
                log::info!("scsi{target}: sync negotiation ignored, running async");
                t.offset = 0;
                t.period = 0;
                t.nego = NegoPhase::Idle;
                self.notify_negotiation(target);
            }
            NegoPhase::WideSent => {
                log::info!("scsi{target}: wide negotiation ignored, staying narrow");
                t.width = 0;
                t.nego = NegoPhase::Idle;
                self.notify_negotiation(target);
            }
            _ => {}
        }

        let (cdb, len) = {
            let c = self.cmd(id);
            (c.cdb, c.cdb_len as usize)
        };
        self.hba.send_bytes(&cdb[..len]);
    }

    /// Data phase: validate direction, run the current pointer.
    fn handle_data_phase(&mut self, phase: BusPhase) {
        let Some((.., id)) = self.established() else {
            log::error!("scsi: data phase without an established nexus");
            self.bus_reset_recovery();
            return;
        };
        let dir = match phase {
            BusPhase::DataIn => DataDir::In,
            _ => DataDir::Out,
        };
        if self.cmd(id).dir != dir {
            log::error!("scsi: data phase direction mismatch, aborting task");
            self.fail_active(CmdError::PROTO_FATAL);
            return;
        }
        if self.cmd(id).cur.remaining == 0 {
            // Target wants more than the command supplied.
            log::error!("scsi: target overran the data buffer, aborting task");
            self.cmd_mut(id).fail(CmdError::DATA_OVERRUN);
            self.fail_active(CmdError::PROTO_FATAL);
            return;
        }

        let (buf, cur) = {
            let c = self.cmd(id);
            (c.buf, c.cur)
        };
        let moved = match buf {
            DataBuf::Region(region) => {
                self.hba.data_transfer(dir, region, cur.offset, cur.remaining)
            }
            DataBuf::Inline => {
                let start = cur.offset as usize;
                let end = (start + cur.remaining as usize).min(crate::command::INLINE_BUF);
                if dir == DataDir::In {
                    let mut tmp = [0u8; crate::command::INLINE_BUF];
                    let got = self.hba.recv_bytes(&mut tmp[..end - start]);
                    self.cmd_mut(id).inline[start..start + got].copy_from_slice(&tmp[..got]);
                    got as u32
                } else {
                    let bytes = self.cmd(id).inline;
                    self.hba.send_bytes(&bytes[start..end]) as u32
                }
            }
            DataBuf::None => {
                log::error!("scsi: data phase for a command with no buffer");
                self.cmd_mut(id).fail(CmdError::DATA_OVERRUN);
                self.fail_active(CmdError::PROTO_FATAL);
                return;
            }
        };
        self.cmd_mut(id).cur.advance(moved);
    }

    /// Status phase: one byte, folded into the command record.
    fn handle_status_phase(&mut self) {
        let Some((target, lun, id)) = self.established() else {
            log::error!("scsi: status phase without an established nexus");
            self.bus_reset_recovery();
            return;
        };
        let mut byte = [0u8; 1];
        if self.hba.recv_bytes(&mut byte) != 1 {
            return;
        }
        let status = ScsiStatus::from_byte(byte[0]);
        self.cmd_mut(id).status = Some(status);
        match status {
            ScsiStatus::Good
            | ScsiStatus::ConditionMet
            | ScsiStatus::Intermediate
            | ScsiStatus::IntermediateConditionMet => {}
            ScsiStatus::CheckCondition => self.cmd_mut(id).fail(CmdError::CHECK_CONDITION),
            ScsiStatus::Busy => self.cmd_mut(id).fail(CmdError::BUSY_STATUS),
            ScsiStatus::QueueFull => {
                self.cmd_mut(id).fail(CmdError::QUEUE_FULL);
                // The window shrinks to what the target actually accepted
                // right now, not at requeue time.
                let l = self.lun_mut(target, lun);
                l.shrink_window();
                log::info!("scsi{target}:{lun}: queue full, window now {}", l.window);
            }
            ScsiStatus::CommandTerminated => self.cmd_mut(id).fail(CmdError::ABORTED),
            // Reservation conflicts and unknown codes surface through the
            // recorded status alone.
            ScsiStatus::ReservationConflict | ScsiStatus::Unknown(_) => {
                log::warn!("scsi{target}:{lun}: status {status:?}");
            }
        }
    }

    /// Bus free: routed by the cause the message handlers recorded.
    pub(crate) fn handle_bus_free(&mut self) {
        let cause = self.expect_free;
        self.expect_free = FreeCause::Unexpected;

        match (cause, self.nexus) {
            (FreeCause::Complete, NexusState::Established { cmd, .. }) => {
                self.detach_active(cmd);
                self.finish(cmd);
            }
            (FreeCause::Disconnect, NexusState::Established { cmd, .. }) => {
                self.move_to_disconnect_queue(cmd);
                self.nexus = NexusState::Idle;
            }
            (FreeCause::Abort, NexusState::Established { cmd, .. }) => {
                // The error that caused the abort is already charged.
                self.detach_active(cmd);
                if self.cmd(cmd).errors.is_empty() {
                    self.cmd_mut(cmd).fail(CmdError::ABORTED);
                }
                self.finish(cmd);
            }
            (FreeCause::Unexpected, NexusState::Established { cmd, .. }) => {
                let err = if self.phases_seen {
                    CmdError::UNEXPECTED_BUS_FREE
                } else {
                    // Selection completed but the target never responded
                    // with a phase.
                    CmdError::SELECTION_TIMEOUT
                };
                self.detach_active(cmd);
                self.cmd_mut(cmd).fail(err);
                self.finish(cmd);
            }
            (_, NexusState::Reselecting { target, .. }) => {
                // An aborted or abandoned reselection simply ends.
                if cause == FreeCause::Unexpected {
                    log::warn!("scsi{target}: reselection dropped by the target");
                }
                self.nexus = NexusState::Idle;
            }
            (_, NexusState::Idle) => {}
        }
        self.kick();
    }

    /// Reselection: a disconnected target wants its nexus back.
    pub(crate) fn handle_reselected(&mut self, target: u8) {
        if let NexusState::Established { cmd, .. } = self.nexus {
            if self.phases_seen {
                // Reselected mid-transaction; nothing sane to do.
                log::error!("scsi{target}: reselected while a nexus is live");
                self.cmd_mut(cmd).fail(CmdError::PROTO_FATAL);
                self.bus_reset_recovery();
                return;
            }
            // Our selection lost to the reselecting target; the command
            // goes back to the head of the start queue unharmed.
            self.revoke_to_start_queue(cmd);
        }

        let has_work = self.target(target).is_some_and(|t| t.disc_count > 0);
        if !has_work {
            log::error!("scsi{target}: reselected with nothing disconnected, resetting");
            self.bus_reset_recovery();
            return;
        }
        self.stats.reselections += 1;
        self.phases_seen = true;
        self.expect_free = FreeCause::Unexpected;
        self.nexus = NexusState::Reselecting { target, lun: None };
    }
}

