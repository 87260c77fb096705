//! The bus engine: command arena, scheduling, supervision and recovery.
//!
//! One [`Engine`] exists per physical bus. It owns every command from
//! submission to completion, the per-target/per-LUN state arena, and the
//! single nexus. All entry points run to completion without blocking; the
//! host guarantees non-reentrant dispatch (see the crate docs).

use alloc::vec::Vec;

use crate::cdb;
use crate::command::{CmdFlags, CmdId, Command, CmdPlace, SenseData};
use crate::device::{
    Discovery, LunCaps, LunState, Quirks, SetupMsgs, TargetState, MAX_LUN, MAX_TAGS, MAX_TARGET,
    quirk_lookup,
};
use crate::error::{classify, CmdError, Disposition, ScsiStatus, SubmitError};
use crate::hba::{DataDir, HbaDriver, SelectOutcome, Submitter};
use crate::msgout::{MsgOutState, OutMsgSet};
use crate::queue::{eligible, StartQueue};

use bitflags::bitflags;

/// Adapter policy knobs, fixed at engine construction.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Our own SCSI id; never a valid command target.
    pub host_id: u8,
    /// Fastest synchronous period factor we accept.
    pub min_period: u8,
    /// Largest REQ/ACK offset we accept; 0 disables sync negotiation.
    pub max_offset: u8,
    /// Largest width exponent we accept; 0 keeps the bus narrow.
    pub max_wide: u8,
    /// Tag window ceiling per LUN.
    pub max_tags: u8,
    /// Grant disconnect privilege in IDENTIFY.
    pub allow_disconnect: bool,
    /// Use tagged queuing on devices that support it.
    pub allow_tags: bool,
    /// Retries charged before a transient error becomes final.
    pub retry_budget: u8,
    /// Ticks a command may stay outstanding before recovery.
    pub deadline_ticks: u32,
    /// Ticks to hold off selection after losing arbitration.
    pub select_backoff_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_id: 7,
            min_period: 25,
            max_offset: 8,
            max_wide: 1,
            max_tags: 4,
            allow_disconnect: true,
            allow_tags: true,
            retry_budget: 3,
            deadline_ticks: 100,
            select_backoff_ticks: 2,
        }
    }
}

bitflags! {
    /// Engine operating flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineFlags: u8 {
        /// Shut down; submissions are refused.
        const INACTIVE = 1 << 0;
        /// Bus-reset recovery in progress.
        const INITIALIZING = 1 << 1;
        /// Power-suspended; nothing is started.
        const SUSPENDED = 1 << 2;
    }
}

/// Event counters, exported for telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Selections attempted.
    pub selections: u64,
    /// Selections that lost arbitration or found the adapter busy.
    pub selections_lost: u64,
    /// Reselections accepted.
    pub reselections: u64,
    /// Disconnects taken.
    pub disconnects: u64,
    /// Commands delivered to the submitter.
    pub completions: u64,
    /// Retries of any flavor.
    pub retries: u64,
    /// Supervisor-forced bus resets.
    pub bus_resets: u64,
    /// Deadline expiries.
    pub timeouts: u64,
}

/// The engine's single nexus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NexusState {
    /// Bus free, nothing established.
    Idle,
    /// Full (target, LUN, command) triple owns the bus.
    Established { target: u8, lun: u8, cmd: CmdId },
    /// A target reselected us; waiting for IDENTIFY (and tag).
    Reselecting { target: u8, lun: Option<u8> },
}

/// Why the next bus-free is expected, set by message handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeCause {
    /// No reason on file; bus free now is an error.
    Unexpected,
    /// DISCONNECT message received.
    Disconnect,
    /// COMMAND COMPLETE received.
    Complete,
    /// We asserted an abort-class message.
    Abort,
}

/// Outcome of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The command was still queued and has been completed.
    Dequeued,
    /// An abort message is pending; completion arrives asynchronously.
    MessagePending,
}

/// Scope of a reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Hard-reset the whole bus and recover every queue.
    Bus,
    /// Reset one target (BUS DEVICE RESET) and fail its commands.
    Target(u8),
    /// Clear one LUN's task set (CLEAR QUEUE) and fail its commands.
    Lun(u8, u8),
}

/// The protocol engine for one parallel SCSI bus.
pub struct Engine<H: HbaDriver, S: Submitter> {
    pub(crate) hba: H,
    pub(crate) submitter: S,
    pub(crate) config: EngineConfig,
    cmds: Vec<Option<Command>>,
    free: Vec<u32>,
    pub(crate) start_queue: StartQueue,
    targets: Vec<Option<TargetState>>,
    pub(crate) nexus: NexusState,
    pub(crate) expect_free: FreeCause,
    pub(crate) msgout: MsgOutState,
    /// Global disconnected-command counter (shadow of the queues).
    pub(crate) disc_count: u32,
    /// Commands owned by the engine right now.
    pub(crate) inflight: u32,
    pub(crate) flags: EngineFlags,
    /// Selection-retry backoff, decremented by `tick`.
    pub(crate) sel_backoff: u32,
    /// Any phase observed since the last selection; distinguishes a
    /// selection timeout from an unexpected bus free.
    pub(crate) phases_seen: bool,
    pub(crate) stats: Stats,
}

impl<H: HbaDriver, S: Submitter> Engine<H, S> {
    /// Creates an engine over the given adapter and submitter.
    pub fn new(hba: H, submitter: S, config: EngineConfig) -> Self {
        let mut targets = Vec::new();
        targets.resize_with(MAX_TARGET as usize, || None);
        Self {
            hba,
            submitter,
            config,
            cmds: Vec::new(),
            free: Vec::new(),
            start_queue: StartQueue::new(),
            targets,
            nexus: NexusState::Idle,
            expect_free: FreeCause::Unexpected,
            msgout: MsgOutState::new(),
            disc_count: 0,
            inflight: 0,
            flags: EngineFlags::empty(),
            sel_backoff: 0,
            phases_seen: false,
            stats: Stats::default(),
        }
    }

    /// Event counters.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Stops accepting work. Outstanding commands still complete.
    pub fn shutdown(&mut self) {
        self.flags |= EngineFlags::INACTIVE;
    }

    /// Suspends selection; queued work stays queued.
    pub fn suspend(&mut self) {
        self.flags |= EngineFlags::SUSPENDED;
    }

    /// Resumes after [`suspend`](Self::suspend).
    pub fn resume(&mut self) {
        self.flags.remove(EngineFlags::SUSPENDED);
        self.kick();
    }

    // ── Submission surface ──────────────────────────────────────────────

    /// Accepts a command for execution.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Inactive`] when the adapter is shut down,
    /// [`SubmitError::BadAddress`] for an unaddressable target/LUN.
    /// No partial mutation on failure.
    pub fn submit(&mut self, mut cmd: Command) -> Result<CmdId, SubmitError> {
        if self.flags.contains(EngineFlags::INACTIVE) {
            return Err(SubmitError::Inactive);
        }
        if cmd.target >= MAX_TARGET || cmd.target == self.config.host_id || cmd.lun >= MAX_LUN {
            return Err(SubmitError::BadAddress);
        }
        cmd.deadline = self.config.deadline_ticks;
        cmd.place = CmdPlace::StartQueue;
        let urgent = cmd.flags.contains(CmdFlags::URGENT);
        let (target, lun) = (cmd.target, cmd.lun);
        let id = self.alloc_cmd(cmd);
        self.start_queue.push(id, urgent);
        self.inflight += 1;

        // First reference wakes the LUN's discovery machine.
        if self.lun_mut(target, lun).discovery == Discovery::Sleep {
            self.advance_discovery(target, lun, true);
        }
        self.kick();
        Ok(id)
    }

    /// Requests cancellation of a command.
    ///
    /// Honored immediately while queued; otherwise an abort message is
    /// asserted and the completion arrives through the normal path.
    ///
    /// # Errors
    ///
    /// [`SubmitError::NotFound`] if the handle is unknown or already
    /// completed.
    pub fn abort(&mut self, id: CmdId) -> Result<AbortOutcome, SubmitError> {
        let Some(place) = self.try_cmd(id).map(|c| c.place) else {
            return Err(SubmitError::NotFound);
        };
        match place {
            CmdPlace::StartQueue => {
                self.start_queue.take(id);
                let c = self.cmd_mut(id);
                c.place = CmdPlace::Detached;
                c.fail(CmdError::ABORTED);
                self.finish(id);
                Ok(AbortOutcome::Dequeued)
            }
            CmdPlace::Active => {
                let tagged = self.cmd(id).tag.is_some();
                let c = self.cmd_mut(id);
                c.fail(CmdError::ABORTED);
                c.msg_pending |= if tagged {
                    OutMsgSet::ABORT_TAG
                } else {
                    OutMsgSet::ABORT
                };
                self.hba.assert_attention();
                Ok(AbortOutcome::MessagePending)
            }
            CmdPlace::Disconnected => {
                // Takes effect at the next reselection of this nexus.
                self.cmd_mut(id).flags |= CmdFlags::ABORT_PENDING;
                Ok(AbortOutcome::MessagePending)
            }
            CmdPlace::Parked => {
                let (target, lun) = {
                    let c = self.cmd_mut(id);
                    c.place = CmdPlace::Detached;
                    c.fail(CmdError::ABORTED);
                    (c.target, c.lun)
                };
                self.lun_mut(target, lun).held = None;
                self.deliver(id);
                Ok(AbortOutcome::Dequeued)
            }
            CmdPlace::Detached => Err(SubmitError::NotFound),
        }
    }

    /// Resets one target or the whole bus.
    pub fn reset(&mut self, scope: ResetScope) {
        match scope {
            ResetScope::Bus => {
                if let NexusState::Established { cmd, .. } = self.nexus {
                    self.cmd_mut(cmd).fail(CmdError::ABORTED);
                }
                self.bus_reset_recovery();
            }
            ResetScope::Target(target) => self.reset_target(target),
            ResetScope::Lun(target, lun) => self.clear_lun_queue(target, lun),
        }
    }

    /// Asks the target to end the active command early; it answers with
    /// a COMMAND TERMINATED status through the normal completion path.
    ///
    /// Falls back to [`abort`](Self::abort) for commands not currently
    /// on the bus.
    ///
    /// # Errors
    ///
    /// [`SubmitError::NotFound`] if the handle is unknown or already
    /// completed.
    pub fn terminate(&mut self, id: CmdId) -> Result<AbortOutcome, SubmitError> {
        match self.try_cmd(id).map(|c| c.place) {
            Some(CmdPlace::Active) => {
                self.cmd_mut(id).msg_pending |= OutMsgSet::TERMINATE;
                self.hba.assert_attention();
                Ok(AbortOutcome::MessagePending)
            }
            Some(_) => self.abort(id),
            None => Err(SubmitError::NotFound),
        }
    }

    /// Supervisor tick; must be driven at a steady external rate.
    pub fn tick(&mut self) {
        if self.sel_backoff > 0 {
            self.sel_backoff -= 1;
        }

        match self.nexus {
            NexusState::Established { cmd, .. } => {
                if self.age(cmd) {
                    self.expire(&[cmd]);
                    return;
                }
            }
            NexusState::Idle => {
                if let Some(head) = self.start_queue.head() {
                    if self.age(head) {
                        self.expire(&[head]);
                        return;
                    }
                } else if self.disc_count > 0 {
                    let mut expired = Vec::new();
                    for id in self.disconnected_in_order() {
                        if self.age(id) {
                            expired.push(id);
                        }
                    }
                    if !expired.is_empty() {
                        self.expire(&expired);
                        return;
                    }
                }
            }
            NexusState::Reselecting { .. } => {}
        }
        self.kick();
    }

    /// Pumps pending bus events from a polled adapter.
    pub fn poll(&mut self) {
        while let Some(ev) = self.hba.poll() {
            self.on_event(ev);
        }
    }

    // ── Selection ───────────────────────────────────────────────────────

    /// Starts the next eligible command if the bus is free.
    pub(crate) fn kick(&mut self) {
        loop {
            if self.nexus != NexusState::Idle
                || self.sel_backoff > 0
                || self
                    .flags
                    .intersects(EngineFlags::INACTIVE | EngineFlags::SUSPENDED)
            {
                return;
            }
            let Some(id) = self.select_next() else { return };
            if !self.start_selected(id) {
                return;
            }
            // A successful selection may already have run to bus free
            // (polled adapters); loop to start more work.
            self.poll();
        }
    }

    /// The first start-queue command its LUN admits.
    pub(crate) fn select_next(&mut self) -> Option<CmdId> {
        for id in self.start_queue.iter() {
            let c = self.cmds[id.0 as usize].as_ref()?;
            let Some(lun) = self
                .targets
                .get(c.target as usize)
                .and_then(|t| t.as_ref())
                .and_then(|t| t.luns.get(&c.lun))
            else {
                continue;
            };
            if eligible(c, lun) {
                return Some(id);
            }
        }
        None
    }

    /// Arbitrates and selects for `id`. Returns whether a nexus exists.
    fn start_selected(&mut self, id: CmdId) -> bool {
        let (target, lun) = {
            let c = self.cmd(id);
            (c.target, c.lun)
        };
        self.stats.selections += 1;
        match self.hba.arbitrate_and_select(target) {
            SelectOutcome::Ok => {}
            SelectOutcome::Lost | SelectOutcome::Busy => {
                // The command keeps its place at the head; no error is
                // charged for losing the bus, but the backoff grows
                // with consecutive losses.
                self.stats.selections_lost += 1;
                let c = self.cmd_mut(id);
                c.sel_retries = c.sel_retries.saturating_add(1);
                let losses = u32::from(c.sel_retries.min(4));
                self.sel_backoff = self.config.select_backoff_ticks * losses;
                return false;
            }
        }

        self.start_queue.take(id);
        self.cmd_mut(id).sel_retries = 0;
        self.phases_seen = false;
        self.expect_free = FreeCause::Unexpected;

        let tagged = {
            let l = self.lun_mut(target, lun);
            l.caps.contains(LunCaps::TAGGED)
        } && !self.cmd(id).flags.contains(CmdFlags::INTERNAL);

        let mut msgs = OutMsgSet::IDENTIFY;
        if tagged {
            if let Some(tag) = self.lun_mut(target, lun).allocate_tag() {
                self.cmd_mut(id).tag = Some(tag);
                msgs |= OutMsgSet::QUEUE_TAG;
            } else {
                // Window said yes but the bitmap is spent; run untagged.
                self.lun_mut(target, lun).untagged_busy = true;
            }
        } else {
            self.lun_mut(target, lun).untagged_busy = true;
        }
        {
            let c = self.cmd_mut(id);
            c.place = CmdPlace::Active;
            c.msg_pending |= msgs;
        }
        self.nexus = NexusState::Established { target, lun, cmd: id };
        true
    }

    // ── Supervision ─────────────────────────────────────────────────────

    /// Decrements a deadline; true when it expired.
    fn age(&mut self, id: CmdId) -> bool {
        let c = self.cmd_mut(id);
        c.deadline = c.deadline.saturating_sub(1);
        c.deadline == 0
    }

    /// Deadline expiry: charge `TIMEOUT` and run bus-reset recovery.
    fn expire(&mut self, victims: &[CmdId]) {
        for &id in victims {
            self.stats.timeouts += 1;
            self.cmd_mut(id).fail(CmdError::TIMEOUT);
            let (target, lun) = {
                let c = self.cmd(id);
                (c.target, c.lun)
            };
            log::warn!("scsi{target}:{lun}: command timed out, resetting bus");
        }
        // Victims still in the start queue never touched the bus; they
        // complete directly, the reset handles the rest.
        for &id in victims {
            if self.cmd(id).place == CmdPlace::StartQueue {
                self.start_queue.take(id);
                self.cmd_mut(id).place = CmdPlace::Detached;
                self.finish(id);
            }
        }
        self.bus_reset_recovery();
    }

    /// Hard bus reset plus full queue teardown.
    ///
    /// Disconnected commands are requeued to the start queue preserving
    /// their relative order (ahead of never-started work); commands with
    /// accumulated hard errors are completed instead. All negotiated
    /// state resets; the next command per target renegotiates.
    pub(crate) fn bus_reset_recovery(&mut self) {
        self.flags |= EngineFlags::INITIALIZING;
        self.stats.bus_resets += 1;
        self.hba.reset_bus();

        // The active command, if any, ends its transaction here.
        if let NexusState::Established { cmd, .. } = self.nexus {
            self.detach_active(cmd);
            self.finish(cmd);
        }
        self.nexus = NexusState::Idle;
        self.expect_free = FreeCause::Unexpected;
        self.msgout = MsgOutState::new();

        // Pull every disconnected command off its LUN queue, oldest
        // first, then reinsert at the head of the start queue.
        let ids = self.disconnected_in_order();
        for &id in &ids {
            self.unqueue_disconnected(id);
            self.release_bus_claims(id);
        }
        for &id in ids.iter().rev() {
            if self
                .cmd(id)
                .errors
                .intersects(CmdError::TIMEOUT | CmdError::ABORTED | CmdError::PROTO_FATAL)
            {
                self.cmd_mut(id).place = CmdPlace::Detached;
                self.finish(id);
            } else {
                self.cmd_mut(id).place = CmdPlace::StartQueue;
                self.cmd_mut(id).rewind_for_retry();
                self.start_queue.push_front(id);
            }
        }
        debug_assert_eq!(self.disc_count, 0);

        // Parked commands lose their pending sense; deliver as-is.
        let parked: Vec<CmdId> = self.all_ids(|c| c.place == CmdPlace::Parked);
        for id in parked {
            let (t, l) = {
                let c = self.cmd_mut(id);
                c.place = CmdPlace::Detached;
                (c.target, c.lun)
            };
            self.lun_mut(t, l).held = None;
            self.lun_mut(t, l).ca_recovery = false;
            self.deliver(id);
        }

        for t in self.targets.iter_mut().flatten() {
            t.reset_negotiation();
            for lun in t.luns.values_mut() {
                lun.ca_recovery = false;
            }
        }

        self.flags.remove(EngineFlags::INITIALIZING);
        self.kick();
    }

    /// BUS DEVICE RESET for one target: fail its queued work, pend the
    /// reset message when it owns the nexus.
    fn reset_target(&mut self, target: u8) {
        let queued: Vec<CmdId> =
            self.all_ids(|c| c.target == target && c.place == CmdPlace::StartQueue);
        for id in queued {
            self.start_queue.take(id);
            self.cmd_mut(id).place = CmdPlace::Detached;
            self.cmd_mut(id).fail(CmdError::ABORTED);
            self.finish(id);
        }
        let disco: Vec<CmdId> =
            self.all_ids(|c| c.target == target && c.place == CmdPlace::Disconnected);
        for id in disco {
            self.unqueue_disconnected(id);
            self.release_bus_claims(id);
            self.cmd_mut(id).place = CmdPlace::Detached;
            self.cmd_mut(id).fail(CmdError::ABORTED);
            self.finish(id);
        }
        if let NexusState::Established { target: t, cmd, .. } = self.nexus {
            if t == target {
                self.msgout.bus_pending |= OutMsgSet::BUS_DEVICE_RESET;
                self.cmd_mut(cmd).fail(CmdError::ABORTED);
                self.hba.assert_attention();
            }
        }
        if let Some(ts) = self.targets[target as usize].as_mut() {
            ts.reset_negotiation();
        }
    }

    /// CLEAR QUEUE for one LUN: fail its queued and disconnected work,
    /// pend the message when that LUN owns the nexus.
    fn clear_lun_queue(&mut self, target: u8, lun: u8) {
        let queued: Vec<CmdId> = self.all_ids(|c| {
            c.target == target && c.lun == lun && c.place == CmdPlace::StartQueue
        });
        for id in queued {
            self.start_queue.take(id);
            self.cmd_mut(id).place = CmdPlace::Detached;
            self.cmd_mut(id).fail(CmdError::ABORTED);
            self.finish(id);
        }
        let disco: Vec<CmdId> = self.all_ids(|c| {
            c.target == target && c.lun == lun && c.place == CmdPlace::Disconnected
        });
        for id in disco {
            self.unqueue_disconnected(id);
            self.release_bus_claims(id);
            self.cmd_mut(id).place = CmdPlace::Detached;
            self.cmd_mut(id).fail(CmdError::ABORTED);
            self.finish(id);
        }
        if let NexusState::Established { target: t, lun: l, cmd } = self.nexus {
            if t == target && l == lun {
                self.msgout.bus_pending |= OutMsgSet::CLEAR_QUEUE;
                self.cmd_mut(cmd).fail(CmdError::ABORTED);
                self.hba.assert_attention();
            }
        }
    }

    // ── Completion path ─────────────────────────────────────────────────

    /// A command's bus transaction is over; classify and route.
    ///
    /// The command must already be detached from every queue.
    pub(crate) fn finish(&mut self, id: CmdId) {
        debug_assert_eq!(self.cmd(id).place, CmdPlace::Detached);
        let (target, lun, flags, errors, status) = {
            let c = self.cmd(id);
            (c.target, c.lun, c.flags, c.errors, c.status)
        };

        // Internal autosense: transplant results onto the original.
        if let Some(orig) = self.cmd(id).sense_for {
            self.finish_sense(id, orig);
            return;
        }

        // Clean completion; the intermediate statuses are the linked
        // chain's version of GOOD.
        if errors.is_empty()
            && matches!(
                status,
                Some(
                    ScsiStatus::Good
                        | ScsiStatus::ConditionMet
                        | ScsiStatus::Intermediate
                        | ScsiStatus::IntermediateConditionMet
                ) | None
            )
        {
            self.lun_mut(target, lun).note_good();
            if flags.contains(CmdFlags::INTERNAL) {
                self.finish_probe(id, true);
            } else {
                self.deliver(id);
            }
            return;
        }

        let budget = self.config.retry_budget;
        let c = self.cmd(id);
        let mut disposition = classify(
            errors,
            flags.contains(CmdFlags::NO_RETRY),
            flags.contains(CmdFlags::AUTOSENSE),
            c.retries,
            budget,
        );
        // Internal commands never get nested autosense.
        if flags.contains(CmdFlags::INTERNAL) && disposition == Disposition::NeedsSense {
            disposition = Disposition::Fatal;
        }

        match disposition {
            Disposition::RetryNow => {
                self.stats.retries += 1;
                if errors.contains(CmdError::QUEUE_FULL) {
                    // Window already shrunk at status time; just go again.
                    log::debug!("scsi{target}:{lun}: queue full, requeued");
                }
                let ticks = self.config.deadline_ticks;
                let c = self.cmd_mut(id);
                c.errors
                    .remove(CmdError::BUSY_STATUS | CmdError::QUEUE_FULL);
                c.rewind_for_retry();
                c.deadline = ticks;
                c.place = CmdPlace::StartQueue;
                self.start_queue.push_front(id);
            }
            Disposition::RetryBackoff => {
                self.stats.retries += 1;
                let ticks = self.config.deadline_ticks;
                let c = self.cmd_mut(id);
                c.retries += 1;
                // Transient bus errors are per-attempt; a clean retry
                // must not inherit them.
                c.errors.remove(
                    CmdError::SELECTION_TIMEOUT | CmdError::PARITY | CmdError::UNEXPECTED_BUS_FREE,
                );
                c.rewind_for_retry();
                c.deadline = ticks;
                c.place = CmdPlace::StartQueue;
                self.start_queue.push_front(id);
                self.sel_backoff = self.config.select_backoff_ticks;
            }
            Disposition::NeedsSense => self.start_autosense(id),
            Disposition::Fatal => {
                if flags.contains(CmdFlags::INTERNAL) {
                    self.finish_probe(id, false);
                } else {
                    self.deliver(id);
                }
            }
        }
    }

    /// Parks the original and issues REQUEST SENSE under CA recovery.
    fn start_autosense(&mut self, orig: CmdId) {
        let (target, lun) = {
            let c = self.cmd_mut(orig);
            c.place = CmdPlace::Parked;
            (c.target, c.lun)
        };
        log::debug!("scsi{target}:{lun}: check condition, fetching sense");
        {
            let l = self.lun_mut(target, lun);
            l.ca_recovery = true;
            l.held = Some(orig);
        }
        let mut sense = Command::internal(
            target,
            lun,
            &cdb::request_sense(),
            DataDir::In,
            u32::from(cdb::SENSE_LEN),
        );
        sense.flags |= CmdFlags::CA_RECOVERY | CmdFlags::NO_RETRY;
        sense.sense_for = Some(orig);
        sense.deadline = self.config.deadline_ticks;
        sense.place = CmdPlace::StartQueue;
        let id = self.alloc_cmd(sense);
        self.inflight += 1;
        self.start_queue.push(id, true);
    }

    /// Autosense finished: attach data and deliver the original.
    fn finish_sense(&mut self, sense_id: CmdId, orig: CmdId) {
        let (target, lun) = {
            let c = self.cmd(sense_id);
            (c.target, c.lun)
        };
        let ok = self.cmd(sense_id).errors.is_empty();
        let data = {
            let c = self.cmd(sense_id);
            let got = (u32::from(cdb::SENSE_LEN) - c.cur.remaining) as usize;
            let mut bytes = [0u8; 18];
            bytes.copy_from_slice(&c.inline[..18]);
            SenseData {
                bytes,
                len: got.min(18) as u8,
            }
        };
        self.destroy(sense_id);

        {
            let l = self.lun_mut(target, lun);
            l.ca_recovery = false;
            l.held = None;
        }

        // The original may have been aborted while parked.
        let Some(c) = self.try_cmd_mut(orig) else { return };
        if c.place != CmdPlace::Parked {
            return;
        }
        c.place = CmdPlace::Detached;
        c.flags |= CmdFlags::AUTOSENSE;
        if ok {
            c.sense = Some(data);
        }
        self.deliver(orig);
    }

    /// Internal probe finished; advance the LUN discovery machine.
    fn finish_probe(&mut self, id: CmdId, ok: bool) {
        let (target, lun) = {
            let c = self.cmd(id);
            (c.target, c.lun)
        };
        let step = self.lun_mut(target, lun).discovery;
        self.lun_mut(target, lun).probe = None;

        match step {
            Discovery::StartUnit => {
                // A failed START UNIT is tolerable (removable media and
                // the like); keep probing.
                if !ok {
                    log::debug!("scsi{target}:{lun}: start unit failed, continuing");
                }
                self.destroy(id);
                self.advance_discovery(target, lun, false);
            }
            Discovery::Inquiry => {
                if ok {
                    self.apply_inquiry(target, lun, id);
                } else {
                    log::warn!("scsi{target}:{lun}: inquiry failed, defaults only");
                    self.lun_mut(target, lun).discovery = Discovery::Ok;
                }
                let done = self.lun_mut(target, lun).discovery == Discovery::Ok;
                self.destroy(id);
                if !done {
                    self.spawn_probe(target, lun, cdb::mode_sense_control(), cdb::MODE_SENSE_LEN);
                }
            }
            Discovery::ModeSenseQueueFlags => {
                if ok {
                    self.apply_mode_sense(target, lun, id);
                } else {
                    // No control page: keep the INQUIRY verdict.
                    self.enable_tags(target, lun);
                }
                self.lun_mut(target, lun).discovery = Discovery::Ok;
                self.destroy(id);
            }
            Discovery::Sleep | Discovery::Ok => self.destroy(id),
        }
    }

    /// Moves discovery forward, spawning the next probe.
    fn advance_discovery(&mut self, target: u8, lun: u8, first: bool) {
        let next = if first {
            Discovery::StartUnit
        } else {
            match self.lun_mut(target, lun).discovery {
                Discovery::Sleep => Discovery::StartUnit,
                Discovery::StartUnit => Discovery::Inquiry,
                other => other,
            }
        };
        self.lun_mut(target, lun).discovery = next;
        match next {
            Discovery::StartUnit => self.spawn_probe(target, lun, cdb::start_unit(), 0),
            Discovery::Inquiry => self.spawn_probe(target, lun, cdb::inquiry(), cdb::INQUIRY_LEN),
            _ => {}
        }
    }

    fn spawn_probe(&mut self, target: u8, lun: u8, cdb_bytes: [u8; 6], len: u8) {
        let dir = if len == 0 { DataDir::None } else { DataDir::In };
        let mut probe = Command::internal(target, lun, &cdb_bytes, dir, u32::from(len));
        probe.deadline = self.config.deadline_ticks;
        probe.place = CmdPlace::StartQueue;
        let id = self.alloc_cmd(probe);
        self.inflight += 1;
        self.lun_mut(target, lun).probe = Some(id);
        self.start_queue.push(id, true);
    }

    /// Applies INQUIRY results: quirks, capabilities, negotiation goals.
    fn apply_inquiry(&mut self, target: u8, lun: u8, id: CmdId) {
        let mut inq = [0u8; 36];
        let got = {
            let c = self.cmd(id);
            let got = (u32::from(cdb::INQUIRY_LEN) - c.cur.remaining) as usize;
            inq.copy_from_slice(&c.inline[..36]);
            got
        };
        let quirks = quirk_lookup(&inq[..got.min(36)]);
        let byte7 = if got >= 8 { inq[7] } else { 0 };
        self.target_mut(target).quirks = quirks;

        let cfg = self.config;
        {
            let t = self.target_mut(target);
            if byte7 & 0x10 != 0 && cfg.max_offset > 0 && !quirks.contains(Quirks::NO_SYNC) {
                t.goal_period = cfg.min_period;
                t.goal_offset = cfg.max_offset;
                t.setup |= SetupMsgs::SYNC;
            }
            if byte7 & 0x20 != 0 && cfg.max_wide > 0 && !quirks.contains(Quirks::NO_WIDE) {
                t.goal_width = cfg.max_wide;
                t.setup |= SetupMsgs::WIDE;
            }
        }

        let can_disc = cfg.allow_disconnect && !quirks.contains(Quirks::NO_DISCONNECT);
        let can_queue =
            cfg.allow_tags && byte7 & 0x02 != 0 && !quirks.contains(Quirks::NO_TAGS);
        let can_link = byte7 & 0x08 != 0;
        {
            let l = self.lun_mut(target, lun);
            l.caps = LunCaps::empty();
            if can_disc {
                l.caps |= LunCaps::DISCONNECT;
            }
            if can_link {
                l.caps |= LunCaps::LINKED;
            }
            if !can_queue {
                // No queuing: discovery ends here.
                l.discovery = Discovery::Ok;
            } else {
                l.discovery = Discovery::ModeSenseQueueFlags;
            }
        }
        log::info!(
            "scsi{target}:{lun}: inquiry ok (disc={} queue={} quirks={quirks:?})",
            can_disc,
            can_queue
        );
    }

    /// Applies the control mode page: DQue set disables queuing.
    fn apply_mode_sense(&mut self, target: u8, lun: u8, id: CmdId) {
        let (dque, got) = {
            let c = self.cmd(id);
            let got = (u32::from(cdb::MODE_SENSE_LEN) - c.cur.remaining) as usize;
            // Mode parameter header (4 bytes), then the page: code, len,
            // then byte 3 of the page carries QAM + DQue.
            let dque = got >= 8 && c.inline[4] & 0x3F == cdb::PAGE_CONTROL_MODE
                && c.inline[7] & 0x01 != 0;
            (dque, got)
        };
        if dque || got < 8 {
            log::info!("scsi{target}:{lun}: tagged queuing disabled by device");
        } else {
            self.enable_tags(target, lun);
        }
    }

    fn enable_tags(&mut self, target: u8, lun: u8) {
        let max = self.config.max_tags.min(MAX_TAGS);
        let l = self.lun_mut(target, lun);
        l.caps |= LunCaps::TAGGED;
        l.max_window = max;
        l.window = max;
        log::info!("scsi{target}:{lun}: tagged queuing, {max} tags");
    }

    /// Final delivery or destruction; exactly once per command.
    pub(crate) fn deliver(&mut self, id: CmdId) {
        debug_assert_eq!(self.cmd(id).place, CmdPlace::Detached);
        let cmd = self.take_cmd(id);
        self.inflight -= 1;
        self.stats.completions += 1;
        if !cmd.errors.is_empty() && !cmd.flags.contains(CmdFlags::SILENT) {
            log::warn!(
                "scsi{}:{}: command failed ({:?})",
                cmd.target,
                cmd.lun,
                cmd.errors
            );
        }
        if cmd.flags.contains(CmdFlags::INTERNAL) {
            return;
        }
        self.submitter.on_command_complete(cmd);
    }

    /// Destroys an internal command without delivery.
    fn destroy(&mut self, id: CmdId) {
        let c = self.cmd_mut(id);
        debug_assert!(c.flags.contains(CmdFlags::INTERNAL));
        c.place = CmdPlace::Detached;
        let _ = self.take_cmd(id);
        self.inflight -= 1;
    }

    // ── Queue-membership mutators (§ nexus bookkeeping) ─────────────────
    //
    // Every move updates the LUN/target/global disconnect counters in the
    // same operation; the counters are a derived index and must never
    // diverge from queue membership.

    /// Active → this LUN's disconnect queue.
    pub(crate) fn move_to_disconnect_queue(&mut self, id: CmdId) {
        let (target, lun) = {
            let c = self.cmd_mut(id);
            debug_assert_eq!(c.place, CmdPlace::Active);
            c.place = CmdPlace::Disconnected;
            (c.target, c.lun)
        };
        {
            let l = self.lun_mut(target, lun);
            l.disc_queue.push_back(id);
            l.disc_count += 1;
        }
        self.target_mut(target).disc_count += 1;
        self.disc_count += 1;
        self.stats.disconnects += 1;
    }

    /// Disconnect queue → active nexus (reselection).
    pub(crate) fn reestablish(&mut self, target: u8, lun: u8, id: CmdId) {
        self.unqueue_disconnected(id);
        {
            let c = self.cmd_mut(id);
            c.place = CmdPlace::Active;
            // Reselection implies the saved pointer.
            c.cur = c.saved;
        }
        self.nexus = NexusState::Established { target, lun, cmd: id };
        self.expect_free = FreeCause::Unexpected;

        // An abort requested while disconnected lands now.
        if self.cmd(id).flags.contains(CmdFlags::ABORT_PENDING) {
            let tagged = self.cmd(id).tag.is_some();
            let c = self.cmd_mut(id);
            c.flags.remove(CmdFlags::ABORT_PENDING);
            c.fail(CmdError::ABORTED);
            c.msg_pending |= if tagged {
                OutMsgSet::ABORT_TAG
            } else {
                OutMsgSet::ABORT
            };
            self.hba.assert_attention();
        }
    }

    /// Active → head of the start queue (selection conflict).
    pub(crate) fn revoke_to_start_queue(&mut self, id: CmdId) {
        self.release_bus_claims(id);
        let c = self.cmd_mut(id);
        debug_assert_eq!(c.place, CmdPlace::Active);
        c.place = CmdPlace::StartQueue;
        c.msg_pending = OutMsgSet::empty();
        c.tag = None;
        self.start_queue.push_front(id);
        self.nexus = NexusState::Idle;
    }

    /// Active → detached; releases the LUN claim.
    pub(crate) fn detach_active(&mut self, id: CmdId) {
        self.release_bus_claims(id);
        let c = self.cmd_mut(id);
        c.place = CmdPlace::Detached;
        c.msg_pending = OutMsgSet::empty();
        if let NexusState::Established { cmd, .. } = self.nexus {
            if cmd == id {
                self.nexus = NexusState::Idle;
            }
        }
    }

    /// Removes a command from its LUN disconnect queue, with counters.
    fn unqueue_disconnected(&mut self, id: CmdId) {
        let (target, lun) = {
            let c = self.cmd(id);
            debug_assert_eq!(c.place, CmdPlace::Disconnected);
            (c.target, c.lun)
        };
        {
            let l = self.lun_mut(target, lun);
            let pos = l
                .disc_queue
                .iter()
                .position(|&x| x == id)
                .expect("command missing from its disconnect queue");
            l.disc_queue.remove(pos);
            l.disc_count -= 1;
        }
        self.target_mut(target).disc_count -= 1;
        self.disc_count -= 1;
    }

    /// Returns the tag / untagged claim a command holds on its LUN.
    fn release_bus_claims(&mut self, id: CmdId) {
        let (target, lun, tag) = {
            let c = self.cmd(id);
            (c.target, c.lun, c.tag)
        };
        let l = self.lun_mut(target, lun);
        if let Some(tag) = tag {
            let _ = l.release_tag(tag);
            self.cmd_mut(id).tag = None;
        } else {
            l.untagged_busy = false;
        }
    }

    // ── Arena and state accessors ───────────────────────────────────────

    fn alloc_cmd(&mut self, cmd: Command) -> CmdId {
        if let Some(slot) = self.free.pop() {
            self.cmds[slot as usize] = Some(cmd);
            CmdId(slot)
        } else {
            self.cmds.push(Some(cmd));
            CmdId((self.cmds.len() - 1) as u32)
        }
    }

    fn take_cmd(&mut self, id: CmdId) -> Command {
        let cmd = self.cmds[id.0 as usize]
            .take()
            .expect("stale command handle");
        self.free.push(id.0);
        cmd
    }

    pub(crate) fn cmd(&self, id: CmdId) -> &Command {
        self.cmds[id.0 as usize]
            .as_ref()
            .expect("stale command handle")
    }

    pub(crate) fn cmd_mut(&mut self, id: CmdId) -> &mut Command {
        self.cmds[id.0 as usize]
            .as_mut()
            .expect("stale command handle")
    }

    pub(crate) fn try_cmd(&self, id: CmdId) -> Option<&Command> {
        self.cmds.get(id.0 as usize)?.as_ref()
    }

    fn try_cmd_mut(&mut self, id: CmdId) -> Option<&mut Command> {
        self.cmds.get_mut(id.0 as usize)?.as_mut()
    }

    pub(crate) fn target(&self, target: u8) -> Option<&TargetState> {
        self.targets.get(target as usize)?.as_ref()
    }

    pub(crate) fn target_mut(&mut self, target: u8) -> &mut TargetState {
        self.targets[target as usize].get_or_insert_with(TargetState::new)
    }

    pub(crate) fn lun(&self, target: u8, lun: u8) -> Option<&LunState> {
        self.target(target)?.luns.get(&lun)
    }

    pub(crate) fn lun_mut(&mut self, target: u8, lun: u8) -> &mut LunState {
        self.target_mut(target).lun_mut(lun)
    }

    /// The established nexus triple, if any.
    pub(crate) fn established(&self) -> Option<(u8, u8, CmdId)> {
        match self.nexus {
            NexusState::Established { target, lun, cmd } => Some((target, lun, cmd)),
            _ => None,
        }
    }

    fn all_ids(&self, pred: impl Fn(&Command) -> bool) -> Vec<CmdId> {
        self.cmds
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|c| pred(c))
                    .map(|_| CmdId(i as u32))
            })
            .collect()
    }

    /// All disconnected commands, in target/LUN index order and
    /// disconnect order within each LUN.
    fn disconnected_in_order(&self) -> Vec<CmdId> {
        let mut out = Vec::new();
        for t in self.targets.iter().flatten() {
            for lun in t.luns.values() {
                out.extend(lun.disc_queue.iter().copied());
            }
        }
        out
    }

    /// Validates the shadow disconnect counters against actual queue
    /// membership: per-LUN, per-target, and global.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        let mut global = 0;
        for t in self.targets.iter().flatten() {
            let mut per_target = 0;
            for lun in t.luns.values() {
                if lun.disc_count != lun.disc_queue.len() as u32 {
                    return false;
                }
                per_target += lun.disc_count;
            }
            if t.disc_count != per_target {
                return false;
            }
            global += per_target;
        }
        global == self.disc_count
    }

    /// Where a command currently lives, for hosts that track progress.
    #[must_use]
    pub fn command_place(&self, id: CmdId) -> Option<CmdPlace> {
        self.try_cmd(id).map(|c| c.place)
    }
}
