//! Scriptable SCSI target simulator.
//!
//! [`SimBus`] plays the target side of a parallel SCSI bus for host
//! tests: it answers selection, walks the message/command/data/status
//! phases, disconnects and reselects, and negotiates transfer modes
//! according to per-target [`TargetProfile`] scripts. The engine and the
//! simulator run in lockstep: every adapter call the engine makes may
//! queue bus events, which the engine then drains through its poll loop.
//!
//! Tests keep a [`SimHandle`] clone to inspect the bus after the engine
//! takes ownership of its copy.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tachyon_scsi::hba::{
    BusEvent, BusPhase, DataDir, DataRegion, HbaDriver, SelectOutcome, Submitter, SyncParams,
};
use tachyon_scsi::msg;
use tachyon_scsi::Command;

/// Per-target behavior script.
#[derive(Debug, Clone)]
pub struct TargetProfile {
    /// Whether selection gets any response at all.
    pub exists: bool,
    /// Lose this many arbitrations before selection succeeds.
    pub lose_selections: u32,
    /// Disconnect (with save pointers) before the data phase when the
    /// initiator granted the privilege.
    pub disconnect: bool,
    /// Open a target-initiated SDTR exchange before the first command.
    pub initiate_sdtr: Option<(u8, u8)>,
    /// Answer to the initiator's SDTR; `None` echoes the request.
    pub sdtr_answer: Option<(u8, u8)>,
    /// Answer to the initiator's WDTR; `None` echoes the request.
    pub wdtr_answer: Option<u8>,
    /// Reject SDTR with MESSAGE REJECT.
    pub reject_sdtr: bool,
    /// Reject queue tag messages with MESSAGE REJECT.
    pub reject_tags: bool,
    /// Raw message-in bytes sent once before the first command phase.
    pub opening_msgin: Vec<u8>,
    /// Answer the next message-out group with MESSAGE PARITY ERROR
    /// instead of acting on it.
    pub garble_msgout_once: bool,
    /// Inject this many adapter parity errors on message-in bytes.
    pub msgin_parity_glitches: u32,
    /// Inject this many adapter parity errors on data transfers.
    pub data_parity_glitches: u32,
    /// Enter the data phase but never move a byte; the bus hangs until
    /// nudged or reset.
    pub stall_data: bool,
    /// Status overrides: first entry whose opcode matches is consumed.
    pub status_script: Vec<(u8, u8)>,
    /// INQUIRY payload.
    pub inquiry: Vec<u8>,
    /// MODE SENSE payload (control page).
    pub mode_page: Vec<u8>,
    /// REQUEST SENSE payload.
    pub sense: Vec<u8>,
    /// Data-in payload for read-class commands.
    pub data: Vec<u8>,
}

impl Default for TargetProfile {
    fn default() -> Self {
        let mut inquiry = vec![0u8; 36];
        inquiry[2] = 0x02;
        inquiry[4] = 31;
        inquiry[8..16].copy_from_slice(b"SIM     ");
        inquiry[16..26].copy_from_slice(b"DISK      ");
        // Mode parameter header then the control page, DQue clear.
        let mode_page = vec![0, 0, 0, 0, 0x0A, 0x0A, 0, 0x00, 0, 0, 0, 0];
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x05;
        Self {
            exists: true,
            lose_selections: 0,
            disconnect: false,
            initiate_sdtr: None,
            sdtr_answer: None,
            wdtr_answer: None,
            reject_sdtr: false,
            reject_tags: false,
            opening_msgin: Vec::new(),
            garble_msgout_once: false,
            msgin_parity_glitches: 0,
            data_parity_glitches: 0,
            stall_data: false,
            status_script: Vec::new(),
            inquiry,
            mode_page,
            sense,
            data: Vec::new(),
        }
    }
}

impl TargetProfile {
    /// Plain disk, no optional features.
    #[must_use]
    pub fn disk() -> Self {
        Self::default()
    }

    /// Advertise tagged queuing in INQUIRY.
    #[must_use]
    pub fn with_tags(mut self) -> Self {
        self.inquiry[7] |= 0x02;
        self
    }

    /// Advertise synchronous transfer in INQUIRY.
    #[must_use]
    pub fn with_sync(mut self) -> Self {
        self.inquiry[7] |= 0x10;
        self
    }

    /// Advertise a 16-bit wide bus in INQUIRY.
    #[must_use]
    pub fn with_wide(mut self) -> Self {
        self.inquiry[7] |= 0x20;
        self
    }

    /// Advertise linked command support in INQUIRY.
    #[must_use]
    pub fn with_linked(mut self) -> Self {
        self.inquiry[7] |= 0x08;
        self
    }

    /// Set the vendor/product identification bytes.
    #[must_use]
    pub fn with_id(mut self, vendor: &[u8; 8], product: &[u8; 16]) -> Self {
        self.inquiry[8..16].copy_from_slice(vendor);
        self.inquiry[16..32].copy_from_slice(product);
        self
    }
}

/// A task the target parked by disconnecting.
#[derive(Debug, Clone)]
struct ParkedTask {
    target: u8,
    lun: u8,
    tag: Option<u8>,
    dir: DataDir,
    data: Vec<u8>,
    status: u8,
}

/// What happens once the message-in queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterMsgIn {
    /// Release the bus.
    BusFree,
    /// Carry on with the transaction (command, data or status next).
    Continue,
}

/// Live transaction state.
#[derive(Debug, Clone)]
struct Transaction {
    target: u8,
    lun: u8,
    tag: Option<u8>,
    disc_priv: bool,
    got_cdb: bool,
    resumed: bool,
    aborting: bool,
    dir: DataDir,
    data: Vec<u8>,
    data_pos: usize,
    status: u8,
    data_done: bool,
    nego_done: bool,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            target: 0,
            lun: 0,
            tag: None,
            disc_priv: false,
            got_cdb: false,
            resumed: false,
            aborting: false,
            dir: DataDir::None,
            data: Vec::new(),
            data_pos: 0,
            status: 0,
            data_done: false,
            nego_done: false,
        }
    }
}

/// The simulated bus. Wrap in a [`SimHandle`] before giving it to the
/// engine.
#[derive(Debug)]
pub struct SimBus {
    profiles: BTreeMap<u8, TargetProfile>,
    events: VecDeque<BusEvent>,
    phase: BusPhase,
    atn: bool,
    msgin: VecDeque<u8>,
    /// The last message-in group queued, for parity-requested resends.
    last_msgin: Vec<u8>,
    after_msgin: AfterMsgIn,
    tx: Transaction,
    parked: Vec<ParkedTask>,
    /// Hold parked tasks instead of reselecting automatically.
    pub hold_reselect: bool,
    /// Every message-out the initiator sent, grouped per phase service.
    pub msgout_log: Vec<Vec<u8>>,
    /// Every CDB received.
    pub cdb_log: Vec<Vec<u8>>,
    /// Data-out bytes captured.
    pub data_out: Vec<u8>,
    /// DMA transfers requested through `data_transfer`.
    pub dma_log: Vec<(DataDir, u64, u32, u32)>,
    /// Bus resets observed.
    pub resets: u32,
}

impl SimBus {
    /// Creates an empty bus; add targets before selecting them.
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: BTreeMap::new(),
            events: VecDeque::new(),
            phase: BusPhase::BusFree,
            atn: false,
            msgin: VecDeque::new(),
            last_msgin: Vec::new(),
            after_msgin: AfterMsgIn::Continue,
            tx: Transaction::default(),
            parked: Vec::new(),
            hold_reselect: false,
            msgout_log: Vec::new(),
            cdb_log: Vec::new(),
            data_out: Vec::new(),
            dma_log: Vec::new(),
            resets: 0,
        }
    }

    /// Installs a target script.
    pub fn add_target(&mut self, id: u8, profile: TargetProfile) {
        self.profiles.insert(id, profile);
    }

    /// Queues a reselection for a parked task, or a forged one when no
    /// task matches (stale-tag testing).
    pub fn inject_reselect(&mut self, target: u8, lun: u8, tag: Option<u8>) {
        let pos = self
            .parked
            .iter()
            .position(|p| p.target == target && p.lun == lun && p.tag == tag);
        match pos {
            Some(i) => {
                let task = self.parked.remove(i);
                self.begin_reselect(task);
            }
            None => {
                // Forged: the initiator will abort-tag it.
                self.events.push_back(BusEvent::Reselected { target });
                self.phase = BusPhase::MessageIn;
                self.msgin.clear();
                self.msgin.push_back(msg::identify(lun, true));
                if let Some(t) = tag {
                    self.msgin.push_back(msg::M_SIMPLE_TAG);
                    self.msgin.push_back(t);
                }
                self.after_msgin = AfterMsgIn::Continue;
                self.tx = Transaction {
                    target,
                    lun,
                    tag,
                    got_cdb: true,
                    resumed: true,
                    data_done: true,
                    ..Transaction::default()
                };
                self.events.push_back(BusEvent::PhaseChange);
            }
        }
    }

    /// Parked tasks not yet reselected.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Drives a waiting target forward: a stalled phase ends, a late
    /// ATN is honored.
    pub fn nudge(&mut self) {
        self.continue_transaction();
    }

    /// Queues one message-in group and remembers it for resends.
    fn push_msgin(&mut self, bytes: &[u8]) {
        self.last_msgin = bytes.to_vec();
        self.msgin.extend(bytes.iter().copied());
    }

    fn set_phase(&mut self, phase: BusPhase) {
        self.phase = phase;
        self.events.push_back(BusEvent::PhaseChange);
    }

    fn profile(&self, target: u8) -> TargetProfile {
        self.profiles.get(&target).cloned().unwrap_or(TargetProfile {
            exists: false,
            ..TargetProfile::default()
        })
    }

    fn go_bus_free(&mut self) {
        log::trace!("sim: bus free ({} parked)", self.parked.len());
        self.phase = BusPhase::BusFree;
        self.atn = false;
        self.msgin.clear();
        self.events.push_back(BusEvent::BusFree);
        if !self.hold_reselect {
            if let Some(task) = (!self.parked.is_empty()).then(|| self.parked.remove(0)) {
                self.begin_reselect(task);
            }
        }
    }

    fn begin_reselect(&mut self, task: ParkedTask) {
        self.events.push_back(BusEvent::Reselected {
            target: task.target,
        });
        self.msgin.clear();
        self.msgin.push_back(msg::identify(task.lun, true));
        if let Some(tag) = task.tag {
            self.msgin.push_back(msg::M_SIMPLE_TAG);
            self.msgin.push_back(tag);
        }
        self.after_msgin = AfterMsgIn::Continue;
        self.tx = Transaction {
            target: task.target,
            lun: task.lun,
            tag: task.tag,
            disc_priv: true,
            got_cdb: true,
            resumed: true,
            dir: task.dir,
            data: task.data,
            data_pos: 0,
            status: task.status,
            data_done: false,
            aborting: false,
            nego_done: true,
        };
        self.phase = BusPhase::MessageIn;
        self.events.push_back(BusEvent::PhaseChange);
    }

    /// Next phase once the initiator has nothing more to say.
    fn continue_transaction(&mut self) {
        if self.tx.aborting {
            self.go_bus_free();
        } else if self.atn {
            self.set_phase(BusPhase::MessageOut);
        } else if !self.msgin.is_empty() {
            self.set_phase(BusPhase::MessageIn);
        } else if !self.tx.got_cdb {
            let profile = self.profile(self.tx.target);
            if !self.tx.nego_done {
                self.tx.nego_done = true;
                if let Some((period, offset)) = profile.initiate_sdtr {
                    self.push_msgin(&[msg::M_EXTENDED, 3, msg::MX_SYNC, period, offset]);
                    self.after_msgin = AfterMsgIn::Continue;
                    self.set_phase(BusPhase::MessageIn);
                    return;
                }
                if !profile.opening_msgin.is_empty() {
                    let bytes = profile.opening_msgin.clone();
                    self.push_msgin(&bytes);
                    self.after_msgin = AfterMsgIn::Continue;
                    self.set_phase(BusPhase::MessageIn);
                    return;
                }
            }
            self.set_phase(BusPhase::CommandOut);
        } else if !self.tx.data_done && self.tx.dir != DataDir::None {
            if self.profile(self.tx.target).disconnect && self.tx.disc_priv && !self.tx.resumed {
                // Save pointers and get off the bus.
                self.parked.push(ParkedTask {
                    target: self.tx.target,
                    lun: self.tx.lun,
                    tag: self.tx.tag,
                    dir: self.tx.dir,
                    data: std::mem::take(&mut self.tx.data),
                    status: self.tx.status,
                });
                self.msgin.push_back(msg::M_SAVE_DP);
                self.msgin.push_back(msg::M_DISCONNECT);
                self.after_msgin = AfterMsgIn::BusFree;
                self.set_phase(BusPhase::MessageIn);
            } else {
                let phase = if self.tx.dir == DataDir::In {
                    BusPhase::DataIn
                } else {
                    BusPhase::DataOut
                };
                self.set_phase(phase);
            }
        } else {
            self.set_phase(BusPhase::StatusIn);
        }
    }

    /// Builds the transaction for a CDB just received.
    fn accept_cdb(&mut self, cdb: &[u8]) {
        let profile = self.profile(self.tx.target);
        let opcode = cdb[0];
        self.tx.got_cdb = true;
        let (dir, data) = match opcode {
            0x12 => (DataDir::In, profile.inquiry.clone()),
            0x03 => (DataDir::In, profile.sense.clone()),
            0x1A => (DataDir::In, profile.mode_page.clone()),
            0x08 | 0x28 => (DataDir::In, profile.data.clone()),
            0x0A | 0x2A => (DataDir::Out, Vec::new()),
            _ => (DataDir::None, Vec::new()),
        };
        self.tx.dir = dir;
        self.tx.data = data;
        self.tx.data_pos = 0;
        self.tx.data_done = dir == DataDir::None;
        self.tx.status = self.take_status(opcode);
        log::trace!(
            "sim: target {} accepted cdb {opcode:#04x}, status {:#04x}",
            self.tx.target,
            self.tx.status
        );
        self.cdb_log.push(cdb.to_vec());
    }

    fn take_status(&mut self, opcode: u8) -> u8 {
        let profile = self.profiles.get_mut(&self.tx.target);
        if let Some(p) = profile {
            if let Some(pos) = p.status_script.iter().position(|&(op, _)| op == opcode) {
                return p.status_script.remove(pos).1;
            }
        }
        0x00
    }

    /// Interprets one message-out group from the initiator.
    fn accept_msgout(&mut self, bytes: &[u8]) {
        self.msgout_log.push(bytes.to_vec());
        if self
            .profiles
            .get_mut(&self.tx.target)
            .is_some_and(|p| std::mem::take(&mut p.garble_msgout_once))
        {
            // Claim the group arrived corrupt; the initiator must
            // replay it verbatim.
            self.msgin.push_back(msg::M_PARITY);
            self.after_msgin = AfterMsgIn::Continue;
            return;
        }
        let profile = self.profile(self.tx.target);
        match bytes[0] {
            b if b & msg::M_IDENTIFY != 0 => {
                self.tx.lun = b & 0x07;
                self.tx.disc_priv = b & 0x40 != 0;
            }
            msg::M_SIMPLE_TAG | msg::M_ORDERED_TAG | msg::M_HEAD_TAG => {
                if profile.reject_tags {
                    self.msgin.push_back(msg::M_REJECT);
                    self.after_msgin = AfterMsgIn::Continue;
                } else {
                    self.tx.tag = Some(bytes[1]);
                }
            }
            msg::M_EXTENDED => match bytes.get(2) {
                Some(&msg::MX_SYNC) => {
                    if profile.reject_sdtr {
                        self.msgin.push_back(msg::M_REJECT);
                    } else if self.tx.nego_done {
                        // Our own exchange came back answered; done.
                    } else {
                        let (p, o) = profile.sdtr_answer.unwrap_or((bytes[3], bytes[4]));
                        self.msgin
                            .extend([msg::M_EXTENDED, 3, msg::MX_SYNC, p, o]);
                    }
                    self.after_msgin = AfterMsgIn::Continue;
                }
                Some(&msg::MX_WIDE) => {
                    let w = profile.wdtr_answer.unwrap_or(bytes[3]);
                    self.msgin.extend([msg::M_EXTENDED, 2, msg::MX_WIDE, w]);
                    self.after_msgin = AfterMsgIn::Continue;
                }
                _ => {
                    self.msgin.push_back(msg::M_REJECT);
                }
            },
            msg::M_PARITY => {
                // Our last message arrived mangled; send it again.
                let resend = self.last_msgin.clone();
                self.msgin.extend(resend);
                self.after_msgin = AfterMsgIn::Continue;
            }
            msg::M_TERMINATE => {
                // Cut the data phase short and report the termination
                // through the status byte.
                self.tx.data_done = true;
                self.tx.status = 0x22;
            }
            msg::M_ABORT | msg::M_ABORT_TAG | msg::M_RESET | msg::M_CLEAR_QUEUE => {
                if bytes[0] == msg::M_RESET || bytes[0] == msg::M_CLEAR_QUEUE {
                    let t = self.tx.target;
                    self.parked.retain(|p| p.target != t);
                } else if bytes[0] == msg::M_ABORT_TAG {
                    let (t, l, tag) = (self.tx.target, self.tx.lun, self.tx.tag);
                    self.parked
                        .retain(|p| !(p.target == t && p.lun == l && p.tag == tag));
                }
                self.tx.aborting = true;
            }
            _ => {}
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a [`SimBus`]; the engine gets one clone, the test
/// keeps another.
#[derive(Debug, Clone)]
pub struct SimHandle(Rc<RefCell<SimBus>>);

impl SimHandle {
    /// Wraps a bus for sharing.
    #[must_use]
    pub fn new(bus: SimBus) -> Self {
        Self(Rc::new(RefCell::new(bus)))
    }

    /// Runs `f` with the bus borrowed.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimBus) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl HbaDriver for SimHandle {
    fn arbitrate_and_select(&mut self, target: u8) -> SelectOutcome {
        let mut bus = self.0.borrow_mut();
        // A queued reselection wins arbitration over us.
        if bus
            .events
            .iter()
            .any(|e| matches!(e, BusEvent::Reselected { .. }))
        {
            return SelectOutcome::Lost;
        }
        let Some(profile) = bus.profiles.get_mut(&target) else {
            // Nobody home: the select fires, nothing answers.
            bus.tx = Transaction {
                target,
                ..Transaction::default()
            };
            bus.events.push_back(BusEvent::BusFree);
            return SelectOutcome::Ok;
        };
        if profile.lose_selections > 0 {
            profile.lose_selections -= 1;
            return SelectOutcome::Lost;
        }
        if !profile.exists {
            bus.events.push_back(BusEvent::BusFree);
            return SelectOutcome::Ok;
        }
        bus.tx = Transaction {
            target,
            ..Transaction::default()
        };
        bus.atn = true;
        bus.set_phase(BusPhase::MessageOut);
        SelectOutcome::Ok
    }

    fn current_phase(&self) -> BusPhase {
        self.0.borrow().phase
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> usize {
        let mut bus = self.0.borrow_mut();
        match bus.phase {
            BusPhase::MessageOut => {
                bus.accept_msgout(bytes);
                bus.continue_transaction();
            }
            BusPhase::CommandOut => {
                bus.accept_cdb(bytes);
                bus.continue_transaction();
            }
            BusPhase::DataOut => {
                bus.data_out.extend_from_slice(bytes);
                bus.tx.data_pos += bytes.len();
                bus.tx.data_done = true;
                bus.continue_transaction();
            }
            _ => return 0,
        }
        bytes.len()
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> usize {
        let mut bus = self.0.borrow_mut();
        match bus.phase {
            BusPhase::MessageIn => {
                // A scripted parity glitch interrupts the message; the
                // target honors ATN and waits for MESSAGE PARITY ERROR.
                let target = bus.tx.target;
                let glitch = !bus.msgin.is_empty()
                    && bus.profiles.get_mut(&target).is_some_and(|p| {
                        if p.msgin_parity_glitches > 0 {
                            p.msgin_parity_glitches -= 1;
                            true
                        } else {
                            false
                        }
                    });
                if glitch {
                    bus.events.push_back(BusEvent::ParityError {
                        phase: BusPhase::MessageIn,
                    });
                    bus.msgin.clear();
                    bus.set_phase(BusPhase::MessageOut);
                    return 0;
                }
                let Some(byte) = bus.msgin.pop_front() else {
                    let action = bus.after_msgin;
                    bus.after_msgin = AfterMsgIn::Continue;
                    match action {
                        AfterMsgIn::BusFree => bus.go_bus_free(),
                        AfterMsgIn::Continue => bus.continue_transaction(),
                    }
                    return 0;
                };
                buf[0] = byte;
                1
            }
            BusPhase::StatusIn => {
                buf[0] = bus.tx.status;
                if matches!(bus.tx.status, 0x10 | 0x14) {
                    // Intermediate status: the chain continues with the
                    // next CDB on the same connection.
                    bus.msgin.push_back(msg::M_LCOMPLETE);
                    bus.after_msgin = AfterMsgIn::Continue;
                    bus.tx.got_cdb = false;
                } else {
                    bus.msgin.push_back(msg::M_COMPLETE);
                    bus.after_msgin = AfterMsgIn::BusFree;
                }
                bus.set_phase(BusPhase::MessageIn);
                1
            }
            BusPhase::DataIn => {
                let pos = bus.tx.data_pos;
                let n = buf.len().min(bus.tx.data.len().saturating_sub(pos));
                let slice: Vec<u8> = bus.tx.data[pos..pos + n].to_vec();
                buf[..n].copy_from_slice(&slice);
                bus.tx.data_pos += n;
                bus.tx.data_done = true;
                bus.continue_transaction();
                n
            }
            _ => 0,
        }
    }

    fn data_transfer(&mut self, dir: DataDir, region: DataRegion, offset: u32, len: u32) -> u32 {
        let mut bus = self.0.borrow_mut();
        if bus.profiles.get(&bus.tx.target).is_some_and(|p| p.stall_data) {
            bus.dma_log.push((dir, region.addr, offset, 0));
            return 0;
        }
        let target = bus.tx.target;
        let glitch = bus.profiles.get_mut(&target).is_some_and(|p| {
            if p.data_parity_glitches > 0 {
                p.data_parity_glitches -= 1;
                true
            } else {
                false
            }
        });
        if glitch {
            let phase = bus.phase;
            bus.events.push_back(BusEvent::ParityError { phase });
        }
        let avail = if dir == DataDir::In {
            (bus.tx.data.len() as u32).saturating_sub(offset).min(len)
        } else {
            len
        };
        bus.dma_log.push((dir, region.addr, offset, avail));
        bus.tx.data_pos = (offset + avail) as usize;
        bus.tx.data_done = true;
        bus.continue_transaction();
        avail
    }

    fn assert_attention(&mut self) {
        self.0.borrow_mut().atn = true;
    }

    fn release_attention(&mut self) {
        self.0.borrow_mut().atn = false;
    }

    fn reset_bus(&mut self) {
        let mut bus = self.0.borrow_mut();
        bus.resets += 1;
        bus.parked.clear();
        bus.events.clear();
        bus.msgin.clear();
        bus.atn = false;
        bus.phase = BusPhase::BusFree;
        bus.tx = Transaction::default();
    }

    fn poll(&mut self) -> Option<BusEvent> {
        self.0.borrow_mut().events.pop_front()
    }
}

/// Submitter that collects completions and negotiation reports for
/// assertions.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    /// Completed commands in completion order.
    pub completed: Rc<RefCell<Vec<Command>>>,
    /// Negotiation reports as `(target, sync, wide)`.
    pub negotiated: Rc<RefCell<Vec<(u8, Option<SyncParams>, u8)>>>,
}

impl Collector {
    /// A fresh collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completions observed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.completed.borrow().len()
    }
}

impl Submitter for Collector {
    fn on_command_complete(&mut self, cmd: Command) {
        self.completed.borrow_mut().push(cmd);
    }

    fn on_negotiation_result(&mut self, target: u8, sync: Option<SyncParams>, wide: u8) {
        self.negotiated.borrow_mut().push((target, sync, wide));
    }
}
