//! Per-target and per-LUN state.
//!
//! Both are created lazily on first reference and persist for the life of
//! the engine; a bus reset clears their negotiated state but never frees
//! them. Commands refer to them by (target, lun) index, never by pointer.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;

use bitflags::bitflags;

use crate::command::CmdId;

/// Highest addressable target id (wide bus).
pub const MAX_TARGET: u8 = 16;
/// Highest addressable LUN.
pub const MAX_LUN: u8 = 8;
/// Hard ceiling on tags per LUN (one bitmap word).
pub const MAX_TAGS: u8 = 32;

bitflags! {
    /// Capabilities a LUN has actually been granted.
    ///
    /// Derived as adapter policy ∩ device quirks ∩ probed capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LunCaps: u8 {
        /// May disconnect mid-command.
        const DISCONNECT = 1 << 0;
        /// Tagged queuing enabled.
        const TAGGED = 1 << 1;
        /// Linked commands permitted.
        const LINKED = 1 << 2;
    }
}

bitflags! {
    /// Device quirk bits, looked up from INQUIRY identity data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quirks: u8 {
        /// Never negotiate synchronous transfers.
        const NO_SYNC = 1 << 0;
        /// Never negotiate wide transfers.
        const NO_WIDE = 1 << 1;
        /// Never use tagged queuing.
        const NO_TAGS = 1 << 2;
        /// Never grant disconnect privilege.
        const NO_DISCONNECT = 1 << 3;
        /// Device loses data pointers across disconnect; save eagerly.
        const AUTOSAVE = 1 << 4;
    }
}

/// Known-broken device identities, matched against INQUIRY vendor and
/// product fields (bytes 8..32, prefix match).
static QUIRK_TABLE: &[(&str, Quirks)] = &[
    ("CONNER  CP3500", Quirks::NO_SYNC),
    ("FUJITSU M2512A", Quirks::NO_TAGS),
    ("IOMEGA  ZIP", Quirks::NO_TAGS.union(Quirks::NO_WIDE)),
    ("QUANTUM LPS525S", Quirks::NO_SYNC.union(Quirks::NO_TAGS)),
    ("SEAGATE ST296", Quirks::AUTOSAVE),
    ("TANDBERG TDC 3600", Quirks::NO_DISCONNECT),
];

/// Looks up quirk bits for a device's INQUIRY identity bytes.
#[must_use]
pub fn quirk_lookup(inq: &[u8]) -> Quirks {
    if inq.len() < 32 {
        return Quirks::empty();
    }
    let ident = &inq[8..32];
    for (prefix, quirks) in QUIRK_TABLE {
        let p = prefix.as_bytes();
        if ident.len() >= p.len() && &ident[..p.len()] == p {
            return *quirks;
        }
    }
    Quirks::empty()
}

/// Tag-release failure: the tag was not allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagNotAllocated;

/// LUN discovery: automatic setup probes run before the first user
/// command is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Nothing known yet.
    Sleep,
    /// START UNIT probe outstanding.
    StartUnit,
    /// INQUIRY probe outstanding.
    Inquiry,
    /// MODE SENSE (control mode page) probe outstanding.
    ModeSenseQueueFlags,
    /// Discovery finished; user commands admitted.
    Ok,
}

/// Per-LUN state.
#[derive(Debug)]
pub struct LunState {
    /// Granted capabilities.
    pub caps: LunCaps,
    /// Tag allocation bitmap; bit n set = tag n outstanding.
    tag_bitmap: u32,
    /// Count of outstanding tagged commands.
    pub tagged_count: u8,
    /// Current admission window, moved by QUEUE FULL / GOOD.
    pub window: u8,
    /// Negotiated ceiling the window may regrow to.
    pub max_window: u8,
    /// Consecutive GOOD completions since the last window change;
    /// drives regrowth.
    pub good_streak: u8,
    /// An untagged command is outstanding on this LUN.
    pub untagged_busy: bool,
    /// Disconnected commands, in disconnect order.
    pub disc_queue: VecDeque<CmdId>,
    /// Shadow counter; must equal `disc_queue.len()`.
    pub disc_count: u32,
    /// Contingent allegiance: only the recovery command is admitted.
    pub ca_recovery: bool,
    /// Command parked awaiting its autosense results.
    pub held: Option<CmdId>,
    /// Discovery progress.
    pub discovery: Discovery,
    /// The in-flight probe command, if any.
    pub probe: Option<CmdId>,
}

impl LunState {
    pub(crate) fn new() -> Self {
        Self {
            caps: LunCaps::empty(),
            tag_bitmap: 0,
            tagged_count: 0,
            window: 1,
            max_window: 1,
            good_streak: 0,
            untagged_busy: false,
            disc_queue: VecDeque::new(),
            disc_count: 0,
            ca_recovery: false,
            held: None,
            discovery: Discovery::Sleep,
            probe: None,
        }
    }

    /// Draws the lowest free tag, or `None` when the bitmap is exhausted.
    pub fn allocate_tag(&mut self) -> Option<u8> {
        let free = !self.tag_bitmap;
        if free == 0 {
            return None;
        }
        let tag = free.trailing_zeros() as u8;
        if tag >= MAX_TAGS {
            return None;
        }
        self.tag_bitmap |= 1 << tag;
        self.tagged_count += 1;
        Some(tag)
    }

    /// Returns a tag to the bitmap.
    ///
    /// # Errors
    ///
    /// Releasing a tag that is not allocated is a programming error and
    /// is rejected, never silently absorbed.
    pub fn release_tag(&mut self, tag: u8) -> Result<(), TagNotAllocated> {
        let bit = 1u32 << tag;
        if tag >= MAX_TAGS || self.tag_bitmap & bit == 0 {
            debug_assert!(false, "release of unallocated tag {tag}");
            return Err(TagNotAllocated);
        }
        self.tag_bitmap &= !bit;
        self.tagged_count -= 1;
        Ok(())
    }

    /// True if the given tag is currently outstanding.
    #[must_use]
    pub fn tag_outstanding(&self, tag: u8) -> bool {
        tag < MAX_TAGS && self.tag_bitmap & (1 << tag) != 0
    }

    /// Applies a QUEUE FULL: the window shrinks to what the target
    /// actually accepted.
    pub(crate) fn shrink_window(&mut self) {
        // The triggering command is still counted; the target accepted
        // one fewer than we have outstanding.
        self.window = self.tagged_count.saturating_sub(1).max(1);
        self.good_streak = 0;
    }

    /// Applies a GOOD completion: after a run of clean completions the
    /// window creeps back toward the negotiated ceiling.
    pub(crate) fn note_good(&mut self) {
        if self.window >= self.max_window {
            return;
        }
        self.good_streak += 1;
        if self.good_streak >= 8 {
            self.good_streak = 0;
            self.window += 1;
        }
    }

    /// Whether this LUN has any command outstanding on the target.
    #[must_use]
    pub fn idle(&self) -> bool {
        !self.untagged_busy && self.tagged_count == 0
    }
}

/// Direction of an in-flight transfer negotiation we are party to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegoPhase {
    /// No negotiation outstanding.
    Idle,
    /// We sent SDTR and await the answer.
    SyncSent,
    /// We sent WDTR and await the answer.
    WideSent,
    /// Target-initiated SDTR; our answer is pending in message-out.
    SyncReply,
    /// Target-initiated WDTR; our answer is pending in message-out.
    WideReply,
}

bitflags! {
    /// Setup messages still owed to a target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetupMsgs: u8 {
        /// Synchronous negotiation wanted.
        const SYNC = 1 << 0;
        /// Wide negotiation wanted.
        const WIDE = 1 << 1;
    }
}

/// Per-target state.
#[derive(Debug)]
pub struct TargetState {
    /// Goal period factor for negotiation (requested value).
    pub goal_period: u8,
    /// Goal offset for negotiation (requested value).
    pub goal_offset: u8,
    /// Goal width exponent.
    pub goal_width: u8,
    /// Agreed period factor; meaningful when `offset > 0`.
    pub period: u8,
    /// Agreed offset; zero = asynchronous (the active value).
    pub offset: u8,
    /// Agreed width exponent (the active value).
    pub width: u8,
    /// Negotiations still owed (sync/wide renegotiation pending).
    pub setup: SetupMsgs,
    /// Negotiation in flight.
    pub nego: NegoPhase,
    /// Answer values for a target-initiated exchange.
    pub reply_period: u8,
    /// Answer offset for a target-initiated exchange.
    pub reply_offset: u8,
    /// Answer width for a target-initiated exchange.
    pub reply_width: u8,
    /// Shadow counter; must equal the sum of this target's LUN counts.
    pub disc_count: u32,
    /// Quirk bits from the INQUIRY identity lookup.
    pub quirks: Quirks,
    /// Message-in parse buffer.
    pub msgbuf: [u8; 16],
    /// Bytes of the current message received so far; may exceed the
    /// buffer for a message too long to store (then rejected whole).
    pub msglen: u16,
    /// Per-LUN state, created on first reference.
    pub luns: BTreeMap<u8, LunState>,
}

impl TargetState {
    pub(crate) fn new() -> Self {
        Self {
            goal_period: 0,
            goal_offset: 0,
            goal_width: 0,
            period: 0,
            offset: 0,
            width: 0,
            setup: SetupMsgs::empty(),
            nego: NegoPhase::Idle,
            reply_period: 0,
            reply_offset: 0,
            reply_width: 0,
            disc_count: 0,
            quirks: Quirks::empty(),
            msgbuf: [0; 16],
            msglen: 0,
            luns: BTreeMap::new(),
        }
    }

    /// The LUN state, created on first reference.
    pub fn lun_mut(&mut self, lun: u8) -> &mut LunState {
        self.luns.entry(lun).or_insert_with(LunState::new)
    }

    /// Clears negotiated transfer state; the next command renegotiates.
    /// Called on bus reset. Queue state is untouched.
    pub(crate) fn reset_negotiation(&mut self) {
        self.period = 0;
        self.offset = 0;
        self.width = 0;
        self.nego = NegoPhase::Idle;
        if self.goal_offset > 0 {
            self.setup |= SetupMsgs::SYNC;
        }
        if self.goal_width > 0 {
            self.setup |= SetupMsgs::WIDE;
        }
        self.msglen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_allocation_draws_lowest_free() {
        let mut lun = LunState::new();
        assert_eq!(lun.allocate_tag(), Some(0));
        assert_eq!(lun.allocate_tag(), Some(1));
        lun.release_tag(0).unwrap();
        assert_eq!(lun.allocate_tag(), Some(0));
        assert_eq!(lun.tagged_count, 2);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unallocated tag"))]
    fn double_release_is_rejected() {
        let mut lun = LunState::new();
        let tag = lun.allocate_tag().unwrap();
        lun.release_tag(tag).unwrap();
        assert_eq!(lun.release_tag(tag), Err(TagNotAllocated));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unallocated tag"))]
    fn release_of_never_allocated_tag_is_rejected() {
        let mut lun = LunState::new();
        assert_eq!(lun.release_tag(5), Err(TagNotAllocated));
    }

    #[test]
    fn bitmap_exhaustion_returns_none() {
        let mut lun = LunState::new();
        for expected in 0..MAX_TAGS {
            assert_eq!(lun.allocate_tag(), Some(expected));
        }
        assert_eq!(lun.allocate_tag(), None);
    }

    #[test]
    fn queue_full_shrinks_window_to_accepted_count() {
        let mut lun = LunState::new();
        lun.max_window = 8;
        lun.window = 8;
        for _ in 0..3 {
            lun.allocate_tag();
        }
        lun.shrink_window();
        assert_eq!(lun.window, 2);
    }

    #[test]
    fn window_regrows_after_good_streak() {
        let mut lun = LunState::new();
        lun.max_window = 4;
        lun.window = 2;
        for _ in 0..7 {
            lun.note_good();
        }
        assert_eq!(lun.window, 2);
        lun.note_good();
        assert_eq!(lun.window, 3);
        // Never past the ceiling.
        for _ in 0..32 {
            lun.note_good();
        }
        assert!(lun.window <= 4);
    }

    #[test]
    fn quirk_lookup_matches_vendor_product_prefix() {
        let mut inq = [0x20u8; 36];
        inq[8..8 + 24].copy_from_slice(b"IOMEGA  ZIP 100         ");
        assert_eq!(quirk_lookup(&inq), Quirks::NO_TAGS | Quirks::NO_WIDE);

        let mut other = [0x20u8; 36];
        other[8..8 + 7].copy_from_slice(b"NODEVIC");
        assert_eq!(quirk_lookup(&other), Quirks::empty());
        assert_eq!(quirk_lookup(&[0u8; 8]), Quirks::empty());
    }

    #[test]
    fn reset_negotiation_rearms_setup_messages() {
        let mut t = TargetState::new();
        t.goal_offset = 8;
        t.goal_width = 1;
        t.period = 25;
        t.offset = 8;
        t.width = 1;
        t.reset_negotiation();
        assert_eq!(t.offset, 0);
        assert_eq!(t.width, 0);
        assert_eq!(t.setup, SetupMsgs::SYNC | SetupMsgs::WIDE);
    }
}
