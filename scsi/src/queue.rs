//! The start queue and per-LUN admission control.
//!
//! The scheduler's only job is admission: picking which queued command
//! may next contend for the bus. Transfer scheduling belongs to the bus
//! itself.

use alloc::collections::VecDeque;

use crate::command::{CmdFlags, CmdId, Command};
use crate::device::{Discovery, LunCaps, LunState};

/// Ordered queue of commands not yet given the bus.
#[derive(Debug, Default)]
pub struct StartQueue {
    q: VecDeque<CmdId>,
}

impl StartQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { q: VecDeque::new() }
    }

    /// Appends at the tail, or the head for urgent commands.
    pub fn push(&mut self, id: CmdId, urgent: bool) {
        if urgent {
            self.q.push_front(id);
        } else {
            self.q.push_back(id);
        }
    }

    /// Puts a command back at the head (failed selection, retry-now).
    pub fn push_front(&mut self, id: CmdId) {
        self.q.push_front(id);
    }

    /// Removes a specific command; returns whether it was present.
    pub fn remove(&mut self, id: CmdId) -> bool {
        if let Some(pos) = self.q.iter().position(|&x| x == id) {
            self.q.remove(pos);
            true
        } else {
            false
        }
    }

    /// Pops the given command, which must be a member.
    pub(crate) fn take(&mut self, id: CmdId) {
        let removed = self.remove(id);
        debug_assert!(removed, "command not in start queue");
    }

    /// In-order iteration.
    pub fn iter(&self) -> impl Iterator<Item = CmdId> + '_ {
        self.q.iter().copied()
    }

    /// The command that would be considered first.
    #[must_use]
    pub fn head(&self) -> Option<CmdId> {
        self.q.front().copied()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

/// Whether `cmd` may be started against `lun` right now.
///
/// Recovery commands bypass everything; ordinary commands wait for
/// discovery, contingent allegiance, the untagged-exclusivity rule and
/// the tag window.
#[must_use]
pub fn eligible(cmd: &Command, lun: &LunState) -> bool {
    if cmd.flags.contains(CmdFlags::CA_RECOVERY) {
        return true;
    }
    if lun.ca_recovery {
        return false;
    }
    // Discovery probes are internal; everything else waits for them.
    if lun.discovery != Discovery::Ok && !cmd.flags.contains(CmdFlags::INTERNAL) {
        return false;
    }
    if lun.untagged_busy {
        return false;
    }
    if lun.caps.contains(LunCaps::TAGGED) && !cmd.flags.contains(CmdFlags::INTERNAL) {
        lun.tagged_count < lun.window
    } else {
        // Untagged operation: one command at a time.
        lun.idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hba::DataDir;

    fn mkcmd() -> Command {
        Command::new(1, 0, &[0x00, 0, 0, 0, 0, 0], DataDir::None, None)
    }

    fn ready_lun() -> LunState {
        let mut lun = LunState::new();
        lun.discovery = Discovery::Ok;
        lun
    }

    #[test]
    fn urgent_goes_to_the_head() {
        let mut q = StartQueue::new();
        q.push(CmdId(1), false);
        q.push(CmdId(2), false);
        q.push(CmdId(3), true);
        let order: alloc::vec::Vec<_> = q.iter().collect();
        assert_eq!(order, [CmdId(3), CmdId(1), CmdId(2)]);
    }

    #[test]
    fn remove_reports_membership() {
        let mut q = StartQueue::new();
        q.push(CmdId(1), false);
        assert!(q.remove(CmdId(1)));
        assert!(!q.remove(CmdId(1)));
        assert!(q.is_empty());
    }

    #[test]
    fn untagged_lun_admits_one() {
        let mut lun = ready_lun();
        assert!(eligible(&mkcmd(), &lun));
        lun.untagged_busy = true;
        assert!(!eligible(&mkcmd(), &lun));
    }

    #[test]
    fn tagged_lun_admits_up_to_window() {
        let mut lun = ready_lun();
        lun.caps |= LunCaps::TAGGED;
        lun.max_window = 2;
        lun.window = 2;
        assert!(eligible(&mkcmd(), &lun));
        lun.allocate_tag();
        assert!(eligible(&mkcmd(), &lun));
        lun.allocate_tag();
        assert!(!eligible(&mkcmd(), &lun));
    }

    #[test]
    fn recovery_command_bypasses_window_and_ca() {
        let mut lun = ready_lun();
        lun.caps |= LunCaps::TAGGED;
        lun.window = 0;
        lun.ca_recovery = true;
        let mut c = mkcmd();
        c.flags |= CmdFlags::CA_RECOVERY;
        assert!(eligible(&c, &lun));
        assert!(!eligible(&mkcmd(), &lun));
    }

    #[test]
    fn undiscovered_lun_blocks_user_commands() {
        let mut lun = LunState::new();
        assert!(!eligible(&mkcmd(), &lun));
        let mut probe = mkcmd();
        probe.flags |= CmdFlags::INTERNAL;
        assert!(eligible(&probe, &lun));
        lun.discovery = Discovery::Ok;
        assert!(eligible(&mkcmd(), &lun));
    }
}
