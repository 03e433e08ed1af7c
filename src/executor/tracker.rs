//! Shared registry of running child process groups.
//!
//! Every run-test child starts in its own process group because it forks
//! helpers of its own (dalvikvm, adb, dex2oat); killing just the direct
//! child would orphan the subtree. The tracker records the group of every
//! live child so cancellation can SIGKILL all of them, and it *seals*
//! itself once killed: a registration that races with cancellation kills
//! its child on arrival instead of leaking it.

use std::collections::HashSet;
use std::sync::Mutex;

/// Mutex-guarded set of live process-group ids.
///
/// `None` means sealed: `kill_all` has run and no new child may live.
#[derive(Debug)]
pub struct ChildTracker {
    groups: Mutex<Option<HashSet<u32>>>,
}

impl ChildTracker {
    pub fn new() -> ChildTracker {
        ChildTracker {
            groups: Mutex::new(Some(HashSet::new())),
        }
    }

    /// Registers a child's process group.
    ///
    /// Returns false when the tracker has been sealed; in that case the
    /// group has already been killed and the caller must treat the child
    /// as cancelled rather than report a result for it.
    pub fn register(&self, pgid: u32) -> bool {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        match groups.as_mut() {
            Some(live) => {
                live.insert(pgid);
                true
            }
            None => {
                kill_group(pgid);
                false
            }
        }
    }

    /// Drops a group from the live set once its child has been reaped.
    pub fn deregister(&self, pgid: u32) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(live) = groups.as_mut() {
            live.remove(&pgid);
        }
    }

    /// Group-kills every live child and seals the tracker.
    pub fn kill_all(&self) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(live) = groups.take() {
            for pgid in live {
                kill_group(pgid);
            }
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> Option<usize> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.as_ref().map(|live| live.len())
    }
}

impl Default for ChildTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends SIGKILL to a whole process group.
pub(crate) fn kill_group(pgid: u32) {
    // SAFETY: plain syscall; a stale pgid yields ESRCH, which is ignored.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}
