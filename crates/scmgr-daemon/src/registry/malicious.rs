//! Quarantined process set.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use scmgr_core::oracle::{Pid, Uid};

/// Root never gets quarantined.
pub const ROOT_UID: Uid = 0;

/// Processes flagged after a failed integrity or tamper check. A flag lasts
/// until the process dies.
#[derive(Debug, Default)]
pub struct MaliciousSet {
    pids: Mutex<HashSet<Pid>>,
}

impl MaliciousSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags `pid`. Returns `true` if the pid was newly flagged; root-owned
    /// processes are never flagged.
    pub fn mark(&self, pid: Pid, uid: Uid) -> bool {
        if uid == ROOT_UID {
            return false;
        }
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid)
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pid)
    }

    /// Returns `true` if `pid` was flagged.
    pub fn clear(&self, pid: Pid) -> bool {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let set = MaliciousSet::new();
        assert!(set.mark(100, 20_010));
        assert!(!set.mark(100, 20_010));
        assert!(set.contains(100));
        assert!(set.clear(100));
        assert!(!set.clear(100));
        assert!(set.is_empty());
    }

    #[test]
    fn test_root_exempt() {
        let set = MaliciousSet::new();
        assert!(!set.mark(1, ROOT_UID));
        assert!(!set.contains(1));
    }
}
