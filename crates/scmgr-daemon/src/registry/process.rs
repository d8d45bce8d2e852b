//! Per-process component table.

use std::collections::HashMap;

use scmgr_core::component::{Rect, ScId, SecurityComponent, INVALID_SC_ID, SC_ID_BASE};
use scmgr_core::oracle::{Pid, TokenId};

/// One stored component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentEntry {
    pub sc_id: ScId,
    pub component: SecurityComponent,
}

/// State of one owning process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRegistration {
    pub token_id: TokenId,
    pub is_foreground: bool,
    /// Registration order.
    pub components: Vec<ComponentEntry>,
}

impl ProcessRegistration {
    #[must_use]
    pub const fn new(token_id: TokenId) -> Self {
        Self {
            token_id,
            is_foreground: true,
            components: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(&self, sc_id: ScId) -> Option<&ComponentEntry> {
        self.components.iter().find(|e| e.sc_id == sc_id)
    }

    pub fn get_mut(&mut self, sc_id: ScId) -> Option<&mut ComponentEntry> {
        self.components.iter_mut().find(|e| e.sc_id == sc_id)
    }

    pub fn remove(&mut self, sc_id: ScId) -> Option<ComponentEntry> {
        let index = self.components.iter().position(|e| e.sc_id == sc_id)?;
        Some(self.components.remove(index))
    }

    /// First component whose on-screen rect intersects `rect`, skipping
    /// `except`.
    #[must_use]
    pub fn overlapping(&self, rect: &Rect, except: Option<ScId>) -> Option<ScId> {
        self.components
            .iter()
            .filter(|e| Some(e.sc_id) != except)
            .find(|e| e.component.screen_rect().intersects(rect))
            .map(|e| e.sc_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Every process's registrations plus the id allocator. Guarded as one unit
/// by the registry's reader/writer lock.
#[derive(Debug)]
pub struct ComponentTable {
    pub processes: HashMap<Pid, ProcessRegistration>,
    next_id: ScId,
}

impl Default for ComponentTable {
    fn default() -> Self {
        Self::with_next_id(SC_ID_BASE)
    }
}

impl ComponentTable {
    /// Table whose next allocation starts at `next_id`.
    #[must_use]
    pub fn with_next_id(next_id: ScId) -> Self {
        Self {
            processes: HashMap::new(),
            next_id: if next_id < SC_ID_BASE { SC_ID_BASE } else { next_id },
        }
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.processes.values().map(ProcessRegistration::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    fn is_live(&self, sc_id: ScId) -> bool {
        self.processes
            .values()
            .any(|p| p.get(sc_id).is_some())
    }

    /// Next free id. Increases until `i32::MAX`, then wraps to the base;
    /// never yields a live id or the invalid sentinel.
    pub fn allocate_id(&mut self) -> Option<ScId> {
        let span = i64::from(ScId::MAX) - i64::from(SC_ID_BASE) + 1;
        let mut attempts: i64 = 0;
        while attempts < span {
            let candidate = self.next_id;
            self.next_id = if candidate == ScId::MAX {
                SC_ID_BASE
            } else {
                candidate + 1
            };
            attempts += 1;
            if candidate != INVALID_SC_ID && !self.is_live(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Owner and entry of `sc_id` within `pid`.
    #[must_use]
    pub fn lookup(&self, pid: Pid, sc_id: ScId) -> Option<&ComponentEntry> {
        self.processes.get(&pid)?.get(sc_id)
    }

    pub fn lookup_mut(&mut self, pid: Pid, sc_id: ScId) -> Option<&mut ComponentEntry> {
        self.processes.get_mut(&pid)?.get_mut(sc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_wraps_to_base() {
        let mut table = ComponentTable::with_next_id(ScId::MAX - 1);
        assert_eq!(table.allocate_id(), Some(ScId::MAX - 1));
        assert_eq!(table.allocate_id(), Some(ScId::MAX));
        assert_eq!(table.allocate_id(), Some(SC_ID_BASE));
        assert_eq!(table.allocate_id(), Some(SC_ID_BASE + 1));
    }

    #[test]
    fn test_base_floor() {
        let mut table = ComponentTable::with_next_id(-1);
        assert_eq!(table.allocate_id(), Some(SC_ID_BASE));
    }
}
