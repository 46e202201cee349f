//! Flat virtual-page index space.
//!
//! Every page of every registered resource owns one entry in a single flat
//! namespace, identified by `resource.virtual_page_base + local_page_index`.
//! The entry links the page to its cache slot (if registered) and
//! accumulates this cycle's request priority. Priorities are transient: a
//! touched list remembers which entries to clear so the end-of-cycle reset
//! never walks the whole table.

use crate::registry::lru::INVALID_SLOT;

#[derive(Debug, Clone, Copy)]
pub struct VirtualPageEntry {
    /// Cache slot currently reserved for this page, or `INVALID_SLOT`
    pub registered_slot: u32,
    /// Max-merged request priority; 0 = unrequested this cycle
    pub priority: u32,
}

const EMPTY_ENTRY: VirtualPageEntry = VirtualPageEntry {
    registered_slot: INVALID_SLOT,
    priority: 0,
};

#[derive(Debug, Default)]
pub struct VirtualPageTable {
    entries: Vec<VirtualPageEntry>,
    touched: Vec<u32>,
}

impl VirtualPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the table to cover virtual indices below `len`
    pub fn ensure_capacity(&mut self, len: u32) {
        if self.entries.len() < len as usize {
            self.entries.resize(len as usize, EMPTY_ENTRY);
        }
    }

    /// Max-merge `priority` into the entry. Returns true when the stored
    /// priority was raised, i.e. dependency propagation must revisit it.
    pub fn accumulate(&mut self, virtual_index: u32, priority: u32) -> bool {
        let entry = &mut self.entries[virtual_index as usize];
        if priority <= entry.priority {
            return false;
        }
        if entry.priority == 0 {
            self.touched.push(virtual_index);
        }
        entry.priority = priority;
        true
    }

    pub fn priority(&self, virtual_index: u32) -> u32 {
        self.entries[virtual_index as usize].priority
    }

    pub fn registered_slot(&self, virtual_index: u32) -> u32 {
        self.entries[virtual_index as usize].registered_slot
    }

    pub fn set_registered_slot(&mut self, virtual_index: u32, slot: u32) {
        self.entries[virtual_index as usize].registered_slot = slot;
    }

    pub fn clear_registered_slot(&mut self, virtual_index: u32) {
        self.entries[virtual_index as usize].registered_slot = INVALID_SLOT;
    }

    /// Virtual indices requested this cycle, in first-touch order
    pub fn touched(&self) -> &[u32] {
        &self.touched
    }

    pub fn distinct_requested(&self) -> u32 {
        self.touched.len() as u32
    }

    /// Clear this cycle's priorities without disturbing slot links
    pub fn reset_touched(&mut self) {
        for virtual_index in self.touched.drain(..) {
            self.entries[virtual_index as usize].priority = 0;
        }
    }
}
