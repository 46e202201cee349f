//! Least-recently-used order over cache slots.
//!
//! The order is an append-only array: touching a slot punches a hole at its
//! old position and re-appends it at the most-recently-used end. Holes are
//! reclaimed by an amortized compaction pass that preserves the relative
//! order of live entries.

/// Sentinel cache-slot id
pub const INVALID_SLOT: u32 = u32::MAX;

const INVALID_POSITION: u32 = u32::MAX;

/// How many holes beyond double the live count trigger compaction
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Default)]
pub struct LruRegistry {
    /// Oldest first; `INVALID_SLOT` marks a hole
    order: Vec<u32>,
    /// Slot id -> position in `order`
    positions: Vec<u32>,
    live: usize,
}

impl LruRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.positions
            .get(slot as usize)
            .is_some_and(|&p| p != INVALID_POSITION)
    }

    /// Add `slot` at the most-recently-used end
    pub fn insert(&mut self, slot: u32) {
        debug_assert!(!self.contains(slot));
        if self.positions.len() <= slot as usize {
            self.positions.resize(slot as usize + 1, INVALID_POSITION);
        }
        self.positions[slot as usize] = self.order.len() as u32;
        self.order.push(slot);
        self.live += 1;
    }

    /// Move `slot` to the most-recently-used end
    pub fn touch(&mut self, slot: u32) {
        let position = self.positions[slot as usize];
        debug_assert_ne!(position, INVALID_POSITION);
        if position as usize + 1 == self.order.len() {
            return;
        }
        self.order[position as usize] = INVALID_SLOT;
        self.positions[slot as usize] = self.order.len() as u32;
        self.order.push(slot);
    }

    pub fn remove(&mut self, slot: u32) {
        let position = self.positions[slot as usize];
        debug_assert_ne!(position, INVALID_POSITION);
        self.order[position as usize] = INVALID_SLOT;
        self.positions[slot as usize] = INVALID_POSITION;
        self.live -= 1;
    }

    /// Live slots from least- to most-recently-used
    pub fn iter_oldest(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.iter().copied().filter(|&s| s != INVALID_SLOT)
    }

    /// Compact when holes dominate the order array
    pub fn maybe_compact(&mut self) {
        if self.order.len() > 2 * self.live + COMPACT_SLACK {
            self.compact();
        }
    }

    pub fn compact(&mut self) {
        self.order.retain(|&s| s != INVALID_SLOT);
        for (position, &slot) in self.order.iter().enumerate() {
            self.positions[slot as usize] = position as u32;
        }
        debug_assert!(self.verify().is_empty());
    }

    /// Consistency check: every live entry round-trips through the position
    /// index and the live count matches. Returns violation descriptions.
    pub fn verify(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen = 0usize;
        for (position, &slot) in self.order.iter().enumerate() {
            if slot == INVALID_SLOT {
                continue;
            }
            seen += 1;
            if self.positions.get(slot as usize) != Some(&(position as u32)) {
                violations.push(format!(
                    "slot {} at position {} does not round-trip",
                    slot, position
                ));
            }
        }
        if seen != self.live {
            violations.push(format!(
                "live count {} but {} live entries in order",
                self.live, seen
            ));
        }
        violations
    }
}
