//! Circular byte arena for staging in-flight fetch payloads.
//!
//! Allocation and free order are coupled: `free` always releases the oldest
//! outstanding allocation, matching the FIFO completion order of the pending
//! page queue. When the tail request does not fit before the buffer end the
//! allocator wraps to offset 0 and the skipped bytes stay reserved until the
//! wrapped block is freed. One byte of slack is kept so a completely full
//! ring is distinguishable from an empty one.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct RingBlock {
    offset: u32,
    size: u32,
    /// size plus any wrap padding reserved ahead of this block
    padded: u32,
}

/// FIFO circular allocator over a fixed byte capacity
pub struct RingAllocator {
    capacity: u32,
    /// Next allocation offset
    head: u32,
    /// Bytes currently reserved, wrap padding included
    used: u32,
    live: VecDeque<RingBlock>,
    peak_used: u32,
    failed_allocs: u64,
}

impl RingAllocator {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 1, "ring capacity must exceed the sentinel byte");
        Self {
            capacity,
            head: 0,
            used: 0,
            live: VecDeque::new(),
            peak_used: 0,
            failed_allocs: 0,
        }
    }

    /// Reserve `size` bytes, returning the byte offset of the block.
    ///
    /// Returns `None` when the ring cannot take the block this cycle; the
    /// caller retries on a later cycle once older blocks have been freed.
    pub fn try_allocate(&mut self, size: u32) -> Option<u32> {
        debug_assert!(size > 0, "zero-size ring allocation");
        let (offset, padded) = if self.head + size > self.capacity {
            // Wrap: the gap from head to the end rides along with this block.
            (0, size + (self.capacity - self.head))
        } else {
            (self.head, size)
        };

        // One byte of slack keeps full and empty states distinguishable.
        if self.used + padded > self.capacity - 1 {
            self.failed_allocs += 1;
            log::debug!(
                "[RingAllocator] allocation of {} bytes deferred ({}/{} in use)",
                size,
                self.used,
                self.capacity
            );
            return None;
        }

        self.used += padded;
        self.peak_used = self.peak_used.max(self.used);
        self.head = (offset + size) % self.capacity;
        self.live.push_back(RingBlock {
            offset,
            size,
            padded,
        });
        Some(offset)
    }

    /// Release the oldest outstanding allocation.
    ///
    /// `size` must match that allocation's size; a mismatch means allocation
    /// and completion order have diverged, which is a caller bug.
    pub fn free(&mut self, size: u32) {
        let block = self
            .live
            .pop_front()
            .unwrap_or_else(|| panic!("[RingAllocator] free({}) with no live allocations", size));
        assert_eq!(
            block.size, size,
            "[RingAllocator] free size {} does not match oldest allocation {}",
            size, block.size
        );
        self.used -= block.padded;
        if self.live.is_empty() {
            debug_assert_eq!(self.used, 0);
            self.head = 0;
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn peak_used(&self) -> u32 {
        self.peak_used
    }

    pub fn failed_allocs(&self) -> u64 {
        self.failed_allocs
    }

    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
