//! First-fit contiguous span allocator.
//!
//! Backs the virtual page index space, root pool slots, and the shared
//! hierarchy buffer. Blocks are kept sorted by offset and free neighbors are
//! coalesced on release, so fragmentation only comes from allocation order.

/// A span relocation produced by [`SpanAllocator::compact`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanMove {
    pub old_offset: u32,
    pub new_offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
struct SpanBlock {
    offset: u32,
    size: u32,
    free: bool,
}

/// Allocator for contiguous element spans inside a fixed capacity
#[derive(Debug)]
pub struct SpanAllocator {
    capacity: u32,
    blocks: Vec<SpanBlock>,
    used: u32,
}

impl SpanAllocator {
    pub fn new(capacity: u32) -> Self {
        let blocks = if capacity > 0 {
            vec![SpanBlock {
                offset: 0,
                size: capacity,
                free: true,
            }]
        } else {
            Vec::new()
        };
        Self {
            capacity,
            blocks,
            used: 0,
        }
    }

    /// Allocate a contiguous span of `count` elements, first fit
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        debug_assert!(count > 0, "zero-size span allocation");
        let index = self
            .blocks
            .iter()
            .position(|b| b.free && b.size >= count)?;
        let offset = self.blocks[index].offset;
        if self.blocks[index].size == count {
            self.blocks[index].free = false;
        } else {
            self.blocks[index].offset += count;
            self.blocks[index].size -= count;
            self.blocks.insert(
                index,
                SpanBlock {
                    offset,
                    size: count,
                    free: false,
                },
            );
        }
        self.used += count;
        Some(offset)
    }

    /// Release the span starting at `offset`, coalescing free neighbors
    pub fn free(&mut self, offset: u32) {
        let index = self
            .blocks
            .iter()
            .position(|b| b.offset == offset && !b.free)
            .unwrap_or_else(|| panic!("[SpanAllocator] free of unallocated offset {}", offset));
        self.blocks[index].free = true;
        self.used -= self.blocks[index].size;

        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            self.blocks[index].size += self.blocks[index + 1].size;
            self.blocks.remove(index + 1);
        }
        if index > 0 && self.blocks[index - 1].free {
            self.blocks[index - 1].size += self.blocks[index].size;
            self.blocks.remove(index);
        }
    }

    /// Repack all live spans to the front, preserving their order.
    ///
    /// Returns the moves the caller must mirror on any storage addressed by
    /// these offsets.
    pub fn compact(&mut self) -> Vec<SpanMove> {
        let mut moves = Vec::new();
        let mut next = 0u32;
        let mut packed = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter().filter(|b| !b.free) {
            if block.offset != next {
                moves.push(SpanMove {
                    old_offset: block.offset,
                    new_offset: next,
                    size: block.size,
                });
            }
            packed.push(SpanBlock {
                offset: next,
                size: block.size,
                free: false,
            });
            next += block.size;
        }
        if next < self.capacity {
            packed.push(SpanBlock {
                offset: next,
                size: self.capacity - next,
                free: true,
            });
        }
        self.blocks = packed;
        if !moves.is_empty() {
            log::debug!(
                "[SpanAllocator] compacted {} spans, {} moved",
                self.blocks.len(),
                moves.len()
            );
        }
        moves
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.used
    }

    /// One past the end of the highest live span
    pub fn high_water(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| !b.free)
            .map(|b| b.offset + b.size)
            .max()
            .unwrap_or(0)
    }
}
