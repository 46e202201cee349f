//! Version-tagged resource handles.

/// Bits in a resource slot index
pub const RESOURCE_INDEX_BITS: u32 = 20;

/// Bits in a slot generation counter
pub const RESOURCE_GENERATION_BITS: u32 = 8;

const INDEX_MASK: u32 = (1 << RESOURCE_INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << RESOURCE_GENERATION_BITS) - 1;

/// Hard cap on concurrently registered resources. One below the index range
/// so the all-ones pattern stays reserved for [`RuntimeResourceId::INVALID`].
pub const MAX_RESOURCES: usize = (1 << RESOURCE_INDEX_BITS) - 1;

/// Handle to a registered resource: slot index plus the slot's generation
/// at registration time.
///
/// The packed value fits in 28 bits (index low, generation above it), so the
/// top four bits stay clear and ids survive the feedback encoding's magic
/// shift. A stale handle whose generation no longer matches its slot is
/// rejected at lookup rather than aliasing the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RuntimeResourceId(u32);

impl RuntimeResourceId {
    pub const INVALID: Self = Self((GENERATION_MASK << RESOURCE_INDEX_BITS) | INDEX_MASK);

    pub fn new(index: u32, generation: u32) -> Self {
        debug_assert!(index <= INDEX_MASK);
        Self(((generation & GENERATION_MASK) << RESOURCE_INDEX_BITS) | (index & INDEX_MASK))
    }

    /// Packed 28-bit value for wire encodings
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild from a packed value; `None` if the value cannot name a live
    /// resource (out of range or the reserved invalid pattern)
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits >> (RESOURCE_INDEX_BITS + RESOURCE_GENERATION_BITS) != 0 {
            return None;
        }
        let id = Self(bits);
        id.is_valid().then_some(id)
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn generation(self) -> u32 {
        self.0 >> RESOURCE_INDEX_BITS
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for RuntimeResourceId {
    fn default() -> Self {
        Self::INVALID
    }
}
