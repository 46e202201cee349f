//! Packed layout of the GPU-visible buffers.
//!
//! Every shift and mask in the crate lives here. Three buffers exist:
//! the streaming page pool, the root page pool, and the hierarchy buffer.
//! Hierarchy nodes hold child references that either point into one of the
//! two pools or carry the invalid sentinel for a link whose target pages are
//! not resident yet.

use bytemuck::{Pod, Zeroable};

/// Child slots per hierarchy node
pub const HIERARCHY_NODE_CHILD_SLOTS: u32 = 8;

/// One node = per slot a child reference word and an error/flags word
pub const HIERARCHY_NODE_WORDS: u32 = HIERARCHY_NODE_CHILD_SLOTS * 2;

pub const HIERARCHY_NODE_BYTES: u32 = HIERARCHY_NODE_WORDS * 4;

/// Child reference sentinel: link target not resident
pub const INVALID_CHILD_REF: u32 = u32::MAX;

/// Sign bit on a node error word: subtree is a provisional leaf because its
/// child pages are not all resident
pub const ERROR_PROVISIONAL_LEAF_BIT: u32 = 0x8000_0000;

/// Byte stride of one cluster record at the front of a page payload
pub const CLUSTER_RECORD_BYTES: u32 = 16;

/// Cluster flag: cluster currently renders as a streaming leaf
pub const CLUSTER_FLAG_STREAMING_LEAF: u32 = 0x1;

const CHILD_REF_ROOT_BIT: u32 = 1 << 31;
const CHILD_REF_PAGE_SHIFT: u32 = 12;
const CHILD_REF_PAGE_MASK: u32 = 0x7_FFFF;
const CHILD_REF_PART_MASK: u32 = 0xFFF;

/// Highest encodable pool slot index; the all-ones page value is reserved so
/// no valid reference collides with [`INVALID_CHILD_REF`]
pub const MAX_CHILD_REF_PAGE: u32 = CHILD_REF_PAGE_MASK - 1;

/// Highest encodable group part index
pub const MAX_CHILD_REF_PART: u32 = CHILD_REF_PART_MASK;

/// Pack a child reference to `part` of the page in pool slot `page`
pub fn encode_child_ref(is_root: bool, page: u32, part: u32) -> u32 {
    debug_assert!(page <= MAX_CHILD_REF_PAGE, "pool slot {} unencodable", page);
    debug_assert!(part <= MAX_CHILD_REF_PART, "part index {} unencodable", part);
    let root = if is_root { CHILD_REF_ROOT_BIT } else { 0 };
    root | (page << CHILD_REF_PAGE_SHIFT) | part
}

pub fn child_ref_is_valid(child_ref: u32) -> bool {
    child_ref != INVALID_CHILD_REF
}

pub fn child_ref_is_root(child_ref: u32) -> bool {
    child_ref & CHILD_REF_ROOT_BIT != 0
}

pub fn child_ref_page(child_ref: u32) -> u32 {
    (child_ref >> CHILD_REF_PAGE_SHIFT) & CHILD_REF_PAGE_MASK
}

pub fn child_ref_part(child_ref: u32) -> u32 {
    child_ref & CHILD_REF_PART_MASK
}

/// Byte offset of a node's child reference word in the hierarchy buffer
pub fn node_child_ref_offset(base_node: u32, node: u32, slot: u32) -> u64 {
    debug_assert!(slot < HIERARCHY_NODE_CHILD_SLOTS);
    ((base_node as u64 + node as u64) * HIERARCHY_NODE_WORDS as u64 + slot as u64 * 2) * 4
}

/// Byte offset of a node's error/flags word in the hierarchy buffer
pub fn node_error_offset(base_node: u32, node: u32, slot: u32) -> u64 {
    node_child_ref_offset(base_node, node, slot) + 4
}

/// Byte offset of a pool slot's payload
pub fn page_slot_offset(slot: u32, page_byte_size: u32) -> u64 {
    slot as u64 * page_byte_size as u64
}

/// Byte offset of a cluster's flags word relative to the pool buffer,
/// given the owning page's slot base offset
pub fn cluster_flags_offset(slot_base: u64, cluster: u32) -> u64 {
    slot_base + cluster as u64 * CLUSTER_RECORD_BYTES as u64
}

/// One hierarchy node as uploaded at resource add.
///
/// Authored nodes carry invalid child references and provisional-leaf error
/// words; fixups patch them as pages arrive.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct HierarchyNode {
    pub words: [u32; HIERARCHY_NODE_WORDS as usize],
}

impl HierarchyNode {
    pub fn authored() -> Self {
        let mut words = [0u32; HIERARCHY_NODE_WORDS as usize];
        for slot in 0..HIERARCHY_NODE_CHILD_SLOTS as usize {
            words[slot * 2] = INVALID_CHILD_REF;
            words[slot * 2 + 1] = ERROR_PROVISIONAL_LEAF_BIT;
        }
        Self { words }
    }

    pub fn child_ref(&self, slot: u32) -> u32 {
        self.words[(slot * 2) as usize]
    }

    pub fn set_child_ref(&mut self, slot: u32, child_ref: u32) {
        self.words[(slot * 2) as usize] = child_ref;
    }

    pub fn error_word(&self, slot: u32) -> u32 {
        self.words[(slot * 2 + 1) as usize]
    }

    pub fn set_error_word(&mut self, slot: u32, error: u32) {
        self.words[(slot * 2 + 1) as usize] = error;
    }
}

/// Cluster record at the front of a page's GPU payload.
///
/// Authored clusters start flagged as streaming leaves; parent fixups clear
/// and restore the flag as the subtree below them completes and breaks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ClusterRecord {
    pub flags: u32,
    pub reserved: [u32; 3],
}

impl ClusterRecord {
    pub fn authored() -> Self {
        Self {
            flags: CLUSTER_FLAG_STREAMING_LEAF,
            reserved: [0; 3],
        }
    }
}
