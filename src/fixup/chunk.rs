//! Parsed fixup metadata carried at the front of every page payload.
//!
//! The serialized form is a fixed header followed by six tightly packed
//! sections: a dependency page array, group fixups, part fixups, parent
//! fixups, part entries, and a reconsider list. Parsing copies the payload
//! into a word arena once and computes a typed offset table; all later
//! access is through slice accessors over that arena, never raw pointer
//! walks into the original buffer.

use bit_vec::BitVec;
use bytemuck::{Pod, Zeroable};

use crate::error::{StreamingError, StreamingResult};
use crate::gpu::layout::{CLUSTER_RECORD_BYTES, HIERARCHY_NODE_CHILD_SLOTS, MAX_CHILD_REF_PART};

/// Identifies a serialized fixup chunk ("FC")
pub const FIXUP_CHUNK_MAGIC: u16 = 0x4346;

const HEADER_BYTES: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ChunkHeader {
    magic: u16,
    num_dependencies: u16,
    num_groups: u16,
    num_part_fixups: u16,
    num_parent_fixups: u16,
    num_part_entries: u16,
    num_reconsider: u16,
    reserved: u16,
}

/// One dependency-gated patch group.
///
/// The group toggles between installed and uninstalled when the residency
/// of its dependency range changes; toggling replays the referenced part
/// and parent fixups in the matching direction.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GroupFixup {
    /// Slice of the chunk dependency array gating this group
    pub dep_start: u32,
    pub dep_num: u32,
    pub part_start: u16,
    pub part_num: u16,
    pub parent_start: u16,
    pub parent_num: u16,
}

/// Points one hierarchy-node child slot at a part of the owning page
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PartFixup {
    /// Resource-local hierarchy node
    pub node_index: u32,
    /// `child_slot << 16 | part_index`
    packed: u32,
}

impl PartFixup {
    pub fn new(node_index: u32, child_slot: u32, part_index: u32) -> Self {
        debug_assert!(child_slot < HIERARCHY_NODE_CHILD_SLOTS);
        debug_assert!(part_index <= MAX_CHILD_REF_PART);
        Self {
            node_index,
            packed: (child_slot << 16) | part_index,
        }
    }

    pub fn child_slot(&self) -> u32 {
        self.packed >> 16
    }

    pub fn part_index(&self) -> u32 {
        self.packed & 0xFFFF
    }
}

/// Adjusts a subtree-completeness counter on an ancestor page
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ParentFixup {
    /// Resource-local index of the ancestor page
    pub parent_page: u32,
    /// Part entry in the ancestor's own chunk
    pub part_entry_index: u32,
}

/// One countable region of the owning page.
///
/// `dep_start`/`dep_num` name the contributor pages whose installed groups
/// complete this region; while any contributor is missing the region is a
/// provisional leaf, marked by a sign bit on the node's error word and a
/// streaming-leaf flag on each covered cluster record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PartEntry {
    pub dep_start: u32,
    pub dep_num: u32,
    pub node_index: u32,
    pub child_slot: u32,
    pub cluster_start: u32,
    pub cluster_num: u32,
}

/// Parsed fixup metadata of one page
#[derive(Debug, Clone)]
pub struct FixupChunk {
    words: Vec<u32>,
    header: ChunkHeader,
}

impl FixupChunk {
    /// Parse a chunk from the front of `payload`. Returns the chunk and the
    /// number of payload bytes it occupied; the GPU data follows directly.
    pub fn parse(payload: &[u8]) -> StreamingResult<(Self, usize)> {
        if payload.len() < HEADER_BYTES {
            return Err(corrupt("truncated header"));
        }
        let header: ChunkHeader = bytemuck::pod_read_unaligned(&payload[..HEADER_BYTES]);
        if header.magic != FIXUP_CHUNK_MAGIC {
            return Err(corrupt(&format!("bad magic {:#06x}", header.magic)));
        }
        let total_words = Self::total_words(&header);
        let total_bytes = HEADER_BYTES + total_words * 4;
        if payload.len() < total_bytes {
            return Err(corrupt(&format!(
                "sections need {} bytes, payload has {}",
                total_bytes,
                payload.len()
            )));
        }
        let words: Vec<u32> = payload[HEADER_BYTES..total_bytes]
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let chunk = Self { words, header };
        chunk.check_structure()?;
        Ok((chunk, total_bytes))
    }

    fn total_words(header: &ChunkHeader) -> usize {
        header.num_dependencies as usize
            + header.num_groups as usize * 4
            + header.num_part_fixups as usize * 2
            + header.num_parent_fixups as usize * 2
            + header.num_part_entries as usize * 6
            + header.num_reconsider as usize
    }

    fn deps_at(&self) -> usize {
        0
    }

    fn groups_at(&self) -> usize {
        self.deps_at() + self.header.num_dependencies as usize
    }

    fn parts_at(&self) -> usize {
        self.groups_at() + self.header.num_groups as usize * 4
    }

    fn parents_at(&self) -> usize {
        self.parts_at() + self.header.num_part_fixups as usize * 2
    }

    fn entries_at(&self) -> usize {
        self.parents_at() + self.header.num_parent_fixups as usize * 2
    }

    fn reconsider_at(&self) -> usize {
        self.entries_at() + self.header.num_part_entries as usize * 6
    }

    /// Resource-local page indices referenced by group and entry ranges
    pub fn dependencies(&self) -> &[u32] {
        &self.words[self.deps_at()..self.groups_at()]
    }

    pub fn groups(&self) -> &[GroupFixup] {
        bytemuck::cast_slice(&self.words[self.groups_at()..self.parts_at()])
    }

    pub fn part_fixups(&self) -> &[PartFixup] {
        bytemuck::cast_slice(&self.words[self.parts_at()..self.parents_at()])
    }

    pub fn parent_fixups(&self) -> &[ParentFixup] {
        bytemuck::cast_slice(&self.words[self.parents_at()..self.entries_at()])
    }

    pub fn part_entries(&self) -> &[PartEntry] {
        bytemuck::cast_slice(&self.words[self.entries_at()..self.reconsider_at()])
    }

    /// Sibling pages whose groups must be re-evaluated when the owning page
    /// installs or uninstalls
    pub fn reconsider_pages(&self) -> &[u32] {
        &self.words[self.reconsider_at()..]
    }

    pub fn group_dependencies(&self, group: &GroupFixup) -> &[u32] {
        let start = group.dep_start as usize;
        &self.dependencies()[start..start + group.dep_num as usize]
    }

    pub fn group_part_fixups(&self, group: &GroupFixup) -> &[PartFixup] {
        let start = group.part_start as usize;
        &self.part_fixups()[start..start + group.part_num as usize]
    }

    pub fn group_parent_fixups(&self, group: &GroupFixup) -> &[ParentFixup] {
        let start = group.parent_start as usize;
        &self.parent_fixups()[start..start + group.parent_num as usize]
    }

    pub fn entry_dependencies(&self, entry: &PartEntry) -> &[u32] {
        let start = entry.dep_start as usize;
        &self.dependencies()[start..start + entry.dep_num as usize]
    }

    /// Internal range consistency, independent of any resource
    fn check_structure(&self) -> StreamingResult<()> {
        let num_deps = self.header.num_dependencies as u32;
        let num_parts = self.header.num_part_fixups as u32;
        let num_parents = self.header.num_parent_fixups as u32;
        for (i, group) in self.groups().iter().enumerate() {
            let deps_ok = group
                .dep_start
                .checked_add(group.dep_num)
                .is_some_and(|end| end <= num_deps);
            let parts_ok = group.part_start as u32 + group.part_num as u32 <= num_parts;
            let parents_ok = group.parent_start as u32 + group.parent_num as u32 <= num_parents;
            if !deps_ok || !parts_ok || !parents_ok {
                return Err(corrupt(&format!("group {} range out of bounds", i)));
            }
        }
        for (i, part) in self.part_fixups().iter().enumerate() {
            if part.child_slot() >= HIERARCHY_NODE_CHILD_SLOTS {
                return Err(corrupt(&format!("part fixup {} child slot", i)));
            }
            if part.part_index() > MAX_CHILD_REF_PART {
                return Err(corrupt(&format!("part fixup {} part index", i)));
            }
        }
        for (i, entry) in self.part_entries().iter().enumerate() {
            let deps_ok = entry
                .dep_start
                .checked_add(entry.dep_num)
                .is_some_and(|end| end <= num_deps);
            if !deps_ok || entry.child_slot >= HIERARCHY_NODE_CHILD_SLOTS {
                return Err(corrupt(&format!("part entry {} out of bounds", i)));
            }
        }
        Ok(())
    }

    /// Bounds checks against the owning resource's shape. `page_byte_size`
    /// is the slot size of the pool the page installs into.
    pub fn validate_for_resource(
        &self,
        num_pages: u32,
        node_count: u32,
        page_byte_size: u32,
    ) -> StreamingResult<()> {
        for &dep in self.dependencies() {
            if dep >= num_pages {
                return Err(corrupt(&format!("dependency page {} out of range", dep)));
            }
        }
        for &page in self.reconsider_pages() {
            if page >= num_pages {
                return Err(corrupt(&format!("reconsider page {} out of range", page)));
            }
        }
        for part in self.part_fixups() {
            if part.node_index >= node_count {
                return Err(corrupt(&format!("part fixup node {}", part.node_index)));
            }
        }
        for parent in self.parent_fixups() {
            if parent.parent_page >= num_pages {
                return Err(corrupt(&format!(
                    "parent fixup page {} out of range",
                    parent.parent_page
                )));
            }
        }
        for entry in self.part_entries() {
            if entry.node_index >= node_count {
                return Err(corrupt(&format!("part entry node {}", entry.node_index)));
            }
            let clusters_end = entry
                .cluster_start
                .checked_add(entry.cluster_num)
                .and_then(|n| n.checked_mul(CLUSTER_RECORD_BYTES));
            if !clusters_end.is_some_and(|end| end <= page_byte_size) {
                return Err(corrupt("part entry cluster range out of page"));
            }
        }
        Ok(())
    }
}

fn corrupt(message: &str) -> StreamingError {
    StreamingError::InvalidResource {
        message: format!("fixup chunk: {}", message),
    }
}

/// Mutable per-resident-page fixup bookkeeping
#[derive(Debug, Clone)]
pub struct FixupState {
    /// One bit per group fixup
    pub installed: BitVec,
    /// Missing-contributor count per part entry
    pub leaf_counts: Vec<u32>,
}

impl FixupState {
    pub fn new(chunk: &FixupChunk) -> Self {
        Self {
            installed: BitVec::from_elem(chunk.groups().len(), false),
            leaf_counts: vec![0; chunk.part_entries().len()],
        }
    }

    pub fn is_installed(&self, group: usize) -> bool {
        self.installed.get(group).unwrap_or(false)
    }
}

/// Builds serialized chunks, for authoring pipelines and tests
#[derive(Debug, Default)]
pub struct FixupChunkBuilder {
    deps: Vec<u32>,
    groups: Vec<GroupFixup>,
    parts: Vec<PartFixup>,
    parents: Vec<ParentFixup>,
    entries: Vec<PartEntry>,
    reconsider: Vec<u32>,
}

impl FixupChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a group gated on `deps`; part and parent fixups added next
    /// belong to it until the next group opens
    pub fn begin_group(&mut self, deps: &[u32]) -> &mut Self {
        self.groups.push(GroupFixup {
            dep_start: self.deps.len() as u32,
            dep_num: deps.len() as u32,
            part_start: self.parts.len() as u16,
            part_num: 0,
            parent_start: self.parents.len() as u16,
            parent_num: 0,
        });
        self.deps.extend_from_slice(deps);
        self
    }

    pub fn part_fixup(&mut self, node_index: u32, child_slot: u32, part_index: u32) -> &mut Self {
        self.parts.push(PartFixup::new(node_index, child_slot, part_index));
        let group = self.groups.last_mut().expect("no open group");
        group.part_num += 1;
        self
    }

    pub fn parent_fixup(&mut self, parent_page: u32, part_entry_index: u32) -> &mut Self {
        self.parents.push(ParentFixup {
            parent_page,
            part_entry_index,
        });
        let group = self.groups.last_mut().expect("no open group");
        group.parent_num += 1;
        self
    }

    pub fn part_entry(
        &mut self,
        contributors: &[u32],
        node_index: u32,
        child_slot: u32,
        cluster_start: u32,
        cluster_num: u32,
    ) -> &mut Self {
        self.entries.push(PartEntry {
            dep_start: self.deps.len() as u32,
            dep_num: contributors.len() as u32,
            node_index,
            child_slot,
            cluster_start,
            cluster_num,
        });
        self.deps.extend_from_slice(contributors);
        self
    }

    pub fn reconsider_page(&mut self, page: u32) -> &mut Self {
        self.reconsider.push(page);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let header = ChunkHeader {
            magic: FIXUP_CHUNK_MAGIC,
            num_dependencies: self.deps.len() as u16,
            num_groups: self.groups.len() as u16,
            num_part_fixups: self.parts.len() as u16,
            num_parent_fixups: self.parents.len() as u16,
            num_part_entries: self.entries.len() as u16,
            num_reconsider: self.reconsider.len() as u16,
            reserved: 0,
        };
        let mut words: Vec<u32> = Vec::new();
        words.extend_from_slice(&self.deps);
        for g in &self.groups {
            words.push(g.dep_start);
            words.push(g.dep_num);
            words.push(g.part_start as u32 | (g.part_num as u32) << 16);
            words.push(g.parent_start as u32 | (g.parent_num as u32) << 16);
        }
        for p in &self.parts {
            words.push(p.node_index);
            words.push(p.packed);
        }
        for p in &self.parents {
            words.push(p.parent_page);
            words.push(p.part_entry_index);
        }
        for e in &self.entries {
            words.extend_from_slice(&[
                e.dep_start,
                e.dep_num,
                e.node_index,
                e.child_slot,
                e.cluster_start,
                e.cluster_num,
            ]);
        }
        words.extend_from_slice(&self.reconsider);

        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}
