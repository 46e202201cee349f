//! Central bookkeeping for registered resources and cache slots.
//!
//! The registry owns three span allocators (virtual page indices, root pool
//! pages, hierarchy nodes), the persistent-hash lookup, the fixed array of
//! cache slots, and the LRU order used for eviction. All mutation happens on
//! the cycle thread; the registry itself is not synchronized.

use std::sync::Arc;

use bit_vec::BitVec;
use rustc_hash::FxHashMap;

use crate::alloc::{SpanAllocator, SpanMove};
use crate::config::StreamingConfig;
use crate::error::{StreamingError, StreamingResult};
use crate::fixup::chunk::{FixupChunk, FixupState};
use crate::registry::handle::{RuntimeResourceId, RESOURCE_GENERATION_BITS, MAX_RESOURCES};
use crate::registry::lru::{LruRegistry, INVALID_SLOT};
use crate::registry::resource::Resource;
use crate::registry::virtual_table::VirtualPageTable;

const GENERATION_MASK: u32 = (1 << RESOURCE_GENERATION_BITS) - 1;

/// A page whose payload is installed, with its parsed fixup metadata
#[derive(Debug, Clone)]
pub struct ResidentPage {
    pub chunk: Arc<FixupChunk>,
    pub state: FixupState,
    pub max_hierarchy_depth: u8,
}

/// One cache slot reserved for a `(resource, page)` key
#[derive(Debug)]
pub struct RegisteredPage {
    pub resource: RuntimeResourceId,
    pub page_index: u32,
    /// Registered pages whose dependency lists include this page
    pub ref_count: u32,
    /// Cycle index of the last request that touched this page
    pub latest_update: u64,
    pub resident: Option<ResidentPage>,
}

/// A registered resource and its allocated spans
#[derive(Debug)]
pub struct RuntimeResource {
    pub resource: Resource,
    /// First virtual page index of this resource's pages
    pub virtual_page_base: u32,
    /// First root-pool page of this resource's root span
    pub root_pool_base: u32,
    /// First hierarchy node of this resource's node span
    pub hierarchy_base_node: u32,
    /// Cleared when fetches exhaust retries or metadata is corrupt; invalid
    /// resources render from root data only and are skipped by selection
    pub valid: bool,
    pub root_resident: Vec<Option<ResidentPage>>,
}

impl RuntimeResource {
    pub fn virtual_index(&self, page_index: u32) -> u32 {
        self.virtual_page_base + page_index
    }
}

#[derive(Debug)]
struct ResourceSlot {
    generation: u32,
    runtime: Option<RuntimeResource>,
}

/// Result of a successful [`ResourceRegistry::add`]
#[derive(Debug)]
pub struct AddOutcome {
    pub id: RuntimeResourceId,
    /// Node-unit relocations from hierarchy-span compaction; the caller must
    /// replay them as buffer moves before any further hierarchy writes
    pub hierarchy_moves: Vec<SpanMove>,
}

#[derive(Debug)]
pub struct ResourceRegistry {
    slots: Vec<ResourceSlot>,
    free_resources: Vec<u32>,
    by_hash: FxHashMap<u64, RuntimeResourceId>,
    virtual_span: SpanAllocator,
    root_span: SpanAllocator,
    hierarchy_span: SpanAllocator,
    table: VirtualPageTable,
    registered: Vec<Option<RegisteredPage>>,
    free_slots: Vec<u32>,
    lru: LruRegistry,
    /// Per virtual index: set while the page sits in the pending queue
    pending_install: BitVec,
    resident_streaming: usize,
    invalid_resources: u64,
}

impl ResourceRegistry {
    pub fn new(config: &StreamingConfig) -> Self {
        let mut registry = Self {
            slots: Vec::new(),
            free_resources: Vec::new(),
            by_hash: FxHashMap::default(),
            virtual_span: SpanAllocator::new(config.max_virtual_pages),
            root_span: SpanAllocator::new(config.max_root_pages),
            hierarchy_span: SpanAllocator::new(config.max_hierarchy_nodes),
            table: VirtualPageTable::new(),
            registered: Vec::new(),
            free_slots: Vec::new(),
            lru: LruRegistry::new(),
            pending_install: BitVec::new(),
            resident_streaming: 0,
            invalid_resources: 0,
        };
        registry.grow_capacity(config.initial_pool_pages);
        registry
    }

    // ---- resources ----

    pub fn add(&mut self, resource: Resource) -> StreamingResult<AddOutcome> {
        let hash = resource.persistent_hash();
        if self.by_hash.contains_key(&hash) {
            return Err(StreamingError::DuplicatePersistentHash { hash });
        }
        let num_pages = resource.num_pages();
        let num_root = resource.num_root_pages();
        let node_count = resource.hierarchy_node_count();

        let Some(virtual_base) = self.virtual_span.allocate(num_pages) else {
            return Err(StreamingError::VirtualSpaceExhausted {
                requested: num_pages,
                available: self.virtual_span.available(),
            });
        };
        let Some(root_base) = self.root_span.allocate(num_root) else {
            self.virtual_span.free(virtual_base);
            return Err(StreamingError::RootPoolExhausted {
                requested: num_root,
                available: self.root_span.available(),
            });
        };

        // Hierarchy spans fragment as resources churn; compact once before
        // giving up.
        let mut hierarchy_moves = Vec::new();
        let hierarchy_base = match self.hierarchy_span.allocate(node_count) {
            Some(base) => base,
            None => {
                hierarchy_moves = self.hierarchy_span.compact();
                self.rebase_hierarchy(&hierarchy_moves);
                match self.hierarchy_span.allocate(node_count) {
                    Some(base) => base,
                    None => {
                        self.virtual_span.free(virtual_base);
                        self.root_span.free(root_base);
                        return Err(StreamingError::HierarchyExhausted {
                            requested: node_count,
                            available: self.hierarchy_span.available(),
                        });
                    }
                }
            }
        };

        let slot_index = match self.free_resources.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_RESOURCES {
                    self.virtual_span.free(virtual_base);
                    self.root_span.free(root_base);
                    self.hierarchy_span.free(hierarchy_base);
                    return Err(StreamingError::InvalidResource {
                        message: "resource slot space exhausted".into(),
                    });
                }
                self.slots.push(ResourceSlot {
                    generation: 0,
                    runtime: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let id = RuntimeResourceId::new(slot_index, self.slots[slot_index as usize].generation);
        self.table.ensure_capacity(virtual_base + num_pages);
        self.ensure_pending_capacity(virtual_base + num_pages);
        self.by_hash.insert(hash, id);
        self.slots[slot_index as usize].runtime = Some(RuntimeResource {
            root_resident: vec![None; num_root as usize],
            resource,
            virtual_page_base: virtual_base,
            root_pool_base: root_base,
            hierarchy_base_node: hierarchy_base,
            valid: true,
        });
        log::debug!(
            "[Registry] added resource {:#010x}: {} pages ({} root), {} nodes, virtual base {}",
            id.bits(),
            num_pages,
            num_root,
            node_count,
            virtual_base
        );
        Ok(AddOutcome {
            id,
            hierarchy_moves,
        })
    }

    fn rebase_hierarchy(&mut self, moves: &[SpanMove]) {
        for slot in &mut self.slots {
            let Some(runtime) = &mut slot.runtime else {
                continue;
            };
            if let Some(m) = moves.iter().find(|m| m.old_offset == runtime.hierarchy_base_node) {
                runtime.hierarchy_base_node = m.new_offset;
            }
        }
    }

    /// Unregister a resource, dropping its resident pages without fixups
    /// (the hierarchy span dies with the resource).
    pub fn remove(&mut self, id: RuntimeResourceId) -> StreamingResult<()> {
        let runtime = self.take_runtime(id)?;
        for page_index in runtime.resource.num_root_pages()..runtime.resource.num_pages() {
            let virtual_index = runtime.virtual_index(page_index);
            let slot = self.table.registered_slot(virtual_index);
            if slot == INVALID_SLOT {
                continue;
            }
            let owned = self.registered[slot as usize]
                .as_ref()
                .is_some_and(|e| e.resource == id);
            debug_assert!(owned);
            if owned {
                if let Some(entry) = self.registered[slot as usize].take() {
                    if entry.resident.is_some() {
                        self.resident_streaming -= 1;
                    }
                    self.lru.remove(slot);
                    self.free_slots.push(slot);
                }
            }
            self.table.clear_registered_slot(virtual_index);
            self.pending_install.set(virtual_index as usize, false);
        }
        self.by_hash.remove(&runtime.resource.persistent_hash());
        self.virtual_span.free(runtime.virtual_page_base);
        self.root_span.free(runtime.root_pool_base);
        self.hierarchy_span.free(runtime.hierarchy_base_node);
        log::debug!("[Registry] removed resource {:#010x}", id.bits());
        Ok(())
    }

    fn take_runtime(&mut self, id: RuntimeResourceId) -> StreamingResult<RuntimeResource> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .ok_or(StreamingError::UnknownResource { id: id.bits() })?;
        let runtime = slot
            .runtime
            .take()
            .ok_or(StreamingError::UnknownResource { id: id.bits() })?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free_resources.push(id.index() as u32);
        Ok(runtime)
    }

    pub fn get(&self, id: RuntimeResourceId) -> Option<&RuntimeResource> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.runtime.as_ref())
    }

    pub fn get_mut(&mut self, id: RuntimeResourceId) -> Option<&mut RuntimeResource> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.runtime.as_mut())
    }

    pub fn lookup_by_hash(&self, hash: u64) -> Option<RuntimeResourceId> {
        self.by_hash.get(&hash).copied()
    }

    /// Registered and still serviceable
    pub fn is_valid_resource(&self, id: RuntimeResourceId) -> bool {
        self.get(id).is_some_and(|r| r.valid)
    }

    pub fn mark_invalid(&mut self, id: RuntimeResourceId) {
        if let Some(runtime) = self.get_mut(id) {
            if runtime.valid {
                runtime.valid = false;
                self.invalid_resources += 1;
                log::warn!(
                    "[Registry] resource {:#010x} marked invalid; rendering from root pages only",
                    id.bits()
                );
            }
        }
    }

    pub fn invalid_resources(&self) -> u64 {
        self.invalid_resources
    }

    pub fn resources(&self) -> impl Iterator<Item = (RuntimeResourceId, &RuntimeResource)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let runtime = slot.runtime.as_ref()?;
            Some((
                RuntimeResourceId::new(index as u32, slot.generation),
                runtime,
            ))
        })
    }

    // ---- residency ----

    pub fn is_page_resident(&self, id: RuntimeResourceId, page_index: u32) -> bool {
        let Some(runtime) = self.get(id) else {
            return false;
        };
        if runtime.resource.is_root_page(page_index) {
            return runtime.root_resident[page_index as usize].is_some();
        }
        let slot = self.table.registered_slot(runtime.virtual_index(page_index));
        slot != INVALID_SLOT
            && self.registered[slot as usize]
                .as_ref()
                .is_some_and(|e| e.resident.is_some())
    }

    pub fn resident_chunk(&self, id: RuntimeResourceId, page_index: u32) -> Option<Arc<FixupChunk>> {
        self.resident_page(id, page_index).map(|r| r.chunk.clone())
    }

    pub fn resident_page(&self, id: RuntimeResourceId, page_index: u32) -> Option<&ResidentPage> {
        let runtime = self.get(id)?;
        if runtime.resource.is_root_page(page_index) {
            return runtime.root_resident[page_index as usize].as_ref();
        }
        let slot = self.table.registered_slot(runtime.virtual_index(page_index));
        if slot == INVALID_SLOT {
            return None;
        }
        self.registered[slot as usize]
            .as_ref()
            .filter(|e| e.resource == id && e.page_index == page_index)?
            .resident
            .as_ref()
    }

    pub fn fixup_state_mut(
        &mut self,
        id: RuntimeResourceId,
        page_index: u32,
    ) -> Option<&mut FixupState> {
        let slot_index = id.index();
        let resource_slot = self
            .slots
            .get_mut(slot_index)
            .filter(|s| s.generation == id.generation())?;
        let runtime = resource_slot.runtime.as_mut()?;
        if runtime.resource.is_root_page(page_index) {
            return runtime.root_resident[page_index as usize]
                .as_mut()
                .map(|r| &mut r.state);
        }
        let slot = self.table.registered_slot(runtime.virtual_index(page_index));
        if slot == INVALID_SLOT {
            return None;
        }
        self.registered[slot as usize]
            .as_mut()
            .filter(|e| e.resource == id && e.page_index == page_index)?
            .resident
            .as_mut()
            .map(|r| &mut r.state)
    }

    /// Where a page's payload lives: `(true, root pool page)` for root
    /// pages, `(false, cache slot)` for resident streaming pages
    pub fn page_location(&self, id: RuntimeResourceId, page_index: u32) -> Option<(bool, u32)> {
        let runtime = self.get(id)?;
        if runtime.resource.is_root_page(page_index) {
            return Some((true, runtime.root_pool_base + page_index));
        }
        let slot = self.table.registered_slot(runtime.virtual_index(page_index));
        (slot != INVALID_SLOT).then_some((false, slot))
    }

    pub fn set_root_resident(
        &mut self,
        id: RuntimeResourceId,
        page_index: u32,
        resident: ResidentPage,
    ) {
        if let Some(runtime) = self.get_mut(id) {
            debug_assert!(runtime.resource.is_root_page(page_index));
            runtime.root_resident[page_index as usize] = Some(resident);
        }
    }

    pub fn mark_resident(&mut self, slot: u32, resident: ResidentPage) {
        let Some(entry) = self.registered[slot as usize].as_mut() else {
            debug_assert!(false, "mark_resident on free slot");
            return;
        };
        debug_assert!(entry.resident.is_none());
        entry.resident = Some(resident);
        self.resident_streaming += 1;
    }

    // ---- cache slots ----

    pub fn capacity(&self) -> u32 {
        self.registered.len() as u32
    }

    pub fn registered_count(&self) -> u32 {
        (self.registered.len() - self.free_slots.len()) as u32
    }

    pub fn resident_count(&self) -> u32 {
        self.resident_streaming as u32
    }

    pub fn registered_page(&self, slot: u32) -> Option<&RegisteredPage> {
        self.registered.get(slot as usize)?.as_ref()
    }

    pub fn registered_pages(&self) -> impl Iterator<Item = (u32, &RegisteredPage)> {
        self.registered
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| Some((slot as u32, entry.as_ref()?)))
    }

    pub fn acquire_free_slot(&mut self) -> Option<u32> {
        self.free_slots.pop()
    }

    /// Reserve `slot` for `(id, page_index)`: links the virtual entry, takes
    /// a reference on every streaming dependency, marks the install pending,
    /// and inserts the slot at the MRU end.
    pub fn register_page(
        &mut self,
        id: RuntimeResourceId,
        page_index: u32,
        slot: u32,
        update_index: u64,
    ) {
        let Some(runtime) = self.get(id) else {
            debug_assert!(false, "register_page on unknown resource");
            return;
        };
        let virtual_index = runtime.virtual_index(page_index);
        let num_root = runtime.resource.num_root_pages();
        let virtual_base = runtime.virtual_page_base;
        let deps = runtime.resource.page_dependencies(page_index).to_vec();

        debug_assert!(self.registered[slot as usize].is_none());
        self.registered[slot as usize] = Some(RegisteredPage {
            resource: id,
            page_index,
            ref_count: 0,
            latest_update: update_index,
            resident: None,
        });
        self.table.set_registered_slot(virtual_index, slot);
        self.pending_install.set(virtual_index as usize, true);
        self.lru.insert(slot);

        for dep in deps {
            if dep < num_root {
                continue;
            }
            let dep_slot = self.table.registered_slot(virtual_base + dep);
            debug_assert_ne!(dep_slot, INVALID_SLOT, "dependency not registered first");
            if dep_slot != INVALID_SLOT {
                if let Some(entry) = self.registered[dep_slot as usize].as_mut() {
                    entry.ref_count += 1;
                }
            }
        }
    }

    /// Drop the slot's registration and release its dependency references
    pub fn release_slot(&mut self, slot: u32) {
        let Some(entry) = self.registered[slot as usize].take() else {
            return;
        };
        if entry.resident.is_some() {
            self.resident_streaming -= 1;
        }
        self.lru.remove(slot);
        self.free_slots.push(slot);

        if let Some(runtime) = self.get(entry.resource) {
            let virtual_base = runtime.virtual_page_base;
            let num_root = runtime.resource.num_root_pages();
            let deps = runtime.resource.page_dependencies(entry.page_index).to_vec();
            self.table.clear_registered_slot(virtual_base + entry.page_index);
            self.pending_install
                .set((virtual_base + entry.page_index) as usize, false);
            for dep in deps {
                if dep < num_root {
                    continue;
                }
                let dep_slot = self.table.registered_slot(virtual_base + dep);
                if dep_slot != INVALID_SLOT {
                    if let Some(dep_entry) = self.registered[dep_slot as usize].as_mut() {
                        debug_assert!(dep_entry.ref_count > 0);
                        dep_entry.ref_count = dep_entry.ref_count.saturating_sub(1);
                    }
                }
            }
        }
    }

    pub fn touch_slot(&mut self, slot: u32, update_index: u64) {
        if let Some(entry) = self.registered[slot as usize].as_mut() {
            entry.latest_update = update_index;
            self.lru.touch(slot);
        }
    }

    /// Oldest slot that is not referenced, not touched this cycle, and has
    /// no install in flight
    pub fn find_evictable_slot(&self, update_index: u64) -> Option<u32> {
        self.lru.iter_oldest().find(|&slot| {
            let Some(entry) = self.registered[slot as usize].as_ref() else {
                return false;
            };
            if entry.ref_count > 0 || entry.latest_update == update_index {
                return false;
            }
            let pending = self
                .get(entry.resource)
                .map(|r| r.virtual_index(entry.page_index))
                .is_some_and(|v| self.pending_install.get(v as usize).unwrap_or(false));
            !pending
        })
    }

    pub fn clear_install_pending(&mut self, id: RuntimeResourceId, page_index: u32) {
        if let Some(runtime) = self.get(id) {
            let virtual_index = runtime.virtual_index(page_index);
            self.pending_install.set(virtual_index as usize, false);
        }
    }

    pub fn maybe_compact_lru(&mut self) {
        self.lru.maybe_compact();
    }

    pub fn verify_lru(&self) -> Vec<String> {
        self.lru.verify()
    }

    // ---- pool capacity ----

    pub fn grow_capacity(&mut self, new_slots: u32) {
        let old = self.registered.len() as u32;
        debug_assert!(new_slots >= old);
        self.registered
            .resize_with(new_slots as usize, Default::default);
        self.free_slots.extend((old..new_slots).rev());
    }

    /// Shrink toward `target_slots` by dropping free slots off the tail.
    /// Registered tail slots block further shrinking; returns the capacity
    /// actually reached.
    pub fn try_shrink(&mut self, target_slots: u32) -> u32 {
        while self.registered.len() as u32 > target_slots {
            if self.registered.last().is_some_and(|e| e.is_none()) {
                self.registered.pop();
            } else {
                break;
            }
        }
        let len = self.registered.len() as u32;
        self.free_slots.retain(|&s| s < len);
        len
    }

    // ---- virtual table ----

    pub fn table(&self) -> &VirtualPageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut VirtualPageTable {
        &mut self.table
    }

    fn ensure_pending_capacity(&mut self, len: u32) {
        if self.pending_install.len() < len as usize {
            let grow = len as usize - self.pending_install.len();
            self.pending_install.grow(grow, false);
        }
    }

    pub fn virtual_pages_used(&self) -> u32 {
        self.virtual_span.used()
    }

    pub fn root_pages_used(&self) -> u32 {
        self.root_span.used()
    }

    pub fn hierarchy_nodes_used(&self) -> u32 {
        self.hierarchy_span.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::resource::PageStreamingState;

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            initial_pool_pages: 8,
            min_pool_pages: 2,
            max_pool_pages: 16,
            max_root_pages: 8,
            max_hierarchy_nodes: 8,
            max_virtual_pages: 64,
            ..Default::default()
        }
    }

    fn chain_resource(hash: u64, nodes: u32) -> Resource {
        // 1 root page + 3 streaming pages, each depending on its predecessor.
        let states = vec![
            PageStreamingState::new(0, 16, 0, 0),
            PageStreamingState::new(0, 64, 0, 0),
            PageStreamingState::new(64, 64, 0, 1),
            PageStreamingState::new(128, 64, 1, 1),
        ];
        Resource::new(
            hash,
            1,
            states,
            vec![1, 2],
            vec![0; nodes as usize * 64],
            vec![0; 16],
        )
        .unwrap()
    }

    fn resident_stub() -> ResidentPage {
        let bytes = crate::fixup::chunk::FixupChunkBuilder::new().build();
        let (chunk, _) = FixupChunk::parse(&bytes).unwrap();
        let state = FixupState::new(&chunk);
        ResidentPage {
            chunk: Arc::new(chunk),
            state,
            max_hierarchy_depth: 0,
        }
    }

    #[test]
    fn test_add_remove_reuses_spans() {
        let mut registry = ResourceRegistry::new(&test_config());
        let a = registry.add(chain_resource(1, 2)).unwrap();
        assert_eq!(registry.virtual_pages_used(), 4);
        assert_eq!(registry.root_pages_used(), 1);
        registry.remove(a.id).unwrap();
        assert_eq!(registry.virtual_pages_used(), 0);
        assert!(registry.get(a.id).is_none());

        let b = registry.add(chain_resource(1, 2)).unwrap();
        assert_ne!(a.id, b.id); // same slot, bumped generation
        assert_eq!(a.id.index(), b.id.index());
    }

    #[test]
    fn test_duplicate_hash_rejected() {
        let mut registry = ResourceRegistry::new(&test_config());
        registry.add(chain_resource(7, 1)).unwrap();
        let err = registry.add(chain_resource(7, 1));
        assert!(matches!(
            err,
            Err(StreamingError::DuplicatePersistentHash { hash: 7 })
        ));
    }

    #[test]
    fn test_stale_id_rejected_after_remove() {
        let mut registry = ResourceRegistry::new(&test_config());
        let a = registry.add(chain_resource(1, 1)).unwrap();
        registry.remove(a.id).unwrap();
        assert!(matches!(
            registry.remove(a.id),
            Err(StreamingError::UnknownResource { .. })
        ));
        assert!(!registry.is_valid_resource(a.id));
    }

    #[test]
    fn test_register_tracks_dependency_refs() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;

        let s1 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 1, s1, 0);
        let s2 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 2, s2, 0);
        let s3 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 3, s3, 0);

        assert_eq!(registry.registered_page(s1).unwrap().ref_count, 1);
        assert_eq!(registry.registered_page(s2).unwrap().ref_count, 1);
        assert_eq!(registry.registered_page(s3).unwrap().ref_count, 0);

        registry.release_slot(s3);
        assert_eq!(registry.registered_page(s2).unwrap().ref_count, 0);
        registry.release_slot(s2);
        assert_eq!(registry.registered_page(s1).unwrap().ref_count, 0);
    }

    #[test]
    fn test_eviction_skips_referenced_and_touched() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;

        let s1 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 1, s1, 0);
        let s2 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 2, s2, 0);
        registry.clear_install_pending(id, 1);
        registry.clear_install_pending(id, 2);

        // Page 1 is referenced by page 2, so only page 2's slot is eligible.
        assert_eq!(registry.find_evictable_slot(1), Some(s2));

        registry.touch_slot(s2, 1);
        assert_eq!(registry.find_evictable_slot(1), None);
        assert_eq!(registry.find_evictable_slot(2), Some(s2));
    }

    #[test]
    fn test_eviction_skips_pending_installs() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;
        let s1 = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 1, s1, 0);

        assert_eq!(registry.find_evictable_slot(5), None);
        registry.clear_install_pending(id, 1);
        assert_eq!(registry.find_evictable_slot(5), Some(s1));
    }

    #[test]
    fn test_resident_bookkeeping() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;
        let slot = registry.acquire_free_slot().unwrap();
        registry.register_page(id, 1, slot, 0);
        assert!(!registry.is_page_resident(id, 1));

        registry.mark_resident(slot, resident_stub());
        assert!(registry.is_page_resident(id, 1));
        assert_eq!(registry.resident_count(), 1);
        assert_eq!(registry.page_location(id, 1), Some((false, slot)));

        registry.release_slot(slot);
        assert_eq!(registry.resident_count(), 0);
        assert!(!registry.is_page_resident(id, 1));
    }

    #[test]
    fn test_root_pages_resident_via_resource() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;
        assert!(!registry.is_page_resident(id, 0));
        registry.set_root_resident(id, 0, resident_stub());
        assert!(registry.is_page_resident(id, 0));
        let base = registry.get(id).unwrap().root_pool_base;
        assert_eq!(registry.page_location(id, 0), Some((true, base)));
    }

    #[test]
    fn test_shrink_stops_at_registered_tail() {
        let mut registry = ResourceRegistry::new(&test_config());
        let id = registry.add(chain_resource(1, 1)).unwrap().id;
        // Free slots pop lowest-first, so force a registration near the tail.
        let top = registry.capacity() - 1;
        registry.free_slots.retain(|&s| s != top);
        registry.register_page(id, 1, top, 0);

        assert_eq!(registry.try_shrink(2), registry.capacity());
        assert_eq!(registry.capacity(), 8);

        registry.release_slot(top);
        assert_eq!(registry.try_shrink(2), 2);
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_hierarchy_compaction_on_add() {
        let mut registry = ResourceRegistry::new(&test_config());
        // Capacity is 8 nodes: A takes 3, B takes 2, leaving 3 at the top.
        let a = registry.add(chain_resource(1, 3)).unwrap().id;
        let b = registry.add(chain_resource(2, 2)).unwrap().id;
        assert_eq!(registry.get(b).unwrap().hierarchy_base_node, 3);
        registry.remove(a).unwrap();

        // Freeing A leaves two 3-node holes; 4 contiguous nodes only exist
        // after compaction slides B down.
        let c = registry.add(chain_resource(3, 4)).unwrap();
        assert_eq!(c.hierarchy_moves.len(), 1);
        assert_eq!(c.hierarchy_moves[0].old_offset, 3);
        assert_eq!(c.hierarchy_moves[0].new_offset, 0);
        assert_eq!(c.hierarchy_moves[0].size, 2);
        assert_eq!(registry.get(b).unwrap().hierarchy_base_node, 0);
        assert_eq!(registry.get(c.id).unwrap().hierarchy_base_node, 2);
    }
}
