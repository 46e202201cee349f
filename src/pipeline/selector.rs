//! Per-cycle page selection.
//!
//! Requests from GPU feedback, explicit calls, and prefetch hints are
//! max-merged into the virtual page table, raised priorities flow to page
//! dependencies, and the highest priority unregistered pages claim cache
//! slots, evicting cold registered pages when the free list runs dry.
//! Dependencies always carry a higher priority than their requester, so
//! draining by priority registers a page's dependencies before the page.

use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::fixup::engine::{evict_slot, FixupCtx};
use crate::io::feedback::PageRequest;
use crate::pipeline::pending::PendingQueue;
use crate::registry::handle::RuntimeResourceId;
use crate::registry::lru::INVALID_SLOT;
use crate::registry::resource_registry::ResourceRegistry;

/// One unregistered page competing for a cache slot
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    priority: u32,
    virtual_index: u32,
    resource: RuntimeResourceId,
    page_index: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Highest priority wins; lower virtual index breaks ties so a
        // cycle's selection order is deterministic.
        self.priority
            .cmp(&other.priority)
            .then(other.virtual_index.cmp(&self.virtual_index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What one selection pass did
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionOutcome {
    /// Pages newly queued for fetch
    pub selected: u32,
    /// Registered pages evicted to make room
    pub evicted: u32,
    /// Distinct streaming pages requested this cycle
    pub requested: u32,
    /// Selection stopped early because no slot could be freed
    pub cache_full: bool,
}

/// Reusable scratch state for one cycle of gathering and selection
#[derive(Default)]
pub struct PageSelector {
    /// Owner of each virtual page first raised this cycle
    owners: FxHashMap<u32, (RuntimeResourceId, u32)>,
    /// Pages whose raised priority still has to reach their dependencies
    worklist: Vec<(RuntimeResourceId, u32, u32)>,
    touched_scratch: Vec<u32>,
    heap: BinaryHeap<Candidate>,
}

impl PageSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a request batch into the virtual page table.
    ///
    /// Ranges are clamped against the owning resource, so stale or torn
    /// feedback cannot reach past it. Root pages are always resident and
    /// are dropped here. A zero priority counts as the lowest real request.
    pub fn gather(&mut self, registry: &mut ResourceRegistry, requests: &[PageRequest]) {
        for request in requests {
            let (num_pages, num_root, base) = {
                let Some(runtime) = registry.get(request.resource) else {
                    continue;
                };
                if !runtime.valid {
                    continue;
                }
                (
                    runtime.resource.num_pages(),
                    runtime.resource.num_root_pages(),
                    runtime.virtual_page_base,
                )
            };
            let start = request.page_start.min(num_pages);
            let end = request
                .page_start
                .saturating_add(request.num_pages)
                .min(num_pages);
            let priority = request.priority.max(1);
            for page in start..end {
                if page < num_root {
                    continue;
                }
                self.touch(registry, request.resource, base + page, page, priority);
            }
        }
    }

    fn touch(
        &mut self,
        registry: &mut ResourceRegistry,
        resource: RuntimeResourceId,
        virtual_index: u32,
        page_index: u32,
        priority: u32,
    ) {
        if registry.table_mut().accumulate(virtual_index, priority) {
            self.owners
                .entry(virtual_index)
                .or_insert((resource, page_index));
            self.worklist.push((resource, page_index, priority));
        }
    }

    /// Flow raised priorities to page dependencies until a fixpoint.
    ///
    /// A dependency is requested one step above its requester, so ancestors
    /// always outrank descendants. Dependencies point strictly backwards,
    /// which bounds the walk.
    pub fn propagate(&mut self, registry: &mut ResourceRegistry) {
        while let Some((resource, page_index, priority)) = self.worklist.pop() {
            let (num_root, base, deps) = {
                let Some(runtime) = registry.get(resource) else {
                    continue;
                };
                (
                    runtime.resource.num_root_pages(),
                    runtime.virtual_page_base,
                    runtime.resource.page_dependencies(page_index).to_vec(),
                )
            };
            let dep_priority = priority.saturating_add(1);
            for dep in deps {
                if dep < num_root {
                    continue;
                }
                self.touch(registry, resource, base + dep, dep, dep_priority);
            }
        }
    }

    /// Claim slots for the highest priority candidates and queue their
    /// fetches.
    ///
    /// Registered pages requested this cycle are touched in the LRU, which
    /// also shields them from this cycle's evictions. Selection stops at
    /// `max_new` pages or at the first candidate no slot can be freed for;
    /// deferred candidates are simply re-requested by later feedback.
    pub fn select(
        &mut self,
        ctx: &mut FixupCtx,
        pending: &mut PendingQueue,
        update_index: u64,
        max_new: usize,
    ) -> SelectionOutcome {
        let mut outcome = SelectionOutcome {
            requested: ctx.registry.table().distinct_requested(),
            ..Default::default()
        };

        self.touched_scratch.clear();
        self.touched_scratch
            .extend_from_slice(ctx.registry.table().touched());
        for &virtual_index in &self.touched_scratch {
            let slot = ctx.registry.table().registered_slot(virtual_index);
            if slot != INVALID_SLOT {
                ctx.registry.touch_slot(slot, update_index);
            } else if let Some(&(resource, page_index)) = self.owners.get(&virtual_index) {
                self.heap.push(Candidate {
                    priority: ctx.registry.table().priority(virtual_index),
                    virtual_index,
                    resource,
                    page_index,
                });
            }
        }

        while let Some(candidate) = self.heap.pop() {
            if outcome.selected as usize >= max_new {
                break;
            }
            if ctx
                .registry
                .table()
                .registered_slot(candidate.virtual_index)
                != INVALID_SLOT
            {
                continue;
            }
            let (valid, bulk_offset, bulk_size) = match ctx.registry.get(candidate.resource) {
                Some(runtime) => {
                    let state = runtime.resource.page_state(candidate.page_index);
                    (runtime.valid, state.bulk_offset, state.bulk_size)
                }
                None => continue,
            };
            if !valid {
                continue;
            }

            let slot = match ctx.registry.acquire_free_slot() {
                Some(slot) => slot,
                None => {
                    let Some(victim) = ctx.registry.find_evictable_slot(update_index) else {
                        outcome.cache_full = true;
                        break;
                    };
                    evict_slot(ctx, victim);
                    outcome.evicted += 1;
                    match ctx.registry.acquire_free_slot() {
                        Some(slot) => slot,
                        None => {
                            outcome.cache_full = true;
                            break;
                        }
                    }
                }
            };
            ctx.registry.register_page(
                candidate.resource,
                candidate.page_index,
                slot,
                update_index,
            );
            pending.push(
                candidate.resource,
                candidate.page_index,
                slot,
                bulk_offset,
                bulk_size,
            );
            outcome.selected += 1;
        }

        self.heap.clear();
        outcome
    }

    /// Drop this cycle's request state; slot links survive
    pub fn reset(&mut self, registry: &mut ResourceRegistry) {
        registry.table_mut().reset_touched();
        self.owners.clear();
        self.heap.clear();
        debug_assert!(self.worklist.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::registry::resource::{PageStreamingState, Resource};
    use crate::scatter::ScatterBatcher;

    struct Fixture {
        registry: ResourceRegistry,
        hierarchy: ScatterBatcher,
        page_pool: ScatterBatcher,
        root_pool: ScatterBatcher,
        selector: PageSelector,
        pending: PendingQueue,
    }

    impl Fixture {
        fn with_capacity(pool_pages: u32) -> Self {
            let config = StreamingConfig {
                initial_pool_pages: pool_pages,
                ..StreamingConfig::default()
            };
            Self {
                registry: ResourceRegistry::new(&config),
                hierarchy: ScatterBatcher::new(),
                page_pool: ScatterBatcher::new(),
                root_pool: ScatterBatcher::new(),
                selector: PageSelector::new(),
                pending: PendingQueue::new(1 << 16),
            }
        }

        /// 1 root page plus a 3 page chain: page 3 needs page 2 needs page 1
        fn add_chain(&mut self, hash: u64) -> RuntimeResourceId {
            let states = vec![
                PageStreamingState::new(0, 0, 0, 0),
                PageStreamingState::new(256, 128, 0, 0),
                PageStreamingState::new(512, 128, 0, 1),
                PageStreamingState::new(768, 128, 1, 1),
            ];
            let resource =
                Resource::new(hash, 1, states, vec![1, 2], vec![0; 4 * 64], vec![]).unwrap();
            self.registry.add(resource).unwrap().id
        }

        fn run_cycle(&mut self, requests: &[PageRequest], update_index: u64) -> SelectionOutcome {
            self.run_cycle_capped(requests, update_index, usize::MAX)
        }

        fn run_cycle_capped(
            &mut self,
            requests: &[PageRequest],
            update_index: u64,
            max_new: usize,
        ) -> SelectionOutcome {
            self.selector.gather(&mut self.registry, requests);
            self.selector.propagate(&mut self.registry);
            let mut ctx = FixupCtx {
                registry: &mut self.registry,
                hierarchy: &mut self.hierarchy,
                page_pool: &mut self.page_pool,
                root_pool: &mut self.root_pool,
                page_byte_size: 256,
                root_page_byte_size: 128,
            };
            let outcome =
                self.selector
                    .select(&mut ctx, &mut self.pending, update_index, max_new);
            self.selector.reset(&mut self.registry);
            outcome
        }
    }

    fn request(resource: RuntimeResourceId, page: u32, priority: u32) -> PageRequest {
        PageRequest {
            resource,
            page_start: page,
            num_pages: 1,
            priority,
        }
    }

    #[test]
    fn test_priorities_climb_toward_ancestors() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);

        f.selector.gather(&mut f.registry, &[request(id, 3, 100)]);
        f.selector.propagate(&mut f.registry);

        let base = f.registry.get(id).unwrap().virtual_page_base;
        assert_eq!(f.registry.table().priority(base + 3), 100);
        assert_eq!(f.registry.table().priority(base + 2), 101);
        assert_eq!(f.registry.table().priority(base + 1), 102);
    }

    #[test]
    fn test_selection_registers_dependencies_first() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);

        let outcome = f.run_cycle(&[request(id, 3, 100)], 0);
        assert_eq!(outcome.selected, 3);
        assert_eq!(outcome.requested, 3);
        assert!(!outcome.cache_full);

        // Fetch order follows selection order: ancestors first.
        let order: Vec<u32> = std::iter::from_fn(|| f.pending.pop_head())
            .map(|entry| entry.page_index)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);

        // Each link in the chain holds a reference on its dependency.
        let base = f.registry.get(id).unwrap().virtual_page_base;
        let slot1 = f.registry.table().registered_slot(base + 1);
        assert_eq!(f.registry.registered_page(slot1).unwrap().ref_count, 1);
    }

    #[test]
    fn test_requests_max_merge_with_floor() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);
        let base = f.registry.get(id).unwrap().virtual_page_base;

        f.selector
            .gather(&mut f.registry, &[request(id, 1, 10), request(id, 1, 50)]);
        assert_eq!(f.registry.table().priority(base + 1), 50);
        f.selector.gather(&mut f.registry, &[request(id, 1, 7)]);
        assert_eq!(f.registry.table().priority(base + 1), 50);

        // Priority zero still counts as a request.
        f.selector.gather(&mut f.registry, &[request(id, 2, 0)]);
        assert_eq!(f.registry.table().priority(base + 2), 1);
    }

    #[test]
    fn test_feedback_range_clamped_to_resource() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);

        // Covers the root page and runs past the last page.
        let wild = PageRequest {
            resource: id,
            page_start: 0,
            num_pages: 100,
            priority: 5,
        };
        f.selector.gather(&mut f.registry, &[wild]);
        assert_eq!(f.registry.table().distinct_requested(), 3);
    }

    #[test]
    fn test_selection_budget_caps_new_fetches() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);

        let outcome = f.run_cycle_capped(&[request(id, 3, 100)], 0, 2);
        assert_eq!(outcome.selected, 2);
        assert_eq!(f.pending.len(), 2);

        // The two highest priority links made it in.
        let base = f.registry.get(id).unwrap().virtual_page_base;
        assert_ne!(f.registry.table().registered_slot(base + 1), INVALID_SLOT);
        assert_ne!(f.registry.table().registered_slot(base + 2), INVALID_SLOT);
        assert_eq!(f.registry.table().registered_slot(base + 3), INVALID_SLOT);
    }

    #[test]
    fn test_full_cache_defers_selection() {
        let mut f = Fixture::with_capacity(2);
        let id = f.add_chain(0xA);

        // The chain needs three slots but the pool only has two, and the
        // two it fills are requested this cycle, so nothing is evictable.
        let outcome = f.run_cycle(&[request(id, 3, 100)], 0);
        assert_eq!(outcome.selected, 2);
        assert!(outcome.cache_full);
        assert_eq!(outcome.evicted, 0);

        let base = f.registry.get(id).unwrap().virtual_page_base;
        assert_eq!(f.registry.table().registered_slot(base + 3), INVALID_SLOT);
    }

    #[test]
    fn test_eviction_prefers_cold_unreferenced_pages() {
        let mut f = Fixture::with_capacity(2);
        let a = f.add_chain(0xA);
        let b = f.add_chain(0xB);

        // Cycle 0 fills both slots with the start of A's chain.
        f.run_cycle(&[request(a, 2, 100)], 0);
        f.registry.clear_install_pending(a, 1);
        f.registry.clear_install_pending(a, 2);
        while f.pending.pop_head().is_some() {}

        // Cycle 1 wants B. A's page 1 is pinned by page 2's reference, so
        // the unreferenced page 2 is the one to go.
        let outcome = f.run_cycle(&[request(b, 1, 50)], 1);
        assert_eq!(outcome.selected, 1);
        assert_eq!(outcome.evicted, 1);

        let base_a = f.registry.get(a).unwrap().virtual_page_base;
        let base_b = f.registry.get(b).unwrap().virtual_page_base;
        assert_ne!(f.registry.table().registered_slot(base_a + 1), INVALID_SLOT);
        assert_eq!(f.registry.table().registered_slot(base_a + 2), INVALID_SLOT);
        assert_ne!(f.registry.table().registered_slot(base_b + 1), INVALID_SLOT);

        // The evicted page returned its reference on page 1.
        let slot1 = f.registry.table().registered_slot(base_a + 1);
        assert_eq!(f.registry.registered_page(slot1).unwrap().ref_count, 0);
    }

    #[test]
    fn test_invalid_resource_ignored() {
        let mut f = Fixture::with_capacity(8);
        let id = f.add_chain(0xA);
        f.registry.mark_invalid(id);

        let outcome = f.run_cycle(&[request(id, 3, 100)], 0);
        assert_eq!(outcome.selected, 0);
        assert_eq!(outcome.requested, 0);
        assert!(f.pending.is_empty());
    }
}
