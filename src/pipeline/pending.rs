//! Bounded FIFO of in-flight page fetches.
//!
//! Every entry owns a reserved cache slot from enqueue to install. Staging
//! space comes from a ring allocator whose free order must match allocation
//! order, so reads are issued strictly front to back and entries only leave
//! from the front. A fetch that cannot stage this cycle blocks the entries
//! behind it until the ring drains.

use std::collections::VecDeque;

use crate::alloc::ring::RingAllocator;
use crate::io::loader::{BlockLoader, ReadHandle};
use crate::registry::handle::RuntimeResourceId;
use crate::registry::resource_registry::ResourceRegistry;

/// Lifecycle of one pending fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Waiting for staging space
    Requested,
    /// Read issued, completion pending
    Fetching,
    /// Payload staged, waiting to install
    Ready,
    /// Install as a no-op; the owning resource was removed or turned invalid
    Skip,
}

/// One queued fetch bound to a reserved cache slot
#[derive(Debug)]
pub struct PendingPage {
    pub resource: RuntimeResourceId,
    pub page_index: u32,
    /// Cache slot reserved when the page was selected
    pub slot: u32,
    pub state: FetchState,
    /// Failed attempts so far
    pub retry_count: u32,
    ring_offset: u32,
    ring_allocated: bool,
    bulk_offset: u64,
    bulk_size: u32,
    read: Option<ReadHandle>,
}

/// FIFO fetch pipeline staged through a ring-allocated byte arena
pub struct PendingQueue {
    queue: VecDeque<PendingPage>,
    staging: Vec<u8>,
    ring: RingAllocator,
    completed: u64,
    retried: u64,
    exhausted: u64,
    skipped: u64,
}

impl PendingQueue {
    pub fn new(ring_capacity: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            staging: vec![0u8; ring_capacity as usize],
            ring: RingAllocator::new(ring_capacity),
            completed: 0,
            retried: 0,
            exhausted: 0,
            skipped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    pub fn in_flight(&self) -> usize {
        self.queue
            .iter()
            .filter(|e| e.state == FetchState::Fetching)
            .count()
    }

    /// Queue a fetch of `bulk_size` bytes at `bulk_offset` targeting `slot`
    pub fn push(
        &mut self,
        resource: RuntimeResourceId,
        page_index: u32,
        slot: u32,
        bulk_offset: u64,
        bulk_size: u32,
    ) {
        self.queue.push_back(PendingPage {
            resource,
            page_index,
            slot,
            state: FetchState::Requested,
            retry_count: 0,
            ring_offset: 0,
            ring_allocated: false,
            bulk_offset,
            bulk_size,
            read: None,
        });
    }

    /// Issue reads for queued entries, front to back.
    ///
    /// Stops at the first entry the ring cannot stage so staging blocks are
    /// always allocated in queue order, matching the FIFO free at pop time.
    pub fn issue_fetches(&mut self, loader: &mut dyn BlockLoader) -> u32 {
        let mut issued = 0;
        for entry in self.queue.iter_mut() {
            if entry.state != FetchState::Requested {
                continue;
            }
            let Some(offset) = self.ring.try_allocate(entry.bulk_size) else {
                break;
            };
            entry.ring_offset = offset;
            entry.ring_allocated = true;
            entry.read = Some(loader.issue_read(entry.bulk_offset, entry.bulk_size));
            entry.state = FetchState::Fetching;
            issued += 1;
        }
        issued
    }

    /// Poll outstanding reads, staging completed payloads.
    ///
    /// A failed read is re-issued in place until its failure count reaches
    /// `retry_limit`; at that point the owning resource is marked invalid
    /// and all of its queued entries become skips. Returns how many entries
    /// became ready.
    pub fn poll_completions(
        &mut self,
        loader: &mut dyn BlockLoader,
        registry: &mut ResourceRegistry,
        retry_limit: u32,
    ) -> u32 {
        let mut newly_ready = 0;
        let mut exhausted: Vec<RuntimeResourceId> = Vec::new();
        for entry in self.queue.iter_mut() {
            if entry.state != FetchState::Fetching {
                continue;
            }
            let Some(handle) = entry.read else {
                continue;
            };
            if !loader.is_complete(handle) {
                continue;
            }
            if loader.is_ok(handle) {
                let start = entry.ring_offset as usize;
                loader.copy_result(handle, &mut self.staging[start..start + entry.bulk_size as usize]);
                loader.release(handle);
                entry.read = None;
                entry.state = FetchState::Ready;
                self.completed += 1;
                newly_ready += 1;
            } else {
                loader.release(handle);
                entry.read = None;
                entry.retry_count += 1;
                if entry.retry_count < retry_limit {
                    log::warn!(
                        "[Streaming] read of page {} of {:#010x} failed, attempt {}/{}",
                        entry.page_index,
                        entry.resource.bits(),
                        entry.retry_count + 1,
                        retry_limit
                    );
                    entry.read = Some(loader.issue_read(entry.bulk_offset, entry.bulk_size));
                    self.retried += 1;
                } else {
                    log::error!(
                        "[Streaming] read of page {} of {:#010x} failed {} times, marking resource invalid",
                        entry.page_index,
                        entry.resource.bits(),
                        entry.retry_count
                    );
                    if !exhausted.contains(&entry.resource) {
                        exhausted.push(entry.resource);
                    }
                }
            }
        }
        for id in exhausted {
            self.exhausted += 1;
            registry.mark_invalid(id);
            self.skip_resource(loader, registry, id);
        }
        newly_ready
    }

    /// Downgrade every queued entry of `id` to a skip, releasing live reads
    /// and reserved slots.
    ///
    /// Entries stay queued so their staging blocks still free in FIFO order
    /// at pop time. Walks back to front so dependent pages drop their
    /// references before the pages they depend on release their slots.
    pub fn skip_resource(
        &mut self,
        loader: &mut dyn BlockLoader,
        registry: &mut ResourceRegistry,
        id: RuntimeResourceId,
    ) -> u32 {
        let mut count = 0;
        for entry in self.queue.iter_mut().rev() {
            if entry.resource != id || entry.state == FetchState::Skip {
                continue;
            }
            if let Some(handle) = entry.read.take() {
                loader.release(handle);
            }
            let owned = registry
                .registered_page(entry.slot)
                .is_some_and(|r| r.resource == entry.resource && r.page_index == entry.page_index);
            if owned {
                registry.release_slot(entry.slot);
            }
            entry.state = FetchState::Skip;
            count += 1;
        }
        self.skipped += count as u64;
        count
    }

    pub fn head(&self) -> Option<&PendingPage> {
        self.queue.front()
    }

    /// Staged payload of the front entry, available once it is `Ready`
    pub fn head_payload(&self) -> Option<&[u8]> {
        let entry = self.queue.front()?;
        if entry.state != FetchState::Ready {
            return None;
        }
        let start = entry.ring_offset as usize;
        Some(&self.staging[start..start + entry.bulk_size as usize])
    }

    /// Pop the front entry and free its staging block
    pub fn pop_head(&mut self) -> Option<PendingPage> {
        let entry = self.queue.pop_front()?;
        if entry.ring_allocated {
            self.ring.free(entry.bulk_size);
        }
        Some(entry)
    }

    pub fn completed_fetches(&self) -> u64 {
        self.completed
    }

    pub fn retried_fetches(&self) -> u64 {
        self.retried
    }

    pub fn exhausted_resources(&self) -> u64 {
        self.exhausted
    }

    pub fn skipped_pages(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::io::loader::MemoryBlockLoader;
    use crate::registry::resource::{PageStreamingState, Resource};

    struct Fixture {
        loader: MemoryBlockLoader,
        registry: ResourceRegistry,
        id: RuntimeResourceId,
        offsets: Vec<u64>,
    }

    const BULK: u32 = 64;

    impl Fixture {
        /// One root page plus three independent streaming pages, each backed
        /// by 64 distinct bytes in the store
        fn new() -> Self {
            let loader = MemoryBlockLoader::new(Vec::new());
            let mut offsets = vec![0];
            for page in 1..4u8 {
                offsets.push(loader.append(&[page; BULK as usize]));
            }
            let states = vec![
                PageStreamingState::new(0, 0, 0, 0),
                PageStreamingState::new(offsets[1], BULK, 0, 0),
                PageStreamingState::new(offsets[2], BULK, 0, 0),
                PageStreamingState::new(offsets[3], BULK, 0, 0),
            ];
            let resource =
                Resource::new(0xBEEF, 1, states, vec![], vec![0; 4 * 64], vec![]).unwrap();
            let mut registry = ResourceRegistry::new(&StreamingConfig::default());
            let id = registry.add(resource).unwrap().id;
            Self {
                loader,
                registry,
                id,
                offsets,
            }
        }

        fn enqueue(&mut self, pending: &mut PendingQueue, page_index: u32) -> u32 {
            let slot = self.registry.acquire_free_slot().unwrap();
            self.registry.register_page(self.id, page_index, slot, 0);
            pending.push(
                self.id,
                page_index,
                slot,
                self.offsets[page_index as usize],
                BULK,
            );
            slot
        }
    }

    #[test]
    fn test_fetch_completes_into_staging() {
        let mut f = Fixture::new();
        let mut pending = PendingQueue::new(1024);
        f.enqueue(&mut pending, 1);

        assert_eq!(pending.issue_fetches(&mut f.loader), 1);
        assert_eq!(pending.in_flight(), 1);
        let ready = pending.poll_completions(&mut f.loader, &mut f.registry, 3);
        assert_eq!(ready, 1);
        assert_eq!(pending.head_payload().unwrap(), &[1u8; BULK as usize]);
        assert_eq!(f.loader.live_reads(), 0);

        let entry = pending.pop_head().unwrap();
        assert_eq!(entry.state, FetchState::Ready);
        assert_eq!(pending.ring().outstanding(), 0);
    }

    #[test]
    fn test_full_ring_defers_tail_fetch() {
        let mut f = Fixture::new();
        // Room for one 64 byte block, not two.
        let mut pending = PendingQueue::new(100);
        f.enqueue(&mut pending, 1);
        f.enqueue(&mut pending, 2);

        assert_eq!(pending.issue_fetches(&mut f.loader), 1);
        assert_eq!(pending.poll_completions(&mut f.loader, &mut f.registry, 3), 1);
        assert_eq!(pending.issue_fetches(&mut f.loader), 0);
        assert!(pending.ring().failed_allocs() > 0);

        // Draining the head frees staging for the deferred entry.
        pending.pop_head();
        assert_eq!(pending.issue_fetches(&mut f.loader), 1);
        assert_eq!(pending.poll_completions(&mut f.loader, &mut f.registry, 3), 1);
        assert_eq!(pending.head_payload().unwrap(), &[2u8; BULK as usize]);
    }

    #[test]
    fn test_failure_recovers_within_budget() {
        let mut f = Fixture::new();
        let mut pending = PendingQueue::new(1024);
        f.loader
            .inject_failures(f.offsets[1], f.offsets[1] + BULK as u64, 1);
        f.enqueue(&mut pending, 1);

        pending.issue_fetches(&mut f.loader);
        // First poll sees the failure and re-issues in place.
        assert_eq!(pending.poll_completions(&mut f.loader, &mut f.registry, 3), 0);
        assert_eq!(pending.retried_fetches(), 1);
        assert_eq!(pending.poll_completions(&mut f.loader, &mut f.registry, 3), 1);
        assert_eq!(pending.head_payload().unwrap(), &[1u8; BULK as usize]);
        assert!(f.registry.is_valid_resource(f.id));
    }

    #[test]
    fn test_exhausted_retries_invalidate_resource() {
        let mut f = Fixture::new();
        let mut pending = PendingQueue::new(1024);
        f.loader
            .inject_failures(f.offsets[1], f.offsets[1] + BULK as u64, 3);
        let slot = f.enqueue(&mut pending, 1);
        f.enqueue(&mut pending, 2);

        pending.issue_fetches(&mut f.loader);
        for _ in 0..3 {
            pending.poll_completions(&mut f.loader, &mut f.registry, 3);
        }

        // Three failures used the whole budget; no fourth attempt.
        assert_eq!(f.loader.issued_reads(), 4);
        assert_eq!(pending.exhausted_resources(), 1);
        assert!(!f.registry.is_valid_resource(f.id));
        assert!(f.registry.registered_page(slot).is_none());
        assert!(pending
            .queue
            .iter()
            .all(|e| e.state == FetchState::Skip));
        assert_eq!(f.loader.live_reads(), 0);

        // Skips drain through the head like any other entry.
        while pending.pop_head().is_some() {}
        assert_eq!(pending.ring().outstanding(), 0);
    }

    #[test]
    fn test_skip_resource_releases_reads_and_slots() {
        let mut f = Fixture::new();
        let mut pending = PendingQueue::new(100);
        let s1 = f.enqueue(&mut pending, 1);
        let s2 = f.enqueue(&mut pending, 2);
        // Head is fetching, tail still waiting for staging space.
        pending.issue_fetches(&mut f.loader);

        let skipped = pending.skip_resource(&mut f.loader, &mut f.registry, f.id);
        assert_eq!(skipped, 2);
        assert_eq!(f.loader.live_reads(), 0);
        assert!(f.registry.registered_page(s1).is_none());
        assert!(f.registry.registered_page(s2).is_none());

        while pending.pop_head().is_some() {}
        assert!(pending.ring().is_empty());
    }
}
