// Fetch pipeline under faults: transient read failures, exhausted retry
// budgets, corrupt page metadata, full caches, and removal with reads in
// flight. The cache must degrade to root-only rendering for a broken
// resource and keep every other resource streaming.
//
// Cycles run inline so each fault lands on a known update.

use vgstream::fixup::FixupChunkBuilder;
use vgstream::gpu::layout::{
    encode_child_ref, node_child_ref_offset, ClusterRecord, HierarchyNode, INVALID_CHILD_REF,
};
use vgstream::{
    MemoryBlockLoader, MemoryExecutor, NullFeedback, PageRequest, PageStreamingState, Resource,
    RuntimeResourceId, StreamingConfig, StreamingError, StreamingManager, StreamingStats,
    TargetBuffer,
};

const PAGE_SIZE: u32 = 4096;
const RING_CAPACITY: u32 = 64 * 1024;

fn test_config() -> StreamingConfig {
    StreamingConfig {
        initial_pool_pages: 8,
        min_pool_pages: 2,
        max_pool_pages: 8,
        page_byte_size: PAGE_SIZE,
        max_root_pages: 16,
        root_page_byte_size: PAGE_SIZE,
        max_hierarchy_nodes: 256,
        max_virtual_pages: 1 << 12,
        max_pending_pages: 8,
        max_page_installs_per_update: 8,
        retry_limit: 3,
        ring_capacity_bytes: RING_CAPACITY,
        async_update: false,
        enable_verification: true,
        ..StreamingConfig::default()
    }
}

fn authored_nodes(count: u32) -> Vec<u8> {
    let nodes = vec![HierarchyNode::authored(); count as usize];
    bytemuck::cast_slice(&nodes).to_vec()
}

fn cluster_payload(clusters: u32, fill: u32) -> Vec<u8> {
    let mut records = vec![ClusterRecord::authored(); clusters as usize];
    for record in &mut records {
        record.reserved[0] = fill;
    }
    bytemuck::cast_slice(&records).to_vec()
}

fn page_chunk(page: u32) -> Vec<u8> {
    let mut builder = FixupChunkBuilder::new();
    builder.begin_group(&[page]).part_fixup(page, 0, 0);
    let mut payload = builder.build();
    payload.extend_from_slice(&cluster_payload(1, 0xF0 + page));
    payload
}

/// Dependency chain 3 -> 2 -> 1 under one root page. `break_page` replaces
/// that page's payload with bytes that parse as nothing.
fn build_chain(loader: &MemoryBlockLoader, hash: u64, break_page: Option<u32>) -> Resource {
    let mut root = FixupChunkBuilder::new();
    root.begin_group(&[0]).part_fixup(0, 0, 0);
    let mut root_payload = root.build();
    root_payload.extend_from_slice(&cluster_payload(1, 0xF0));

    let mut states = vec![PageStreamingState::new(0, root_payload.len() as u32, 0, 0)];
    let mut deps: Vec<u32> = Vec::new();
    for page in 1..4u32 {
        let payload = if break_page == Some(page) {
            vec![0xFF; 64]
        } else {
            page_chunk(page)
        };
        let offset = loader.append(&payload);
        let deps_start = deps.len() as u32;
        if page >= 2 {
            deps.push(page - 1);
        }
        let deps_num = deps.len() as u32 - deps_start;
        states.push(PageStreamingState::new(
            offset,
            payload.len() as u32,
            deps_start,
            deps_num,
        ));
    }
    Resource::new(hash, 1, states, deps, authored_nodes(8), root_payload).unwrap()
}

struct Fixture {
    manager: StreamingManager,
    executor: MemoryExecutor,
    loader: MemoryBlockLoader,
}

impl Fixture {
    fn new(config: StreamingConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let loader = MemoryBlockLoader::new(Vec::new());
        let executor = MemoryExecutor::with_config(&config);
        let manager =
            StreamingManager::new(config, Box::new(loader.clone()), Box::new(NullFeedback))
                .unwrap();
        Self {
            manager,
            executor,
            loader,
        }
    }

    fn cycle(&mut self) -> StreamingStats {
        self.manager.begin_cycle().unwrap();
        self.manager.end_cycle(&mut self.executor).unwrap()
    }

    fn request(&mut self, resource: RuntimeResourceId, page_start: u32, num_pages: u32) {
        self.manager.request_pages(&[PageRequest {
            resource,
            page_start,
            num_pages,
            priority: 100,
        }]);
    }

    fn root_link(&self) -> u32 {
        self.executor
            .read_u32(TargetBuffer::Hierarchy, node_child_ref_offset(0, 0, 0))
    }

    /// Byte range of one streaming page in the backing store
    fn page_range(resource: &Resource, page: u32) -> (u64, u64) {
        let state = resource.page_state(page);
        (state.bulk_offset, state.bulk_offset + state.bulk_size as u64)
    }
}

#[test]
fn test_transient_failures_recover_within_retry_budget() {
    let mut f = Fixture::new(test_config());
    let resource = build_chain(&f.loader, 1, None);
    let (start, end) = Fixture::page_range(&resource, 1);
    f.loader.inject_failures(start, end, 2);
    let id = f.manager.add(resource).unwrap();
    f.cycle();

    f.request(id, 3, 1);
    f.cycle();

    // The failing head blocks its siblings; both retries happen in place.
    let stats = f.cycle();
    assert_eq!(stats.installed_pages, 0);
    assert_eq!(stats.retried_fetches, 1);
    let stats = f.cycle();
    assert_eq!(stats.installed_pages, 0);
    assert_eq!(stats.retried_fetches, 2);

    let stats = f.cycle();
    assert_eq!(stats.installed_pages, 3);
    assert_eq!(stats.resident_pages, 3);
    assert_eq!(stats.invalid_resources, 0);
    assert_eq!(f.loader.failed_reads(), 2);
    assert_eq!(f.loader.issued_reads(), 5);
}

#[test]
fn test_exhausted_retries_invalidate_resource() {
    let mut f = Fixture::new(test_config());
    let resource = build_chain(&f.loader, 1, None);
    let (start, end) = Fixture::page_range(&resource, 1);
    f.loader.inject_failures(start, end, 3);
    let id = f.manager.add(resource).unwrap();
    f.cycle();

    f.request(id, 3, 1);
    f.cycle();
    f.cycle();
    f.cycle();
    let stats = f.cycle();

    // Three failures exhausted the budget: the whole resource is out,
    // including its two healthy queued pages.
    assert_eq!(stats.invalid_resources, 1);
    assert_eq!(stats.retried_fetches, 2);
    assert_eq!(stats.pending_pages, 0);
    assert_eq!(stats.resident_pages, 0);
    assert_eq!(stats.registered_pages, 0);
    assert_eq!(f.loader.live_reads(), 0);

    // Root pages stay linked, so the resource still renders coarsely.
    assert_eq!(f.root_link(), encode_child_ref(true, 0, 0));

    // Later requests against it are ignored rather than re-fetched.
    f.request(id, 3, 1);
    let stats = f.cycle();
    assert_eq!(stats.requested_pages, 0);
    assert_eq!(stats.selected_pages, 0);
}

#[test]
fn test_corrupt_page_invalidates_resource() {
    let mut f = Fixture::new(test_config());
    let resource = build_chain(&f.loader, 1, Some(1));
    let id = f.manager.add(resource).unwrap();
    f.cycle();

    f.request(id, 3, 1);
    f.cycle();
    let stats = f.cycle();
    assert_eq!(stats.installed_pages, 0);
    assert_eq!(stats.invalid_resources, 1);
    assert_eq!(stats.pending_pages, 0);
    assert_eq!(stats.resident_pages, 0);
    assert_eq!(f.root_link(), encode_child_ref(true, 0, 0));
}

#[test]
fn test_corrupt_root_rejects_resource_at_install() {
    let mut f = Fixture::new(test_config());
    let root_payload = vec![0xABu8; 96];
    let states = vec![PageStreamingState::new(0, root_payload.len() as u32, 0, 0)];
    let resource =
        Resource::new(2, 1, states, vec![], authored_nodes(1), root_payload).unwrap();
    f.manager.add(resource).unwrap();

    let stats = f.cycle();
    assert_eq!(stats.invalid_resources, 1);
    assert_eq!(stats.resident_pages, 0);
    // The hierarchy upload happened, but nothing ever linked into it.
    assert_eq!(f.root_link(), INVALID_CHILD_REF);
}

#[test]
fn test_full_cache_defers_then_recovers_by_growing() {
    let config = StreamingConfig {
        initial_pool_pages: 2,
        min_pool_pages: 2,
        ..test_config()
    };
    let mut f = Fixture::new(config);
    let resource = build_chain(&f.loader, 1, None);
    let id = f.manager.add(resource).unwrap();
    f.cycle();

    f.request(id, 3, 1);
    let stats = f.cycle();
    assert_eq!(stats.selected_pages, 2);
    assert!(stats.cache_full);

    // The tail stays deferred while its dependencies pin both slots.
    f.request(id, 3, 1);
    let stats = f.cycle();
    assert_eq!(stats.resident_pages, 2);
    assert!(stats.cache_full);
    assert_eq!(
        f.executor
            .read_u32(TargetBuffer::Hierarchy, node_child_ref_offset(0, 3, 0)),
        INVALID_CHILD_REF
    );

    // Sustained demand grows the pool and the tail streams in.
    f.request(id, 3, 1);
    let stats = f.cycle();
    assert_eq!(stats.pool_capacity, 4);
    assert_eq!(stats.selected_pages, 1);
    let stats = f.cycle();
    assert_eq!(stats.resident_pages, 3);
    for (node, slot) in [(1u32, 0u32), (2, 1), (3, 2)] {
        assert_eq!(
            f.executor
                .read_u32(TargetBuffer::Hierarchy, node_child_ref_offset(0, node, 0)),
            encode_child_ref(false, slot, 0)
        );
    }
}

#[test]
fn test_unstageable_page_rejected_at_add() {
    let mut f = Fixture::new(test_config());

    let root_payload = {
        let mut root = FixupChunkBuilder::new();
        root.begin_group(&[0]).part_fixup(0, 0, 0);
        let mut payload = root.build();
        payload.extend_from_slice(&cluster_payload(1, 0xF0));
        payload
    };
    let oversized = Resource::new(
        1,
        1,
        vec![
            PageStreamingState::new(0, root_payload.len() as u32, 0, 0),
            PageStreamingState::new(0, RING_CAPACITY + 1, 0, 0),
        ],
        vec![],
        authored_nodes(2),
        root_payload.clone(),
    )
    .unwrap();
    assert!(matches!(
        f.manager.add(oversized),
        Err(StreamingError::InvalidResource { .. })
    ));

    let empty = Resource::new(
        2,
        1,
        vec![
            PageStreamingState::new(0, root_payload.len() as u32, 0, 0),
            PageStreamingState::new(0, 0, 0, 0),
        ],
        vec![],
        authored_nodes(2),
        root_payload,
    )
    .unwrap();
    assert!(matches!(
        f.manager.add(empty),
        Err(StreamingError::InvalidResource { .. })
    ));
}

#[test]
fn test_remove_mid_flight_releases_reads() {
    let mut f = Fixture::new(test_config());
    f.loader.set_latency(10);
    let resource = build_chain(&f.loader, 1, None);
    let id = f.manager.add(resource).unwrap();
    f.cycle();

    f.request(id, 3, 1);
    let stats = f.cycle();
    assert_eq!(stats.in_flight_fetches, 3);
    assert_eq!(f.loader.live_reads(), 3);

    f.manager.remove(id).unwrap();
    assert_eq!(f.loader.live_reads(), 0);

    let stats = f.cycle();
    assert_eq!(stats.pending_pages, 0);
    assert_eq!(stats.registered_pages, 0);
    assert_eq!(stats.requested_pages, 0);
}
