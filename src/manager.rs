//! Update cycle orchestration and the public cache API.
//!
//! All cache state lives in [`StreamingState`] and is mutated by exactly one
//! update cycle at a time. `begin_cycle` hands the state to a worker thread
//! (or runs the cycle inline when async updates are disabled) and
//! `end_cycle` joins it and replays the cycle's recorded GPU commands in
//! order. `add`, `remove`, and cycle starts while a cycle is active are
//! caller errors, not races to resolve at runtime.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::alloc::pool_size::PoolSizeManager;
use crate::config::StreamingConfig;
use crate::error::{StreamingError, StreamingResult};
use crate::fixup::chunk::FixupChunk;
use crate::fixup::engine::{apply_fixups, init_resident_state, verify_consistency, FixupCtx};
use crate::gpu::executor::{GpuCommand, GpuExecutor, PageUpload, TargetBuffer};
use crate::gpu::layout::{page_slot_offset, HIERARCHY_NODE_BYTES};
use crate::io::feedback::{FeedbackProvider, PageRequest};
use crate::io::loader::BlockLoader;
use crate::pipeline::pending::{FetchState, PendingQueue};
use crate::pipeline::selector::PageSelector;
use crate::registry::handle::RuntimeResourceId;
use crate::registry::resource::Resource;
use crate::registry::resource_registry::{ResidentPage, ResourceRegistry};
use crate::scatter::ScatterBatcher;

/// Base priority of a prefetch due now; halves per frame of lead time
const PREFETCH_PRIORITY: u32 = 1 << 20;

/// Snapshot of one completed update cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingStats {
    pub update_index: u64,
    /// Streaming pool capacity in page slots
    pub pool_capacity: u32,
    pub registered_pages: u32,
    pub resident_pages: u32,
    pub pending_pages: u32,
    pub in_flight_fetches: u32,
    /// Distinct streaming pages requested this cycle
    pub requested_pages: u32,
    pub selected_pages: u32,
    pub installed_pages: u32,
    pub evicted_pages: u32,
    /// Selection ran out of evictable slots this cycle
    pub cache_full: bool,
    pub completed_fetches: u64,
    pub retried_fetches: u64,
    pub invalid_resources: u64,
    pub ring_peak_used: u32,
    pub pool_grow_count: u64,
    pub pool_shrink_count: u64,
}

/// One prefetch hint, re-requested every cycle until its window closes
struct PrefetchEntry {
    resource: RuntimeResourceId,
    frames_left: u32,
}

/// Everything one update cycle mutates. Moves to the worker thread for the
/// duration of a cycle and back when it completes.
struct StreamingState {
    config: StreamingConfig,
    registry: ResourceRegistry,
    pending: PendingQueue,
    selector: PageSelector,
    pool_size: PoolSizeManager,
    loader: Box<dyn BlockLoader>,
    hierarchy_batcher: ScatterBatcher,
    page_pool_batcher: ScatterBatcher,
    root_pool_batcher: ScatterBatcher,
    /// Resources added since the last cycle, awaiting root install
    pending_adds: Vec<RuntimeResourceId>,
    update_index: u64,
    /// Demand observed by the previous cycle, fed to the pool size manager
    last_demand: u32,
}

/// What the head of the pending queue turned out to hold
enum HeadPayload {
    Install {
        chunk: Arc<FixupChunk>,
        gpu_data: Vec<u8>,
    },
    Corrupt(String),
}

impl StreamingState {
    fn new(config: StreamingConfig, loader: Box<dyn BlockLoader>) -> Self {
        let registry = ResourceRegistry::new(&config);
        let pending = PendingQueue::new(config.ring_capacity());
        let pool_size = PoolSizeManager::new(
            config.initial_pool_pages,
            config.min_pool_pages,
            config.max_pool_pages,
            config.pool_grow_headroom,
            config.pool_grow_debounce_cycles,
            config.pool_shrink_decay,
            config.pool_shrink_debounce_cycles,
        );
        Self {
            config,
            registry,
            pending,
            selector: PageSelector::new(),
            pool_size,
            loader,
            hierarchy_batcher: ScatterBatcher::new(),
            page_pool_batcher: ScatterBatcher::new(),
            root_pool_batcher: ScatterBatcher::new(),
            pending_adds: Vec::new(),
            update_index: 0,
            last_demand: 0,
        }
    }

    /// Run one full update cycle, returning the GPU commands it recorded
    /// and a stats snapshot.
    fn run_cycle(&mut self, requests: Vec<PageRequest>) -> (Vec<GpuCommand>, StreamingStats) {
        self.update_index += 1;
        let mut commands = Vec::new();

        self.resize_pool(&mut commands);

        let added: Vec<RuntimeResourceId> = self.pending_adds.drain(..).collect();
        for id in added {
            self.install_added_resource(id, &mut commands);
        }

        self.pending.poll_completions(
            self.loader.as_mut(),
            &mut self.registry,
            self.config.retry_limit,
        );

        let installed = self.install_ready_pages(&mut commands);

        self.selector.gather(&mut self.registry, &requests);
        self.selector.propagate(&mut self.registry);
        let max_new = (self.config.max_pending_pages as usize).saturating_sub(self.pending.len());
        let outcome = {
            let mut ctx = FixupCtx {
                registry: &mut self.registry,
                hierarchy: &mut self.hierarchy_batcher,
                page_pool: &mut self.page_pool_batcher,
                root_pool: &mut self.root_pool_batcher,
                page_byte_size: self.config.page_byte_size,
                root_page_byte_size: self.config.root_page_byte_size,
            };
            self.selector
                .select(&mut ctx, &mut self.pending, self.update_index, max_new)
        };
        self.last_demand = self.registry.registered_count().max(outcome.requested);
        self.selector.reset(&mut self.registry);

        self.pending.issue_fetches(self.loader.as_mut());
        self.registry.maybe_compact_lru();

        self.flush_batchers(&mut commands);

        if self.config.enable_verification {
            let mut violations = verify_consistency(&self.registry);
            violations.extend(self.registry.verify_lru());
            for violation in &violations {
                log::error!("[Streaming] verification: {}", violation);
            }
            debug_assert!(violations.is_empty(), "cache state verification failed");
        }

        let stats = StreamingStats {
            update_index: self.update_index,
            pool_capacity: self.registry.capacity(),
            registered_pages: self.registry.registered_count(),
            resident_pages: self.registry.resident_count(),
            pending_pages: self.pending.len() as u32,
            in_flight_fetches: self.pending.in_flight() as u32,
            requested_pages: outcome.requested,
            selected_pages: outcome.selected,
            installed_pages: installed,
            evicted_pages: outcome.evicted,
            cache_full: outcome.cache_full,
            completed_fetches: self.pending.completed_fetches(),
            retried_fetches: self.pending.retried_fetches(),
            invalid_resources: self.registry.invalid_resources(),
            ring_peak_used: self.pending.ring().peak_used(),
            pool_grow_count: self.pool_size.grow_count(),
            pool_shrink_count: self.pool_size.shrink_count(),
        };
        log::debug!(
            "[Streaming] cycle {}: {} requested, {} selected, {} installed, {} evicted, {} pending",
            stats.update_index,
            stats.requested_pages,
            stats.selected_pages,
            stats.installed_pages,
            stats.evicted_pages,
            stats.pending_pages
        );
        (commands, stats)
    }

    fn fixup_ctx(&mut self) -> FixupCtx<'_> {
        FixupCtx {
            registry: &mut self.registry,
            hierarchy: &mut self.hierarchy_batcher,
            page_pool: &mut self.page_pool_batcher,
            root_pool: &mut self.root_pool_batcher,
            page_byte_size: self.config.page_byte_size,
            root_page_byte_size: self.config.root_page_byte_size,
        }
    }

    /// Feed last cycle's demand to the pool size manager and apply the new
    /// target, recording the buffer resize for the executor.
    fn resize_pool(&mut self, commands: &mut Vec<GpuCommand>) {
        let target = self.pool_size.update(self.last_demand);
        let capacity = self.registry.capacity();
        let page_size = self.config.page_byte_size as u64;
        if target > capacity {
            self.registry.grow_capacity(target);
            commands.push(GpuCommand::Resize {
                target: TargetBuffer::PagePool,
                new_size: target as u64 * page_size,
            });
            log::info!("[Streaming] page pool grew {} -> {} slots", capacity, target);
        } else if target < capacity {
            let reached = self.registry.try_shrink(target);
            if reached < capacity {
                commands.push(GpuCommand::Resize {
                    target: TargetBuffer::PagePool,
                    new_size: reached as u64 * page_size,
                });
                log::info!(
                    "[Streaming] page pool shrank {} -> {} slots",
                    capacity,
                    reached
                );
            }
        }
    }

    /// Upload a newly added resource's hierarchy span and install its root
    /// pages. A corrupt root page invalidates the whole resource.
    fn install_added_resource(&mut self, id: RuntimeResourceId, commands: &mut Vec<GpuCommand>) {
        // Removed again before its first cycle.
        let Some(runtime) = self.registry.get(id) else {
            return;
        };
        let base_node = runtime.hierarchy_base_node;
        let root_base = runtime.root_pool_base;
        let num_root = runtime.resource.num_root_pages();
        let num_pages = runtime.resource.num_pages();
        let node_count = runtime.resource.hierarchy_node_count();
        let blob = runtime.resource.hierarchy_nodes().to_vec();
        let root_page_byte_size = self.config.root_page_byte_size;

        commands.push(GpuCommand::Upload(PageUpload {
            target: TargetBuffer::Hierarchy,
            dst_offset: base_node as u64 * HIERARCHY_NODE_BYTES as u64,
            data: blob,
        }));

        for page_index in 0..num_root {
            let (payload, depth) = match self.registry.get(id) {
                Some(runtime) => (
                    runtime.resource.root_payload(page_index).to_vec(),
                    runtime.resource.page_state(page_index).max_hierarchy_depth,
                ),
                None => return,
            };
            let (chunk, consumed) = match FixupChunk::parse(&payload) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.reject_resource(id, page_index, &err.to_string());
                    return;
                }
            };
            if let Err(err) = chunk.validate_for_resource(num_pages, node_count, root_page_byte_size)
            {
                self.reject_resource(id, page_index, &err.to_string());
                return;
            }
            let gpu_data = &payload[consumed..];
            if gpu_data.len() > root_page_byte_size as usize {
                self.reject_resource(
                    id,
                    page_index,
                    &format!("{} payload bytes exceed the root page slot", gpu_data.len()),
                );
                return;
            }

            let chunk = Arc::new(chunk);
            let mut ctx = self.fixup_ctx();
            let state = init_resident_state(&mut ctx, id, page_index, &chunk);
            ctx.registry.set_root_resident(
                id,
                page_index,
                ResidentPage {
                    chunk,
                    state,
                    max_hierarchy_depth: depth,
                },
            );
            commands.push(GpuCommand::Upload(PageUpload {
                target: TargetBuffer::RootPool,
                dst_offset: page_slot_offset(root_base + page_index, root_page_byte_size),
                data: gpu_data.to_vec(),
            }));
            apply_fixups(&mut ctx, id, page_index, None, false, true);
        }
        log::info!(
            "[Streaming] installed {} root pages of {:#010x}",
            num_root,
            id.bits()
        );
    }

    fn reject_resource(&mut self, id: RuntimeResourceId, page_index: u32, reason: &str) {
        log::error!(
            "[Streaming] page {} of {:#010x} rejected: {}",
            page_index,
            id.bits(),
            reason
        );
        self.registry.mark_invalid(id);
        self.pending
            .skip_resource(self.loader.as_mut(), &mut self.registry, id);
    }

    /// Drain ready pages from the head of the pending queue into cache
    /// slots, honoring the per-cycle install count and byte budgets.
    fn install_ready_pages(&mut self, commands: &mut Vec<GpuCommand>) -> u32 {
        let max_installs = self.config.max_page_installs_per_update;
        let budget_bytes = self.config.install_budget_bytes;
        let page_byte_size = self.config.page_byte_size;
        let mut installed = 0u32;
        let mut installed_bytes = 0u64;

        loop {
            let Some(head) = self.pending.head() else {
                break;
            };
            let (head_state, id, page_index, slot) =
                (head.state, head.resource, head.page_index, head.slot);
            match head_state {
                FetchState::Skip => {
                    self.pending.pop_head();
                    continue;
                }
                FetchState::Ready => {}
                // FIFO: an unfinished fetch at the head blocks the queue.
                FetchState::Requested | FetchState::Fetching => break,
            }
            if installed >= max_installs {
                break;
            }

            let owned = self
                .registry
                .registered_page(slot)
                .is_some_and(|e| e.resource == id && e.page_index == page_index);
            debug_assert!(owned, "ready page lost its cache slot");
            if !owned || !self.registry.is_valid_resource(id) {
                if owned {
                    self.registry.release_slot(slot);
                }
                self.pending.pop_head();
                continue;
            }

            let (num_pages, node_count, depth) = match self.registry.get(id) {
                Some(runtime) => (
                    runtime.resource.num_pages(),
                    runtime.resource.hierarchy_node_count(),
                    runtime.resource.page_state(page_index).max_hierarchy_depth,
                ),
                None => {
                    self.pending.pop_head();
                    continue;
                }
            };

            let (outcome, staged_bytes) = {
                let Some(payload) = self.pending.head_payload() else {
                    break;
                };
                // The budget meters whole staged payloads, chunk metadata
                // included. The first install of a cycle always goes through
                // so an oversized page cannot starve the queue.
                if budget_bytes > 0
                    && installed > 0
                    && installed_bytes + payload.len() as u64 > budget_bytes
                {
                    break;
                }
                let outcome = match FixupChunk::parse(payload) {
                    Ok((chunk, consumed)) => {
                        let gpu_data = &payload[consumed..];
                        match chunk.validate_for_resource(num_pages, node_count, page_byte_size) {
                            Ok(()) if gpu_data.len() <= page_byte_size as usize => {
                                HeadPayload::Install {
                                    chunk: Arc::new(chunk),
                                    gpu_data: gpu_data.to_vec(),
                                }
                            }
                            Ok(()) => HeadPayload::Corrupt(format!(
                                "{} payload bytes exceed the page slot",
                                gpu_data.len()
                            )),
                            Err(err) => HeadPayload::Corrupt(err.to_string()),
                        }
                    }
                    Err(err) => HeadPayload::Corrupt(err.to_string()),
                };
                (outcome, payload.len() as u64)
            };

            match outcome {
                HeadPayload::Corrupt(reason) => {
                    // Turns the head into a skip; the next iteration drains
                    // it and every sibling behind it.
                    self.reject_resource(id, page_index, &reason);
                }
                HeadPayload::Install { chunk, gpu_data } => {
                    installed_bytes += staged_bytes;
                    let update_index = self.update_index;
                    let mut ctx = self.fixup_ctx();
                    let state = init_resident_state(&mut ctx, id, page_index, &chunk);
                    ctx.registry.mark_resident(
                        slot,
                        ResidentPage {
                            chunk,
                            state,
                            max_hierarchy_depth: depth,
                        },
                    );
                    ctx.registry.clear_install_pending(id, page_index);
                    ctx.registry.touch_slot(slot, update_index);
                    commands.push(GpuCommand::Upload(PageUpload {
                        target: TargetBuffer::PagePool,
                        dst_offset: page_slot_offset(slot, page_byte_size),
                        data: gpu_data,
                    }));
                    apply_fixups(&mut ctx, id, page_index, None, false, true);
                    self.pending.pop_head();
                    installed += 1;
                }
            }
        }
        installed
    }

    /// Emit each batcher's deduplicated writes as one scatter command per
    /// target buffer.
    fn flush_batchers(&mut self, commands: &mut Vec<GpuCommand>) {
        let batchers = [
            (&mut self.hierarchy_batcher, TargetBuffer::Hierarchy),
            (&mut self.page_pool_batcher, TargetBuffer::PagePool),
            (&mut self.root_pool_batcher, TargetBuffer::RootPool),
        ];
        for (batcher, target) in batchers {
            batcher.resolve_overwrites();
            if !batcher.is_empty() {
                commands.push(GpuCommand::Scatter {
                    target,
                    updates: batcher.flush(),
                });
            }
        }
    }
}

struct CycleJob {
    state: StreamingState,
    requests: Vec<PageRequest>,
}

struct CycleDone {
    state: StreamingState,
    commands: Vec<GpuCommand>,
    stats: StreamingStats,
}

/// Worker thread running one cycle at a time over a bounded handshake
struct CycleWorker {
    jobs: Option<Sender<CycleJob>>,
    done: Receiver<CycleDone>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CycleWorker {
    fn spawn() -> StreamingResult<Self> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<CycleJob>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<CycleDone>(1);
        let thread = thread::Builder::new()
            .name("vgstream-update".to_string())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let mut state = job.state;
                    let (commands, stats) = state.run_cycle(job.requests);
                    if done_tx
                        .send(CycleDone {
                            state,
                            commands,
                            stats,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .map_err(|e| StreamingError::Io {
                message: format!("spawning update thread: {}", e),
            })?;
        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }
}

impl Drop for CycleWorker {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Virtual geometry streaming cache.
///
/// Owns the page registry, the fetch pipeline, and the update cycle; talks
/// to the GPU through a [`GpuExecutor`] handed to [`end_cycle`], to backing
/// storage through a [`BlockLoader`], and to the renderer's request channel
/// through a [`FeedbackProvider`].
///
/// [`end_cycle`]: StreamingManager::end_cycle
pub struct StreamingManager {
    /// Cache state; `None` exactly while an async cycle is in flight
    state: Option<StreamingState>,
    worker: Option<CycleWorker>,
    feedback: Box<dyn FeedbackProvider>,
    explicit_requests: Vec<PageRequest>,
    prefetches: Vec<PrefetchEntry>,
    /// Recorded GPU work, replayed in order at `end_cycle`
    commands: Vec<GpuCommand>,
    update_active: bool,
    stats: StreamingStats,
}

impl StreamingManager {
    pub fn new(
        config: StreamingConfig,
        loader: Box<dyn BlockLoader>,
        feedback: Box<dyn FeedbackProvider>,
    ) -> StreamingResult<Self> {
        config.validate()?;
        let worker = if config.async_update {
            Some(CycleWorker::spawn()?)
        } else {
            None
        };
        log::info!(
            "[Streaming] manager ready: {} pool pages of {} bytes, {} root pages, ring {} bytes",
            config.initial_pool_pages,
            config.page_byte_size,
            config.max_root_pages,
            config.ring_capacity()
        );
        Ok(Self {
            state: Some(StreamingState::new(config, loader)),
            worker,
            feedback,
            explicit_requests: Vec::new(),
            prefetches: Vec::new(),
            commands: Vec::new(),
            update_active: false,
            stats: StreamingStats::default(),
        })
    }

    /// Register a resource with the cache.
    ///
    /// Allocates its virtual, root, and hierarchy spans immediately; the
    /// hierarchy upload and root page installs run in the next cycle. Fails
    /// if a cycle is active, the resource duplicates a registered persistent
    /// hash, a span is exhausted, or a page can never be staged.
    pub fn add(&mut self, resource: Resource) -> StreamingResult<RuntimeResourceId> {
        let Some(state) = self.state.as_mut() else {
            return Err(StreamingError::UpdateActive);
        };
        let ring_capacity = state.config.ring_capacity();
        for page_index in resource.num_root_pages()..resource.num_pages() {
            let bulk_size = resource.page_state(page_index).bulk_size;
            if bulk_size == 0 || bulk_size > ring_capacity {
                return Err(StreamingError::InvalidResource {
                    message: format!(
                        "page {} bulk size {} cannot be staged (ring capacity {})",
                        page_index, bulk_size, ring_capacity
                    ),
                });
            }
        }
        let outcome = state.registry.add(resource)?;
        for moved in &outcome.hierarchy_moves {
            self.commands.push(GpuCommand::Memmove {
                target: TargetBuffer::Hierarchy,
                dst_offset: moved.new_offset as u64 * HIERARCHY_NODE_BYTES as u64,
                src_offset: moved.old_offset as u64 * HIERARCHY_NODE_BYTES as u64,
                len: moved.size as u64 * HIERARCHY_NODE_BYTES as u64,
            });
        }
        state.pending_adds.push(outcome.id);
        Ok(outcome.id)
    }

    /// Unregister a resource.
    ///
    /// In-flight fetches for it turn into skips; resident pages are dropped
    /// without fixups since their hierarchy span dies with the resource.
    pub fn remove(&mut self, id: RuntimeResourceId) -> StreamingResult<()> {
        let Some(state) = self.state.as_mut() else {
            return Err(StreamingError::UpdateActive);
        };
        state
            .pending
            .skip_resource(state.loader.as_mut(), &mut state.registry, id);
        state.pending_adds.retain(|&pending| pending != id);
        state.registry.remove(id)
    }

    /// Resolve a persistent content hash to its runtime id. Unavailable
    /// while a cycle is active.
    pub fn lookup_by_hash(&self, hash: u64) -> Option<RuntimeResourceId> {
        self.state.as_ref()?.registry.lookup_by_hash(hash)
    }

    /// Queue explicit page requests for the next cycle
    pub fn request_pages(&mut self, requests: &[PageRequest]) {
        self.explicit_requests.extend_from_slice(requests);
    }

    /// Hint that `resource` is needed in `frames_until_needed` frames.
    ///
    /// Each following cycle requests its leading streaming pages, at a
    /// priority that doubles as the deadline approaches.
    pub fn prefetch_resource(&mut self, resource: RuntimeResourceId, frames_until_needed: u32) {
        self.prefetches.push(PrefetchEntry {
            resource,
            frames_left: frames_until_needed,
        });
    }

    /// Start one update cycle.
    ///
    /// Drains feedback, explicit, and prefetch requests, then dispatches the
    /// cycle to the worker thread (or runs it inline with async updates
    /// disabled).
    pub fn begin_cycle(&mut self) -> StreamingResult<()> {
        if self.update_active {
            return Err(StreamingError::UpdateActive);
        }
        let Some(state) = self.state.take() else {
            return Err(StreamingError::UpdateActive);
        };

        let mut requests = self.feedback.take_requests();
        requests.append(&mut self.explicit_requests);
        self.collect_prefetch_requests(&state, &mut requests);

        match self.worker.as_ref().and_then(|w| w.jobs.as_ref()) {
            Some(jobs) => {
                if let Err(err) = jobs.send(CycleJob { state, requests }) {
                    self.state = Some(err.into_inner().state);
                    return Err(StreamingError::Io {
                        message: "update thread is gone".to_string(),
                    });
                }
            }
            None => {
                let mut state = state;
                let (commands, stats) = state.run_cycle(requests);
                self.commands.extend(commands);
                self.stats = stats;
                self.state = Some(state);
            }
        }
        self.update_active = true;
        Ok(())
    }

    /// Join the active cycle and replay its GPU work through `executor`.
    ///
    /// Commands apply in recording order: hierarchy moves from resource
    /// adds, the pool resize, payload uploads, then the scatter passes.
    pub fn end_cycle(&mut self, executor: &mut dyn GpuExecutor) -> StreamingResult<StreamingStats> {
        if !self.update_active {
            return Err(StreamingError::UpdateNotActive);
        }
        if let Some(worker) = &self.worker {
            match worker.done.recv() {
                Ok(done) => {
                    self.state = Some(done.state);
                    self.commands.extend(done.commands);
                    self.stats = done.stats;
                }
                Err(_) => {
                    // Worker death loses the cache state; nothing to salvage.
                    log::error!("[Streaming] update thread died mid-cycle");
                    self.update_active = false;
                    return Err(StreamingError::Io {
                        message: "update thread is gone".to_string(),
                    });
                }
            }
        }
        for command in self.commands.drain(..) {
            command.apply(executor);
        }
        self.update_active = false;
        Ok(self.stats)
    }

    /// Whether external readers may touch the cache's GPU buffers right now
    pub fn is_safe_for_external_read(&self) -> bool {
        !self.update_active
    }

    /// Stats from the most recently completed cycle
    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    fn collect_prefetch_requests(&mut self, state: &StreamingState, requests: &mut Vec<PageRequest>) {
        let prefetch_pages = state.config.prefetch_page_count;
        self.prefetches.retain_mut(|entry| {
            let Some(runtime) = state.registry.get(entry.resource) else {
                return false;
            };
            let num_pages = runtime.resource.num_streaming_pages().min(prefetch_pages);
            if num_pages > 0 {
                requests.push(PageRequest {
                    resource: entry.resource,
                    page_start: runtime.resource.num_root_pages(),
                    num_pages,
                    priority: PREFETCH_PRIORITY >> entry.frames_left.min(20),
                });
            }
            let live = entry.frames_left > 0;
            entry.frames_left = entry.frames_left.saturating_sub(1);
            live
        });
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        // Retrieve the state of a still-running cycle so the worker isn't
        // torn down mid-flight; its GPU commands are dropped unapplied.
        if self.update_active {
            if let Some(worker) = &self.worker {
                let _ = worker.done.recv();
            }
            self.update_active = false;
        }
    }
}
