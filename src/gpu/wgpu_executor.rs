//! wgpu-backed executor and feedback reader.
//!
//! The executor keeps a CPU shadow of each buffer so masked scatter ops and
//! overlapping moves have exact serial semantics without a compute pass;
//! dirty words are written back as coalesced runs. The feedback reader polls
//! a GPU-written request buffer through the usual copy / map_async dance.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StreamingConfig;
use crate::gpu::executor::{GpuExecutor, PageUpload, TargetBuffer};
use crate::gpu::layout;
use crate::io::feedback::{decode_requests, FeedbackProvider, GpuPageRequest, PageRequest};
use crate::scatter::ScatterUpdate;

struct TargetState {
    buffer: wgpu::Buffer,
    shadow: Vec<u8>,
    label: &'static str,
}

/// GPU executor over a wgpu device/queue pair
pub struct WgpuExecutor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    page_pool: TargetState,
    root_pool: TargetState,
    hierarchy: TargetState,
}

impl WgpuExecutor {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        page_pool_size: u64,
        root_pool_size: u64,
        hierarchy_size: u64,
    ) -> Self {
        let make = |device: &wgpu::Device, label: &'static str, size: u64| TargetState {
            buffer: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            shadow: vec![0; size as usize],
            label,
        };
        log::info!(
            "[WgpuExecutor] pools: page {} B, root {} B, hierarchy {} B",
            page_pool_size,
            root_pool_size,
            hierarchy_size
        );
        Self {
            page_pool: make(&device, "Streaming Page Pool", page_pool_size),
            root_pool: make(&device, "Root Page Pool", root_pool_size),
            hierarchy: make(&device, "Hierarchy Buffer", hierarchy_size),
            device,
            queue,
        }
    }

    /// Buffers sized the way a manager built from `config` expects
    pub fn with_config(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: &StreamingConfig,
    ) -> Self {
        Self::new(
            device,
            queue,
            config.initial_pool_pages as u64 * config.page_byte_size as u64,
            config.max_root_pages as u64 * config.root_page_byte_size as u64,
            config.max_hierarchy_nodes as u64 * layout::HIERARCHY_NODE_BYTES as u64,
        )
    }

    /// The live wgpu buffer for `target`, for render bind groups.
    ///
    /// Resizes replace the buffer, so bind groups must be rebuilt after any
    /// cycle that resized a pool.
    pub fn buffer(&self, target: TargetBuffer) -> &wgpu::Buffer {
        &self.state(target).buffer
    }

    fn state(&self, target: TargetBuffer) -> &TargetState {
        match target {
            TargetBuffer::PagePool => &self.page_pool,
            TargetBuffer::RootPool => &self.root_pool,
            TargetBuffer::Hierarchy => &self.hierarchy,
        }
    }

    fn state_mut(&mut self, target: TargetBuffer) -> &mut TargetState {
        match target {
            TargetBuffer::PagePool => &mut self.page_pool,
            TargetBuffer::RootPool => &mut self.root_pool,
            TargetBuffer::Hierarchy => &mut self.hierarchy,
        }
    }
}

impl GpuExecutor for WgpuExecutor {
    fn upload_pages(&mut self, uploads: &[PageUpload]) {
        for upload in uploads {
            let queue = self.queue.clone();
            let state = self.state_mut(upload.target);
            let start = upload.dst_offset as usize;
            let end = start + upload.data.len();
            state.shadow[start..end].copy_from_slice(&upload.data);
            queue.write_buffer(&state.buffer, upload.dst_offset, &upload.data);
        }
    }

    fn scatter_write(&mut self, target: TargetBuffer, updates: &[ScatterUpdate]) {
        if updates.is_empty() {
            return;
        }
        let queue = self.queue.clone();
        let state = self.state_mut(target);

        let mut touched: Vec<u64> = Vec::with_capacity(updates.len());
        for update in updates {
            let offset = update.offset as usize;
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&state.shadow[offset..offset + 4]);
            let word = update.apply(u32::from_le_bytes(bytes));
            state.shadow[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
            touched.push(update.offset);
        }
        touched.sort_unstable();
        touched.dedup();

        // Write back contiguous word runs in one write_buffer each.
        let mut run_start = 0usize;
        while run_start < touched.len() {
            let mut run_end = run_start;
            while run_end + 1 < touched.len() && touched[run_end + 1] == touched[run_end] + 4 {
                run_end += 1;
            }
            let first = touched[run_start] as usize;
            let last = touched[run_end] as usize + 4;
            queue.write_buffer(&state.buffer, first as u64, &state.shadow[first..last]);
            run_start = run_end + 1;
        }
    }

    fn resize_buffer(&mut self, target: TargetBuffer, new_size: u64) {
        let device = self.device.clone();
        let queue = self.queue.clone();
        let state = self.state_mut(target);
        let old_size = state.shadow.len() as u64;
        if old_size == new_size {
            return;
        }
        log::info!(
            "[WgpuExecutor] resizing {} {} -> {} bytes",
            state.label,
            old_size,
            new_size
        );

        let new_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(state.label),
            size: new_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Pool Resize"),
        });
        encoder.copy_buffer_to_buffer(&state.buffer, 0, &new_buffer, 0, old_size.min(new_size));
        queue.submit(std::iter::once(encoder.finish()));

        state.buffer = new_buffer;
        state.shadow.resize(new_size as usize, 0);
    }

    fn memmove(&mut self, target: TargetBuffer, dst_offset: u64, src_offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let queue = self.queue.clone();
        let state = self.state_mut(target);
        state.shadow.copy_within(
            src_offset as usize..(src_offset + len) as usize,
            dst_offset as usize,
        );
        // The shadow already holds the moved bytes; an upload avoids the
        // overlapping-copy restriction on copy_buffer_to_buffer.
        let range = dst_offset as usize..(dst_offset + len) as usize;
        queue.write_buffer(&state.buffer, dst_offset, &state.shadow[range]);
    }
}

struct ReaderInner {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    request_buffer: Arc<wgpu::Buffer>,
    readback: wgpu::Buffer,
    pending_map: Option<flume::Receiver<Result<(), wgpu::BufferAsyncError>>>,
    pending_magic: u8,
    latest: Vec<PageRequest>,
}

/// Polls the GPU request buffer for completed feedback batches.
///
/// Clones share state: the render loop keeps one clone to kick off reads
/// after submitting the frame that writes the request buffer, while the
/// cache owns another as its [`FeedbackProvider`].
#[derive(Clone)]
pub struct WgpuFeedbackReader {
    inner: Arc<Mutex<ReaderInner>>,
}

impl WgpuFeedbackReader {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        request_buffer: Arc<wgpu::Buffer>,
        capacity_records: u32,
    ) -> Self {
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Feedback Readback"),
            size: capacity_records as u64 * std::mem::size_of::<GpuPageRequest>() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            inner: Arc::new(Mutex::new(ReaderInner {
                device,
                queue,
                request_buffer,
                readback,
                pending_map: None,
                pending_magic: 0,
                latest: Vec::new(),
            })),
        }
    }

    /// Copy the request buffer and start an async map for the frame tagged
    /// `frame_magic`. Skipped while an earlier read is still mapping.
    pub fn begin_read(&self, frame_magic: u8) {
        let mut inner = self.inner.lock();
        if inner.pending_map.is_some() {
            return;
        }
        let mut encoder = inner
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Feedback Readback"),
            });
        encoder.copy_buffer_to_buffer(
            &inner.request_buffer,
            0,
            &inner.readback,
            0,
            inner.readback.size(),
        );
        inner.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = flume::bounded(1);
        inner
            .readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                tx.send(result).ok();
            });
        inner.pending_map = Some(rx);
        inner.pending_magic = frame_magic;
    }

    fn poll(&self) {
        let mut inner = self.inner.lock();
        let Some(rx) = &inner.pending_map else {
            return;
        };
        inner.device.poll(wgpu::Maintain::Poll);
        match rx.try_recv() {
            Ok(Ok(())) => {
                let records: Vec<GpuPageRequest> = {
                    let data = inner.readback.slice(..).get_mapped_range();
                    bytemuck::cast_slice(&data).to_vec()
                };
                inner.readback.unmap();
                let magic = inner.pending_magic;
                inner.latest = decode_requests(&records, magic);
                inner.pending_map = None;
            }
            Ok(Err(e)) => {
                log::warn!("[WgpuFeedbackReader] map failed: {:?}", e);
                inner.pending_map = None;
            }
            Err(flume::TryRecvError::Empty) => {}
            Err(flume::TryRecvError::Disconnected) => {
                inner.pending_map = None;
            }
        }
    }
}

impl FeedbackProvider for WgpuFeedbackReader {
    fn take_requests(&mut self) -> Vec<PageRequest> {
        self.poll();
        std::mem::take(&mut self.inner.lock().latest)
    }
}
