//! Executor boundary between the cache and the GPU command substrate.
//!
//! The update cycle never talks to a device directly; it records
//! [`GpuCommand`]s and the orchestrating thread applies them through a
//! [`GpuExecutor`] after the cycle joins. [`MemoryExecutor`] is the CPU
//! reference implementation the test suite asserts against.

use crate::config::StreamingConfig;
use crate::gpu::layout;
use crate::scatter::ScatterUpdate;

/// The three GPU buffers the cache owns content in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetBuffer {
    /// Streaming page pool, resized by the pool size manager
    PagePool,
    /// Always-resident root page pool
    RootPool,
    /// Shared hierarchy node buffer
    Hierarchy,
}

/// One payload upload into a pool slot or hierarchy span
#[derive(Debug, Clone)]
pub struct PageUpload {
    pub target: TargetBuffer,
    pub dst_offset: u64,
    pub data: Vec<u8>,
}

/// Deferred GPU work recorded by one update cycle, applied in order
#[derive(Debug)]
pub enum GpuCommand {
    Resize {
        target: TargetBuffer,
        new_size: u64,
    },
    Memmove {
        target: TargetBuffer,
        dst_offset: u64,
        src_offset: u64,
        len: u64,
    },
    Upload(PageUpload),
    Scatter {
        target: TargetBuffer,
        updates: Vec<ScatterUpdate>,
    },
}

impl GpuCommand {
    pub fn apply(&self, executor: &mut dyn GpuExecutor) {
        match self {
            GpuCommand::Resize { target, new_size } => executor.resize_buffer(*target, *new_size),
            GpuCommand::Memmove {
                target,
                dst_offset,
                src_offset,
                len,
            } => executor.memmove(*target, *dst_offset, *src_offset, *len),
            GpuCommand::Upload(upload) => executor.upload_pages(std::slice::from_ref(upload)),
            GpuCommand::Scatter { target, updates } => executor.scatter_write(*target, updates),
        }
    }
}

/// GPU command substrate consumed by the cache.
///
/// Calls are synchronous from the cache's point of view; an implementation
/// may defer actual execution to a command queue it owns, as long as the
/// call order is preserved.
pub trait GpuExecutor {
    fn upload_pages(&mut self, uploads: &[PageUpload]);
    fn scatter_write(&mut self, target: TargetBuffer, updates: &[ScatterUpdate]);
    fn resize_buffer(&mut self, target: TargetBuffer, new_size: u64);
    fn memmove(&mut self, target: TargetBuffer, dst_offset: u64, src_offset: u64, len: u64);
}

/// CPU reference executor: three byte arrays with exact serial semantics
pub struct MemoryExecutor {
    page_pool: Vec<u8>,
    root_pool: Vec<u8>,
    hierarchy: Vec<u8>,
}

impl MemoryExecutor {
    pub fn new(page_pool_size: u64, root_pool_size: u64, hierarchy_size: u64) -> Self {
        Self {
            page_pool: vec![0; page_pool_size as usize],
            root_pool: vec![0; root_pool_size as usize],
            hierarchy: vec![0; hierarchy_size as usize],
        }
    }

    /// Buffers sized the way a manager built from `config` expects
    pub fn with_config(config: &StreamingConfig) -> Self {
        Self::new(
            config.initial_pool_pages as u64 * config.page_byte_size as u64,
            config.max_root_pages as u64 * config.root_page_byte_size as u64,
            config.max_hierarchy_nodes as u64 * layout::HIERARCHY_NODE_BYTES as u64,
        )
    }

    pub fn buffer(&self, target: TargetBuffer) -> &[u8] {
        match target {
            TargetBuffer::PagePool => &self.page_pool,
            TargetBuffer::RootPool => &self.root_pool,
            TargetBuffer::Hierarchy => &self.hierarchy,
        }
    }

    fn buffer_mut(&mut self, target: TargetBuffer) -> &mut Vec<u8> {
        match target {
            TargetBuffer::PagePool => &mut self.page_pool,
            TargetBuffer::RootPool => &mut self.root_pool,
            TargetBuffer::Hierarchy => &mut self.hierarchy,
        }
    }

    /// Read one little-endian word, the granularity scatter updates work at
    pub fn read_u32(&self, target: TargetBuffer, offset: u64) -> u32 {
        let buffer = self.buffer(target);
        let offset = offset as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buffer[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, target: TargetBuffer, offset: u64, value: u32) {
        let buffer = self.buffer_mut(target);
        let offset = offset as usize;
        buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl GpuExecutor for MemoryExecutor {
    fn upload_pages(&mut self, uploads: &[PageUpload]) {
        for upload in uploads {
            let buffer = self.buffer_mut(upload.target);
            let start = upload.dst_offset as usize;
            let end = start + upload.data.len();
            assert!(end <= buffer.len(), "upload past end of {:?}", upload.target);
            buffer[start..end].copy_from_slice(&upload.data);
        }
    }

    fn scatter_write(&mut self, target: TargetBuffer, updates: &[ScatterUpdate]) {
        for update in updates {
            let word = self.read_u32(target, update.offset);
            self.write_u32(target, update.offset, update.apply(word));
        }
    }

    fn resize_buffer(&mut self, target: TargetBuffer, new_size: u64) {
        self.buffer_mut(target).resize(new_size as usize, 0);
    }

    fn memmove(&mut self, target: TargetBuffer, dst_offset: u64, src_offset: u64, len: u64) {
        let buffer = self.buffer_mut(target);
        assert!(dst_offset + len <= buffer.len() as u64);
        assert!(src_offset + len <= buffer.len() as u64);
        buffer.copy_within(
            src_offset as usize..(src_offset + len) as usize,
            dst_offset as usize,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scatter::ScatterOp;

    #[test]
    fn test_upload_and_read_back() {
        let mut executor = MemoryExecutor::new(64, 64, 64);
        executor.upload_pages(&[PageUpload {
            target: TargetBuffer::PagePool,
            dst_offset: 8,
            data: 0xDEAD_BEEFu32.to_le_bytes().to_vec(),
        }]);
        assert_eq!(executor.read_u32(TargetBuffer::PagePool, 8), 0xDEAD_BEEF);
        assert_eq!(executor.read_u32(TargetBuffer::RootPool, 8), 0);
    }

    #[test]
    fn test_scatter_ops_apply_serially() {
        let mut executor = MemoryExecutor::new(16, 16, 16);
        executor.scatter_write(
            TargetBuffer::Hierarchy,
            &[
                ScatterUpdate {
                    op: ScatterOp::Write,
                    offset: 0,
                    value: 0xF0,
                },
                ScatterUpdate {
                    op: ScatterOp::And,
                    offset: 0,
                    value: 0x30,
                },
                ScatterUpdate {
                    op: ScatterOp::Or,
                    offset: 0,
                    value: 0x1,
                },
            ],
        );
        assert_eq!(executor.read_u32(TargetBuffer::Hierarchy, 0), 0x31);
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let mut executor = MemoryExecutor::new(8, 8, 8);
        executor.upload_pages(&[PageUpload {
            target: TargetBuffer::PagePool,
            dst_offset: 0,
            data: vec![1, 2, 3, 4],
        }]);
        executor.resize_buffer(TargetBuffer::PagePool, 16);
        assert_eq!(&executor.buffer(TargetBuffer::PagePool)[..4], &[1, 2, 3, 4]);
        assert_eq!(executor.buffer(TargetBuffer::PagePool).len(), 16);
        executor.resize_buffer(TargetBuffer::PagePool, 2);
        assert_eq!(executor.buffer(TargetBuffer::PagePool), &[1, 2]);
    }

    #[test]
    fn test_memmove_handles_overlap() {
        let mut executor = MemoryExecutor::new(8, 8, 8);
        executor.upload_pages(&[PageUpload {
            target: TargetBuffer::Hierarchy,
            dst_offset: 0,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        }]);
        executor.memmove(TargetBuffer::Hierarchy, 0, 2, 6);
        assert_eq!(
            executor.buffer(TargetBuffer::Hierarchy),
            &[3, 4, 5, 6, 7, 8, 7, 8]
        );
    }
}
