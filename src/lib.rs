//! Streaming cache for virtual geometry.
//!
//! Mesh assets are split into fixed-size pages of cluster data plus a shared
//! traversal hierarchy. Root pages upload when a resource is added; the rest
//! stream on demand, driven by per-page priorities fed back from rendering.
//! [`StreamingManager`] owns the cache and runs one update cycle per frame:
//! completed fetches install into GPU pool slots, hierarchy links are patched
//! so cut consistency holds at every point in time, and cold pages are
//! evicted to make room.

pub mod alloc;
pub mod config;
pub mod error;
pub mod fixup;
pub mod gpu;
pub mod io;
pub mod manager;
pub mod pipeline;
pub mod registry;
pub mod scatter;

pub use config::StreamingConfig;
pub use error::{StreamingError, StreamingResult};
pub use fixup::{FixupChunk, FixupChunkBuilder};
pub use gpu::executor::{GpuCommand, GpuExecutor, MemoryExecutor, PageUpload, TargetBuffer};
pub use gpu::wgpu_executor::{WgpuExecutor, WgpuFeedbackReader};
pub use io::feedback::{FeedbackProvider, GpuPageRequest, NullFeedback, PageRequest, QueuedFeedback};
pub use io::file_loader::FileBlockLoader;
pub use io::loader::{BlockLoader, MemoryBlockLoader};
pub use manager::{StreamingManager, StreamingStats};
pub use registry::{
    PageStreamingState, Resource, RuntimeResourceId, PAGE_FLAG_RELATIVE_ENCODING,
};
pub use scatter::{ScatterBatcher, ScatterUpdate};
