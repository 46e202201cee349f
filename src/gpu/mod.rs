//! GPU-facing side of the cache: packed buffer layouts, the executor
//! boundary the cycle emits commands through, and the wgpu implementation.

pub mod executor;
pub mod layout;
pub mod wgpu_executor;

pub use executor::{GpuCommand, GpuExecutor, MemoryExecutor, PageUpload, TargetBuffer};
pub use wgpu_executor::{WgpuExecutor, WgpuFeedbackReader};
