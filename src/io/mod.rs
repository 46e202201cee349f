//! External collaborators on the fetch side: the block-storage backend the
//! cache issues reads against, and the GPU feedback channel that carries
//! page requests back from rendering.

pub mod feedback;
pub mod file_loader;
pub mod loader;

pub use feedback::{
    decode_requests, FeedbackProvider, GpuPageRequest, NullFeedback, PageRequest, QueuedFeedback,
};
pub use file_loader::FileBlockLoader;
pub use loader::{BlockLoader, MemoryBlockLoader, ReadHandle};
