//! Allocators backing the cache: staging ring, contiguous span allocation,
//! and demand-driven pool sizing.

pub mod pool_size;
pub mod ring;
pub mod span;

pub use pool_size::PoolSizeManager;
pub use ring::RingAllocator;
pub use span::{SpanAllocator, SpanMove};
