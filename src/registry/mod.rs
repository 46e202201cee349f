//! Resource registry: per-resource page metadata, dependency graphs, the
//! virtual page index space, and the LRU order over cache slots.

pub mod handle;
pub mod lru;
pub mod resource;
pub mod resource_registry;
pub mod virtual_table;

pub use handle::{RuntimeResourceId, MAX_RESOURCES};
pub use lru::{LruRegistry, INVALID_SLOT};
pub use resource::{PageStreamingState, Resource, PAGE_FLAG_RELATIVE_ENCODING};
pub use resource_registry::{AddOutcome, RegisteredPage, ResidentPage, ResourceRegistry, RuntimeResource};
pub use virtual_table::{VirtualPageEntry, VirtualPageTable};
