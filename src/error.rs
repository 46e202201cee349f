//! Error types for the streaming cache.
//!
//! Transient conditions (cache full this cycle, staging ring full, a fetch
//! that will be retried) are absorbed inside the update cycle and never
//! surface here. These variants cover configuration problems, capacity
//! exhaustion, and caller misuse.

/// Result alias used throughout the crate
pub type StreamingResult<T> = Result<T, StreamingError>;

/// Streaming cache errors
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("virtual page index space exhausted: {requested} pages requested, {available} available")]
    VirtualSpaceExhausted { requested: u32, available: u32 },

    #[error("root page pool exhausted: {requested} pages requested, {available} available")]
    RootPoolExhausted { requested: u32, available: u32 },

    #[error("hierarchy buffer exhausted: {requested} nodes requested, {available} available")]
    HierarchyExhausted { requested: u32, available: u32 },

    #[error("resource with persistent hash {hash:#018x} is already registered")]
    DuplicatePersistentHash { hash: u64 },

    #[error("unknown or stale resource id {id:#010x}")]
    UnknownResource { id: u32 },

    #[error("invalid resource: {message}")]
    InvalidResource { message: String },

    #[error("update cycle already active")]
    UpdateActive,

    #[error("no update cycle active")]
    UpdateNotActive,

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("i/o error: {message}")]
    Io { message: String },
}
