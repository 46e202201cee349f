//! Structural hierarchy patching.
//!
//! Pages carry metadata describing how to splice their geometry into the
//! shared hierarchy when they become resident, and how to undo it when they
//! leave. The engine in this module is the only code that toggles those
//! patches, which keeps the dependency-consistency rule in one place: a
//! page's hierarchy linkage is active only while every page it depends on
//! is resident.

pub mod chunk;
pub mod engine;

pub use chunk::{
    FixupChunk, FixupChunkBuilder, FixupState, GroupFixup, ParentFixup, PartEntry, PartFixup,
    FIXUP_CHUNK_MAGIC,
};
pub use engine::{apply_fixups, init_resident_state, verify_consistency, FixupCtx};
