//! Applies and reverts fixup chunks.
//!
//! All writes go through the scatter batchers, never straight to a buffer,
//! so one cycle's worth of installs, evictions, and reconsiderations
//! collapses into one deterministic write pass per target buffer.
//!
//! Convention: a group's dependency range includes the owning page itself.
//! Installing marks the owner resident first and then applies, so self
//! dependencies hold; uninstalling passes the owner as the excluded page,
//! which fails the precondition and reverts the group.

use std::sync::Arc;

use crate::fixup::chunk::{FixupChunk, FixupState, PartEntry};
use crate::gpu::layout::{
    encode_child_ref, node_child_ref_offset, node_error_offset, page_slot_offset,
    cluster_flags_offset, CLUSTER_FLAG_STREAMING_LEAF, ERROR_PROVISIONAL_LEAF_BIT,
    INVALID_CHILD_REF,
};
use crate::registry::handle::RuntimeResourceId;
use crate::registry::resource_registry::{ResidentPage, ResourceRegistry};
use crate::scatter::{ScatterBatcher, ScatterOp};

/// Mutable context threaded through one cycle's fixup work
pub struct FixupCtx<'a> {
    pub registry: &'a mut ResourceRegistry,
    /// Batcher for the hierarchy node buffer
    pub hierarchy: &'a mut ScatterBatcher,
    /// Batcher for the streaming page pool
    pub page_pool: &'a mut ScatterBatcher,
    /// Batcher for the root page pool
    pub root_pool: &'a mut ScatterBatcher,
    pub page_byte_size: u32,
    pub root_page_byte_size: u32,
}

/// Toggle the fixup groups of `(id, page_index)` toward installed
/// (`uninstall == false`) or uninstalled.
///
/// `excluded` is treated as non-resident during precondition checks; pass
/// the page being evicted so its own groups and its siblings' groups revert.
/// Pages on the chunk's reconsider list are re-evaluated in the same
/// direction, one level deep only.
pub fn apply_fixups(
    ctx: &mut FixupCtx,
    id: RuntimeResourceId,
    page_index: u32,
    excluded: Option<u32>,
    uninstall: bool,
    allow_reconsider: bool,
) {
    let Some(chunk) = ctx.registry.resident_chunk(id, page_index) else {
        return;
    };
    let Some((owner_is_root, owner_location)) = ctx.registry.page_location(id, page_index) else {
        return;
    };
    let Some(runtime) = ctx.registry.get(id) else {
        return;
    };
    let hierarchy_base = runtime.hierarchy_base_node;
    let target = !uninstall;

    for (group_index, group) in chunk.groups().iter().enumerate() {
        let installed = ctx
            .registry
            .resident_page(id, page_index)
            .map(|r| r.state.is_installed(group_index))
            .unwrap_or(false);
        if installed == target && !allow_reconsider {
            continue;
        }

        let deps_ok = chunk.group_dependencies(group).iter().all(|&dep| {
            excluded != Some(dep) && ctx.registry.is_page_resident(id, dep)
        });
        if deps_ok == installed || deps_ok != target {
            continue;
        }

        if let Some(state) = ctx.registry.fixup_state_mut(id, page_index) {
            state.installed.set(group_index, target);
        }

        for part in chunk.group_part_fixups(group) {
            let offset = node_child_ref_offset(hierarchy_base, part.node_index, part.child_slot());
            let value = if target {
                encode_child_ref(owner_is_root, owner_location, part.part_index())
            } else {
                INVALID_CHILD_REF
            };
            ctx.hierarchy.push(ScatterOp::Write, offset, value);
        }

        for parent in chunk.group_parent_fixups(group) {
            apply_parent_delta(
                ctx,
                id,
                parent.parent_page,
                parent.part_entry_index,
                uninstall,
            );
        }
    }

    if allow_reconsider {
        for &sibling in chunk.reconsider_pages() {
            if ctx.registry.is_page_resident(id, sibling) {
                apply_fixups(ctx, id, sibling, excluded, uninstall, false);
            }
        }
    }
}

/// Adjust one part entry's missing-contributor count on an ancestor page,
/// flipping its provisional-leaf bits when the count crosses zero.
fn apply_parent_delta(
    ctx: &mut FixupCtx,
    id: RuntimeResourceId,
    parent_page: u32,
    entry_index: u32,
    increment: bool,
) {
    // A non-resident parent rebuilds its counters from scratch on install.
    let Some(parent_chunk) = ctx.registry.resident_chunk(id, parent_page) else {
        return;
    };
    let Some(entry) = parent_chunk.part_entries().get(entry_index as usize).copied() else {
        log::error!(
            "[Fixup] parent fixup references entry {} of page {} which has {}",
            entry_index,
            parent_page,
            parent_chunk.part_entries().len()
        );
        return;
    };
    let Some((parent_is_root, parent_location)) = ctx.registry.page_location(id, parent_page)
    else {
        return;
    };
    let hierarchy_base = match ctx.registry.get(id) {
        Some(runtime) => runtime.hierarchy_base_node,
        None => return,
    };

    let crossed = {
        let Some(state) = ctx.registry.fixup_state_mut(id, parent_page) else {
            return;
        };
        let Some(count) = state.leaf_counts.get_mut(entry_index as usize) else {
            return;
        };
        if increment {
            *count += 1;
            *count == 1
        } else {
            debug_assert!(*count > 0);
            *count = count.saturating_sub(1);
            *count == 0
        }
    };
    if crossed {
        emit_leaf_bits(
            ctx,
            hierarchy_base,
            parent_is_root,
            parent_location,
            &entry,
            increment,
        );
    }
}

/// Write the provisional-leaf markers for one part entry: a sign bit on the
/// node's error word and a streaming-leaf flag on each covered cluster.
fn emit_leaf_bits(
    ctx: &mut FixupCtx,
    hierarchy_base: u32,
    page_is_root: bool,
    page_location: u32,
    entry: &PartEntry,
    provisional: bool,
) {
    let error_offset = node_error_offset(hierarchy_base, entry.node_index, entry.child_slot);
    if provisional {
        ctx.hierarchy
            .push(ScatterOp::Or, error_offset, ERROR_PROVISIONAL_LEAF_BIT);
    } else {
        ctx.hierarchy
            .push(ScatterOp::And, error_offset, !ERROR_PROVISIONAL_LEAF_BIT);
    }

    let (batcher, slot_size) = if page_is_root {
        (&mut *ctx.root_pool, ctx.root_page_byte_size)
    } else {
        (&mut *ctx.page_pool, ctx.page_byte_size)
    };
    let page_base = page_slot_offset(page_location, slot_size);
    for cluster in entry.cluster_start..entry.cluster_start + entry.cluster_num {
        let offset = cluster_flags_offset(page_base, cluster);
        if provisional {
            batcher.push(ScatterOp::Or, offset, CLUSTER_FLAG_STREAMING_LEAF);
        } else {
            batcher.push(ScatterOp::And, offset, !CLUSTER_FLAG_STREAMING_LEAF);
        }
    }
}

/// Evict the page registered in `slot`: revert its fixup groups and any
/// gated sibling groups, then release the slot.
pub fn evict_slot(ctx: &mut FixupCtx, slot: u32) {
    let Some((id, page_index)) = ctx
        .registry
        .registered_page(slot)
        .map(|entry| (entry.resource, entry.page_index))
    else {
        return;
    };
    log::debug!(
        "[Fixup] evicting page {} of {:#010x} from slot {}",
        page_index,
        id.bits(),
        slot
    );
    apply_fixups(ctx, id, page_index, Some(page_index), true, true);
    ctx.registry.release_slot(slot);
}

/// Build the fixup state for a page about to become resident.
///
/// Counts the missing contributors of every part entry and emits the
/// matching provisional-leaf bits unconditionally, which also repairs words
/// left stale by an earlier eviction of this page.
pub fn init_resident_state(
    ctx: &mut FixupCtx,
    id: RuntimeResourceId,
    page_index: u32,
    chunk: &Arc<FixupChunk>,
) -> FixupState {
    let mut state = FixupState::new(chunk);
    let Some((is_root, location)) = ctx.registry.page_location(id, page_index) else {
        return state;
    };
    let hierarchy_base = match ctx.registry.get(id) {
        Some(runtime) => runtime.hierarchy_base_node,
        None => return state,
    };
    for (entry_index, entry) in chunk.part_entries().iter().enumerate() {
        let missing = chunk
            .entry_dependencies(entry)
            .iter()
            .filter(|&&contributor| !contributes(ctx.registry, id, contributor, page_index, entry_index as u32))
            .count() as u32;
        state.leaf_counts[entry_index] = missing;
        emit_leaf_bits(ctx, hierarchy_base, is_root, location, entry, missing > 0);
    }
    state
}

/// Whether `contributor`'s group that reports into `(owner_page,
/// entry_index)` is currently installed.
fn contributes(
    registry: &ResourceRegistry,
    id: RuntimeResourceId,
    contributor: u32,
    owner_page: u32,
    entry_index: u32,
) -> bool {
    let Some(resident) = registry.resident_page(id, contributor) else {
        return false;
    };
    for (group_index, group) in resident.chunk.groups().iter().enumerate() {
        for parent in resident.chunk.group_parent_fixups(group) {
            if parent.parent_page == owner_page && parent.part_entry_index == entry_index {
                return resident.state.is_installed(group_index);
            }
        }
    }
    false
}

/// Recompute every resident page's expected fixup state and report
/// mismatches. Empty means the dependency-consistency invariant holds.
pub fn verify_consistency(registry: &ResourceRegistry) -> Vec<String> {
    let mut violations = Vec::new();
    for (id, runtime) in registry.resources() {
        for page_index in 0..runtime.resource.num_root_pages() {
            if let Some(resident) = runtime.root_resident[page_index as usize].as_ref() {
                verify_page(registry, id, page_index, resident, &mut violations);
            }
        }
    }
    for (_slot, entry) in registry.registered_pages() {
        let Some(resident) = entry.resident.as_ref() else {
            continue;
        };
        let Some(runtime) = registry.get(entry.resource) else {
            violations.push(format!(
                "slot for page {} of {:#010x} outlives its resource",
                entry.page_index,
                entry.resource.bits()
            ));
            continue;
        };
        for &dep in runtime.resource.page_dependencies(entry.page_index) {
            if !registry.is_page_resident(entry.resource, dep) {
                violations.push(format!(
                    "page {} of {:#010x} is resident but dependency {} is not",
                    entry.page_index,
                    entry.resource.bits(),
                    dep
                ));
            }
        }
        verify_page(registry, entry.resource, entry.page_index, resident, &mut violations);
    }
    violations
}

fn verify_page(
    registry: &ResourceRegistry,
    id: RuntimeResourceId,
    page_index: u32,
    resident: &ResidentPage,
    violations: &mut Vec<String>,
) {
    for (group_index, group) in resident.chunk.groups().iter().enumerate() {
        let expected = resident
            .chunk
            .group_dependencies(group)
            .iter()
            .all(|&dep| registry.is_page_resident(id, dep));
        let actual = resident.state.is_installed(group_index);
        if expected != actual {
            violations.push(format!(
                "page {} of {:#010x}: group {} installed={} but dependencies resident={}",
                page_index,
                id.bits(),
                group_index,
                actual,
                expected
            ));
        }
    }
    for (entry_index, entry) in resident.chunk.part_entries().iter().enumerate() {
        let expected = resident
            .chunk
            .entry_dependencies(entry)
            .iter()
            .filter(|&&c| !contributes(registry, id, c, page_index, entry_index as u32))
            .count() as u32;
        let actual = resident.state.leaf_counts[entry_index];
        if expected != actual {
            violations.push(format!(
                "page {} of {:#010x}: part entry {} leaf count {} but {} contributors missing",
                page_index,
                id.bits(),
                entry_index,
                actual,
                expected
            ));
        }
    }
}
