//! Authored resource descriptions.
//!
//! A [`Resource`] is the immutable, load-time description of one mesh asset:
//! per-page descriptors, the flat page dependency array, the hierarchy node
//! blob, and the inline payloads of its root pages. Root pages occupy the
//! first `num_root_pages` page indices; everything after them streams on
//! demand from the backing store.

use bytemuck::{Pod, Zeroable};

use crate::error::{StreamingError, StreamingResult};
use crate::gpu::layout::HIERARCHY_NODE_BYTES;

/// Page payload is delta-encoded against its dependencies' content
pub const PAGE_FLAG_RELATIVE_ENCODING: u8 = 1;

/// Immutable per-page descriptor.
///
/// For root pages `bulk_offset`/`bulk_size` index the resource's inline root
/// data; for streaming pages they name a byte range in the backing store.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PageStreamingState {
    pub bulk_offset: u64,
    pub bulk_size: u32,
    /// Start of this page's slice of the resource dependency array
    pub dependencies_start: u32,
    pub dependencies_num: u32,
    pub max_hierarchy_depth: u8,
    pub flags: u8,
    pub _pad: u16,
}

impl PageStreamingState {
    pub fn new(bulk_offset: u64, bulk_size: u32, deps_start: u32, deps_num: u32) -> Self {
        Self {
            bulk_offset,
            bulk_size,
            dependencies_start: deps_start,
            dependencies_num: deps_num,
            max_hierarchy_depth: 0,
            flags: 0,
            _pad: 0,
        }
    }

    pub fn is_relative_encoded(&self) -> bool {
        self.flags & PAGE_FLAG_RELATIVE_ENCODING != 0
    }
}

/// One authored mesh asset, as handed to the cache at load time
#[derive(Debug, Clone)]
pub struct Resource {
    persistent_hash: u64,
    num_root_pages: u32,
    page_states: Vec<PageStreamingState>,
    dependencies: Vec<u32>,
    hierarchy_nodes: Vec<u8>,
    root_data: Vec<u8>,
}

impl Resource {
    /// Validate and take ownership of an authored description.
    ///
    /// Page dependencies must point strictly backwards (a page may only
    /// depend on lower page indices), which keeps the dependency graph
    /// acyclic and lets selection register dependencies before dependents.
    pub fn new(
        persistent_hash: u64,
        num_root_pages: u32,
        page_states: Vec<PageStreamingState>,
        dependencies: Vec<u32>,
        hierarchy_nodes: Vec<u8>,
        root_data: Vec<u8>,
    ) -> StreamingResult<Self> {
        let num_pages = page_states.len() as u32;
        if num_root_pages == 0 || num_root_pages > num_pages {
            return Err(StreamingError::InvalidResource {
                message: format!(
                    "expected at least one root page and at most {} ({} given)",
                    num_pages, num_root_pages
                ),
            });
        }
        if hierarchy_nodes.len() % HIERARCHY_NODE_BYTES as usize != 0 {
            return Err(StreamingError::InvalidResource {
                message: format!(
                    "hierarchy blob of {} bytes is not a whole number of nodes",
                    hierarchy_nodes.len()
                ),
            });
        }
        for (index, state) in page_states.iter().enumerate() {
            let index = index as u32;
            let deps_end = state
                .dependencies_start
                .checked_add(state.dependencies_num)
                .filter(|&end| end as usize <= dependencies.len());
            let Some(deps_end) = deps_end else {
                return Err(StreamingError::InvalidResource {
                    message: format!("page {} dependency range out of bounds", index),
                });
            };
            for &dep in &dependencies[state.dependencies_start as usize..deps_end as usize] {
                if dep >= index {
                    return Err(StreamingError::InvalidResource {
                        message: format!(
                            "page {} depends on page {}; dependencies must point backwards",
                            index, dep
                        ),
                    });
                }
            }
            if index < num_root_pages {
                let in_bounds = state
                    .bulk_offset
                    .checked_add(state.bulk_size as u64)
                    .is_some_and(|end| end as usize <= root_data.len());
                if !in_bounds {
                    return Err(StreamingError::InvalidResource {
                        message: format!("root page {} payload range out of bounds", index),
                    });
                }
            }
        }
        Ok(Self {
            persistent_hash,
            num_root_pages,
            page_states,
            dependencies,
            hierarchy_nodes,
            root_data,
        })
    }

    pub fn persistent_hash(&self) -> u64 {
        self.persistent_hash
    }

    pub fn num_pages(&self) -> u32 {
        self.page_states.len() as u32
    }

    pub fn num_root_pages(&self) -> u32 {
        self.num_root_pages
    }

    pub fn num_streaming_pages(&self) -> u32 {
        self.num_pages() - self.num_root_pages
    }

    pub fn is_root_page(&self, page_index: u32) -> bool {
        page_index < self.num_root_pages
    }

    pub fn page_state(&self, page_index: u32) -> &PageStreamingState {
        &self.page_states[page_index as usize]
    }

    /// Resource-local indices of the pages `page_index` depends on
    pub fn page_dependencies(&self, page_index: u32) -> &[u32] {
        let state = &self.page_states[page_index as usize];
        let start = state.dependencies_start as usize;
        &self.dependencies[start..start + state.dependencies_num as usize]
    }

    /// Inline payload of a root page (fixup chunk followed by GPU data)
    pub fn root_payload(&self, page_index: u32) -> &[u8] {
        debug_assert!(self.is_root_page(page_index));
        let state = &self.page_states[page_index as usize];
        let start = state.bulk_offset as usize;
        &self.root_data[start..start + state.bulk_size as usize]
    }

    pub fn hierarchy_nodes(&self) -> &[u8] {
        &self.hierarchy_nodes
    }

    pub fn hierarchy_node_count(&self) -> u32 {
        (self.hierarchy_nodes.len() / HIERARCHY_NODE_BYTES as usize) as u32
    }
}
