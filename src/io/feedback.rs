//! GPU feedback channel: page requests written by rendering, read back and
//! validated by the cache.
//!
//! The GPU fills a fixed-layout array of request records. Because the copy
//! back to the CPU is not synchronized with the writer, a record can be torn
//! or left over from an earlier frame; every field therefore carries the
//! frame's magic nibble in its low bits and a record is discarded unless all
//! three nibbles match the frame being consumed.

use bytemuck::{Pod, Zeroable};

use crate::registry::handle::RuntimeResourceId;

const MAGIC_BITS: u32 = 4;
const MAGIC_MASK: u32 = (1 << MAGIC_BITS) - 1;

const PAGE_START_BITS: u32 = 16;
const NUM_PAGES_BITS: u32 = 12;
const NUM_PAGES_MASK: u32 = (1 << NUM_PAGES_BITS) - 1;

/// Largest page start index a feedback record can carry
pub const MAX_FEEDBACK_PAGE_START: u32 = (1 << PAGE_START_BITS) - 1;

/// Largest page count a feedback record can carry
pub const MAX_FEEDBACK_NUM_PAGES: u32 = NUM_PAGES_MASK;

/// Priorities are truncated to this many bits on the wire
pub const FEEDBACK_PRIORITY_BITS: u32 = 28;

/// Wire format of one GPU page request
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuPageRequest {
    pub resource_id_magic: u32,
    pub page_range_magic: u32,
    pub priority_magic: u32,
}

/// One validated, decoded page-range request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub resource: RuntimeResourceId,
    pub page_start: u32,
    pub num_pages: u32,
    pub priority: u32,
}

impl GpuPageRequest {
    pub fn encode(
        resource: RuntimeResourceId,
        page_start: u32,
        num_pages: u32,
        priority: u32,
        magic: u8,
    ) -> Self {
        debug_assert!(page_start <= MAX_FEEDBACK_PAGE_START);
        debug_assert!(num_pages >= 1 && num_pages <= MAX_FEEDBACK_NUM_PAGES);
        let magic = magic as u32 & MAGIC_MASK;
        let page_range = (page_start << NUM_PAGES_BITS) | num_pages;
        let priority = priority & ((1 << FEEDBACK_PRIORITY_BITS) - 1);
        Self {
            resource_id_magic: (resource.bits() << MAGIC_BITS) | magic,
            page_range_magic: (page_range << MAGIC_BITS) | magic,
            priority_magic: (priority << MAGIC_BITS) | magic,
        }
    }

    /// Decode if every field carries `expected_magic`; `None` for torn or
    /// stale records
    pub fn decode(&self, expected_magic: u8) -> Option<PageRequest> {
        let expected = expected_magic as u32 & MAGIC_MASK;
        let tags = [
            self.resource_id_magic & MAGIC_MASK,
            self.page_range_magic & MAGIC_MASK,
            self.priority_magic & MAGIC_MASK,
        ];
        if tags != [expected; 3] {
            return None;
        }
        let resource = RuntimeResourceId::from_bits(self.resource_id_magic >> MAGIC_BITS)?;
        let page_range = self.page_range_magic >> MAGIC_BITS;
        let num_pages = page_range & NUM_PAGES_MASK;
        if num_pages == 0 {
            return None;
        }
        Some(PageRequest {
            resource,
            page_start: page_range >> NUM_PAGES_BITS,
            num_pages,
            priority: self.priority_magic >> MAGIC_BITS,
        })
    }
}

/// Validate and decode a raw record batch, dropping torn and stale entries
pub fn decode_requests(records: &[GpuPageRequest], expected_magic: u8) -> Vec<PageRequest> {
    let decoded: Vec<PageRequest> = records
        .iter()
        .filter_map(|r| r.decode(expected_magic))
        .collect();
    if decoded.len() != records.len() {
        log::debug!(
            "[Feedback] dropped {} stale or torn records of {}",
            records.len() - decoded.len(),
            records.len()
        );
    }
    decoded
}

/// Source of validated GPU page requests, polled once per update cycle
pub trait FeedbackProvider: Send {
    /// Latest completed batch; drains the provider
    fn take_requests(&mut self) -> Vec<PageRequest>;
}

/// Feedback source for callers that only use explicit requests
pub struct NullFeedback;

impl FeedbackProvider for NullFeedback {
    fn take_requests(&mut self) -> Vec<PageRequest> {
        Vec::new()
    }
}

/// Test-side feedback provider fed with pre-encoded batches.
///
/// Clones share the queue, so a test can keep one clone for pushing while
/// the cache drains the other.
#[derive(Clone, Default)]
pub struct QueuedFeedback {
    queue: std::sync::Arc<parking_lot::Mutex<std::collections::VecDeque<Vec<PageRequest>>>>,
}

impl QueuedFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw record batch as a frame tagged `magic`
    pub fn push_encoded(&self, records: Vec<GpuPageRequest>, magic: u8) {
        self.queue.lock().push_back(decode_requests(&records, magic));
    }

    /// Queue already-decoded requests
    pub fn push_requests(&self, requests: Vec<PageRequest>) {
        self.queue.lock().push_back(requests);
    }
}

impl FeedbackProvider for QueuedFeedback {
    fn take_requests(&mut self) -> Vec<PageRequest> {
        self.queue.lock().pop_front().unwrap_or_default()
    }
}
