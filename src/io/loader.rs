//! Block-storage backend boundary.
//!
//! The cache issues byte-range reads and polls for completion; it never
//! blocks on a read and owns all retry policy itself. `MemoryBlockLoader`
//! backs the test suite with a controllable in-memory store.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Opaque ticket for one issued read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadHandle(pub u64);

/// Asynchronous byte-range reads from the backing store.
///
/// Completion is polled, never awaited. A completed read stays available
/// until `release`; `copy_result` may only be called once `is_complete` and
/// `is_ok` both hold.
pub trait BlockLoader: Send {
    fn issue_read(&mut self, offset: u64, size: u32) -> ReadHandle;
    fn is_complete(&self, handle: ReadHandle) -> bool;
    fn is_ok(&self, handle: ReadHandle) -> bool;
    fn copy_result(&self, handle: ReadHandle, dst: &mut [u8]);
    fn release(&mut self, handle: ReadHandle);
}

#[derive(Debug)]
struct ReadState {
    offset: u64,
    size: u32,
    /// Completion surfaces after this many `is_complete` polls
    polls_left: u32,
    ok: bool,
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    start: u64,
    end: u64,
    remaining: u32,
}

struct LoaderInner {
    store: Vec<u8>,
    latency_polls: u32,
    next_handle: u64,
    reads: FxHashMap<u64, ReadState>,
    injected: Vec<FailureWindow>,
    issued: u64,
    failed: u64,
}

/// In-memory backing store with injectable failures and completion latency.
///
/// Clones share state, so a test can keep one clone for control while the
/// cache owns the other.
#[derive(Clone)]
pub struct MemoryBlockLoader {
    inner: Arc<Mutex<LoaderInner>>,
}

impl MemoryBlockLoader {
    pub fn new(store: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoaderInner {
                store,
                latency_polls: 0,
                next_handle: 1,
                reads: FxHashMap::default(),
                injected: Vec::new(),
                issued: 0,
                failed: 0,
            })),
        }
    }

    /// Delay every completion by `polls` `is_complete` checks
    pub fn set_latency(&self, polls: u32) {
        self.inner.lock().latency_polls = polls;
    }

    /// Fail the next `count` reads that touch `[start, end)`
    pub fn inject_failures(&self, start: u64, end: u64, count: u32) {
        self.inner.lock().injected.push(FailureWindow {
            start,
            end,
            remaining: count,
        });
    }

    /// Append bytes to the backing store, returning their start offset
    pub fn append(&self, bytes: &[u8]) -> u64 {
        let mut inner = self.inner.lock();
        let offset = inner.store.len() as u64;
        inner.store.extend_from_slice(bytes);
        offset
    }

    pub fn issued_reads(&self) -> u64 {
        self.inner.lock().issued
    }

    pub fn failed_reads(&self) -> u64 {
        self.inner.lock().failed
    }

    pub fn live_reads(&self) -> usize {
        self.inner.lock().reads.len()
    }
}

impl BlockLoader for MemoryBlockLoader {
    fn issue_read(&mut self, offset: u64, size: u32) -> ReadHandle {
        let mut inner = self.inner.lock();
        inner.issued += 1;

        let mut ok = offset + size as u64 <= inner.store.len() as u64;
        if ok {
            for window in inner.injected.iter_mut() {
                let overlaps = offset < window.end && offset + size as u64 > window.start;
                if overlaps && window.remaining > 0 {
                    window.remaining -= 1;
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            inner.failed += 1;
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let polls_left = inner.latency_polls;
        inner.reads.insert(
            handle,
            ReadState {
                offset,
                size,
                polls_left,
                ok,
            },
        );
        ReadHandle(handle)
    }

    fn is_complete(&self, handle: ReadHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.reads.get_mut(&handle.0) {
            Some(read) if read.polls_left > 0 => {
                read.polls_left -= 1;
                false
            }
            Some(_) => true,
            None => {
                debug_assert!(false, "poll of unknown read handle {:?}", handle);
                true
            }
        }
    }

    fn is_ok(&self, handle: ReadHandle) -> bool {
        self.inner
            .lock()
            .reads
            .get(&handle.0)
            .map(|r| r.ok)
            .unwrap_or(false)
    }

    fn copy_result(&self, handle: ReadHandle, dst: &mut [u8]) {
        let inner = self.inner.lock();
        let read = &inner.reads[&handle.0];
        assert!(read.ok, "copy_result on a failed read");
        assert_eq!(dst.len(), read.size as usize);
        let start = read.offset as usize;
        dst.copy_from_slice(&inner.store[start..start + read.size as usize]);
    }

    fn release(&mut self, handle: ReadHandle) {
        self.inner.lock().reads.remove(&handle.0);
    }
}
