//! File-backed block loader.
//!
//! Reads are serviced by one worker thread that copies ranges out of a
//! memory-mapped view of the backing file and posts completions into a
//! shared map the cache polls. Dropping the loader shuts the worker down.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use memmap2::Mmap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{StreamingError, StreamingResult};
use crate::io::loader::{BlockLoader, ReadHandle};

struct ReadJob {
    handle: u64,
    offset: u64,
    size: u32,
}

struct CompletedRead {
    ok: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct FileLoaderShared {
    completed: FxHashMap<u64, CompletedRead>,
    /// Handles released before their read finished; results are discarded
    released: FxHashSet<u64>,
}

/// Block loader over one backing file
pub struct FileBlockLoader {
    jobs: Option<Sender<ReadJob>>,
    shared: Arc<Mutex<FileLoaderShared>>,
    next_handle: u64,
    worker: Option<thread::JoinHandle<()>>,
}

impl FileBlockLoader {
    pub fn new(path: &Path) -> StreamingResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| StreamingError::Io {
            message: format!("opening {}: {}", path.display(), e),
        })?;
        let len = file
            .metadata()
            .map_err(|e| StreamingError::Io {
                message: format!("stat {}: {}", path.display(), e),
            })?
            .len();

        // SAFETY: the file is opened read-only and the mapping is only read
        // by the worker thread; concurrent truncation of the backing file is
        // outside this loader's contract.
        let mmap = if len > 0 {
            Some(unsafe {
                Mmap::map(&file).map_err(|e| StreamingError::Io {
                    message: format!("mapping {}: {}", path.display(), e),
                })?
            })
        } else {
            None
        };

        let (tx, rx) = crossbeam_channel::unbounded::<ReadJob>();
        let shared = Arc::new(Mutex::new(FileLoaderShared::default()));
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("vgstream-file-loader".to_string())
            .spawn(move || Self::worker_loop(rx, mmap, worker_shared))
            .map_err(|e| StreamingError::Io {
                message: format!("spawning loader thread: {}", e),
            })?;

        log::info!(
            "[FileBlockLoader] serving {} ({} bytes)",
            path.display(),
            len
        );
        Ok(Self {
            jobs: Some(tx),
            shared,
            next_handle: 1,
            worker: Some(worker),
        })
    }

    fn worker_loop(rx: Receiver<ReadJob>, mmap: Option<Mmap>, shared: Arc<Mutex<FileLoaderShared>>) {
        for job in rx.iter() {
            let range_end = job.offset + job.size as u64;
            let result = match &mmap {
                Some(map) if range_end <= map.len() as u64 => CompletedRead {
                    ok: true,
                    data: map[job.offset as usize..range_end as usize].to_vec(),
                },
                _ => {
                    log::warn!(
                        "[FileBlockLoader] read [{}, {}) past end of file",
                        job.offset,
                        range_end
                    );
                    CompletedRead {
                        ok: false,
                        data: Vec::new(),
                    }
                }
            };
            let mut shared = shared.lock();
            if !shared.released.remove(&job.handle) {
                shared.completed.insert(job.handle, result);
            }
        }
    }
}

impl BlockLoader for FileBlockLoader {
    fn issue_read(&mut self, offset: u64, size: u32) -> ReadHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        if let Some(jobs) = &self.jobs {
            // A send failure means the worker died; the read then never
            // completes and the cache's retry policy takes over.
            if jobs
                .send(ReadJob {
                    handle,
                    offset,
                    size,
                })
                .is_err()
            {
                log::error!("[FileBlockLoader] worker gone, failing read {}", handle);
                self.shared.lock().completed.insert(
                    handle,
                    CompletedRead {
                        ok: false,
                        data: Vec::new(),
                    },
                );
            }
        }
        ReadHandle(handle)
    }

    fn is_complete(&self, handle: ReadHandle) -> bool {
        self.shared.lock().completed.contains_key(&handle.0)
    }

    fn is_ok(&self, handle: ReadHandle) -> bool {
        self.shared
            .lock()
            .completed
            .get(&handle.0)
            .map(|r| r.ok)
            .unwrap_or(false)
    }

    fn copy_result(&self, handle: ReadHandle, dst: &mut [u8]) {
        let shared = self.shared.lock();
        let read = &shared.completed[&handle.0];
        assert!(read.ok, "copy_result on a failed read");
        assert_eq!(dst.len(), read.data.len());
        dst.copy_from_slice(&read.data);
    }

    fn release(&mut self, handle: ReadHandle) {
        let mut shared = self.shared.lock();
        if shared.completed.remove(&handle.0).is_none() {
            shared.released.insert(handle.0);
        }
    }
}

impl Drop for FileBlockLoader {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
