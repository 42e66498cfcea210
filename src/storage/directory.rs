use super::error::StorageError;
use super::layout::Layout;
use super::worker::{FileWorker, WorkerHandle};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Owns the per-file workers and bounds their open handles.
///
/// Handles are the scarce resource: `schedule_io` keeps an LRU of files
/// believed open and asks the least-recently-used worker to close when a
/// new open would exceed the capacity. The close command is asynchronous,
/// so more than `capacity` handles can exist transiently; steady-state
/// usage converges back under the bound.
pub struct FileDirectory {
    workers: Vec<WorkerHandle>,
    lru: Mutex<VecDeque<usize>>,
    capacity: usize,
}

impl FileDirectory {
    /// Spawns one worker per file under `root`.
    ///
    /// Single-file torrents live at `<root>/<name>`; multi-file torrents
    /// under `<root>/<name>/<relative path>`.
    pub fn new(root: &Path, name: &str, layout: &Layout, capacity: usize) -> Self {
        let single = layout.files().len() == 1;
        let workers = layout
            .files()
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let path: PathBuf = if single {
                    root.join(name)
                } else {
                    root.join(name).join(&f.path)
                };
                FileWorker::spawn(i, path)
            })
            .collect();
        Self {
            workers,
            lru: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Ensures `file`'s worker has its handle open, evicting the
    /// least-recently-used other file if the bound would be exceeded.
    pub async fn schedule_io(&self, file: usize) -> Result<(), StorageError> {
        let victim = {
            let mut lru = self.lru.lock();
            if let Some(pos) = lru.iter().position(|&f| f == file) {
                lru.remove(pos);
                lru.push_back(file);
                None
            } else {
                lru.push_back(file);
                if lru.len() > self.capacity {
                    lru.pop_front()
                } else {
                    None
                }
            }
        };

        if let Some(victim) = victim {
            tracing::trace!(file = victim, "evicting least-recently-used handle");
            self.workers[victim].close();
        }

        self.workers[file].open().await
    }

    pub async fn read(&self, file: usize, offset: u64, length: u32) -> Result<Bytes, StorageError> {
        self.schedule_io(file).await?;
        self.workers[file].read(offset, length).await
    }

    pub async fn write(&self, file: usize, offset: u64, data: Bytes) -> Result<(), StorageError> {
        self.schedule_io(file).await?;
        self.workers[file].write(offset, data).await
    }

    pub async fn allocate(&self, file: usize, size: u64) -> Result<(), StorageError> {
        self.schedule_io(file).await?;
        self.workers[file].allocate(size).await
    }

    /// Pre-allocates every file to its expected size, zero-filled.
    pub async fn preallocate_all(&self, layout: &Layout) -> Result<(), StorageError> {
        for (i, f) in layout.files().iter().enumerate() {
            self.allocate(i, f.length).await?;
        }
        Ok(())
    }

    /// Number of handles the LRU currently believes open.
    pub fn open_count(&self) -> usize {
        self.lru.lock().len()
    }

    /// Files the LRU currently believes open, least recently used first.
    pub fn open_files(&self) -> Vec<usize> {
        self.lru.lock().iter().copied().collect()
    }
}
