use super::error::StorageError;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

enum Command {
    Open {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Close,
    Read {
        offset: u64,
        length: u32,
        reply: oneshot::Sender<Result<Bytes, StorageError>>,
    },
    Write {
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Allocate {
        size: u64,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Mailbox handle for one file's worker task.
#[derive(Clone)]
pub struct WorkerHandle {
    file_index: usize,
    tx: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    pub async fn open(&self) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open { reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone(self.file_index))?
    }

    /// Asks the worker to release its handle. Fire-and-forget: the close
    /// happens after any commands already queued.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    pub async fn read(&self, offset: u64, length: u32) -> Result<Bytes, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read {
            offset,
            length,
            reply,
        })?;
        rx.await.map_err(|_| StorageError::WorkerGone(self.file_index))?
    }

    pub async fn write(&self, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            offset,
            data,
            reply,
        })?;
        rx.await.map_err(|_| StorageError::WorkerGone(self.file_index))?
    }

    /// Extends the file to `size` bytes, zero-filled.
    pub async fn allocate(&self, size: u64) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Allocate { size, reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone(self.file_index))?
    }

    fn send(&self, cmd: Command) -> Result<(), StorageError> {
        self.tx
            .send(cmd)
            .map_err(|_| StorageError::WorkerGone(self.file_index))
    }
}

/// Actor owning at most one OS handle for a single file.
///
/// Commands are processed in arrival order; reads and writes open the file
/// lazily if a prior `Close` released the handle. Writes go to the OS
/// synchronously; durability beyond that is not promised.
pub struct FileWorker {
    file_index: usize,
    path: PathBuf,
    handle: Option<File>,
}

impl FileWorker {
    /// Spawns the worker task and returns its mailbox handle.
    pub fn spawn(file_index: usize, path: PathBuf) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            file_index,
            path,
            handle: None,
        };
        tokio::spawn(worker.run(rx));
        WorkerHandle { file_index, tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Open { reply } => {
                    let _ = reply.send(self.ensure_open().await.map(|_| ()));
                }
                Command::Close => {
                    if let Some(file) = self.handle.take() {
                        let _ = file.sync_data().await;
                        tracing::trace!(file = self.file_index, "closed handle");
                    }
                }
                Command::Read {
                    offset,
                    length,
                    reply,
                } => {
                    let _ = reply.send(self.read(offset, length).await);
                }
                Command::Write {
                    offset,
                    data,
                    reply,
                } => {
                    let _ = reply.send(self.write(offset, data).await);
                }
                Command::Allocate { size, reply } => {
                    let _ = reply.send(self.allocate(size).await);
                }
            }
        }
        if let Some(file) = self.handle.take() {
            let _ = file.sync_data().await;
        }
    }

    async fn ensure_open(&mut self) -> Result<&mut File, StorageError> {
        if self.handle.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .await?;
            self.handle = Some(file);
        }
        Ok(self.handle.as_mut().unwrap())
    }

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, StorageError> {
        let file = self.ensure_open().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let file = self.ensure_open().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn allocate(&mut self, size: u64) -> Result<(), StorageError> {
        let file = self.ensure_open().await?;
        file.set_len(size).await?;
        Ok(())
    }
}
