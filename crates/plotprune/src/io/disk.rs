//! File-backed I/O queue with a dedicated command thread.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::fence::Fence;
use crate::io::{FileKind, FileSetOptions, IoBuf, IoBytes, IoQueue, SeekOrigin};

enum Command {
    Register { file: FileKind, handle: File },
    Seek { file: FileKind, origin: SeekOrigin, offset: i64 },
    Read { file: FileKind, dst: IoBuf },
    Write { file: FileKind, src: IoBytes },
    SignalFence { fence: Arc<Fence>, value: u64 },
}

/// An [`IoQueue`] executing commands against real files in a work directory.
///
/// One background thread drains batches of committed commands in order. An
/// I/O failure on that thread aborts the process: the run has no
/// partial-bitmap recovery path, and carrying the error back through every
/// queued consumer would only delay the same outcome.
pub struct DiskIoQueue {
    root: PathBuf,
    pending: Mutex<Vec<Command>>,
    tx: Sender<Vec<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskIoQueue {
    /// Creates the work directory (if needed) and starts the I/O thread.
    ///
    /// # Errors
    ///
    /// Any error creating the work directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let (tx, rx) = channel::unbounded::<Vec<Command>>();
        let worker = std::thread::Builder::new()
            .name("plotprune-io".into())
            .spawn(move || {
                let mut files: HashMap<FileKind, FileSlot> = HashMap::new();
                for batch in &rx {
                    for command in batch {
                        execute(&mut files, command);
                    }
                }
            })?;
        Ok(Self {
            root,
            pending: Mutex::new(Vec::new()),
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Path of the backing file registered under `name`.
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tmp"))
    }

    /// The work directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn push(&self, command: Command) {
        self.pending.lock().push(command);
    }
}

struct FileSlot {
    handle: File,
    cursor: u64,
}

fn execute(files: &mut HashMap<FileKind, FileSlot>, command: Command) {
    match command {
        Command::Register { file, handle } => {
            files.insert(file, FileSlot { handle, cursor: 0 });
        }
        Command::Seek { file, origin, offset } => {
            let slot = slot(files, file);
            slot.cursor = match origin {
                #[allow(clippy::cast_sign_loss)]
                SeekOrigin::Begin => offset as u64,
                SeekOrigin::Current => slot.cursor.checked_add_signed(offset).unwrap_or(0),
            };
        }
        Command::Read { file, mut dst } => {
            let slot = slot(files, file);
            let len = dst.len() as u64;
            if let Err(err) = slot
                .handle
                .seek(SeekFrom::Start(slot.cursor))
                // SAFETY: the producer guaranteed exclusive access to the
                // region until the trailing fence fires.
                .and_then(|_| slot.handle.read_exact(unsafe { dst.as_mut_slice() }))
            {
                // A panic would only kill this thread and leave every fence
                // waiter blocked; the run has no recovery path, so go down now.
                error!(file = ?file, cursor = slot.cursor, len, %err, "read failed, aborting run");
                std::process::abort();
            }
            slot.cursor += len;
        }
        Command::Write { file, src } => {
            let slot = slot(files, file);
            let len = src.len() as u64;
            if let Err(err) = slot
                .handle
                .seek(SeekFrom::Start(slot.cursor))
                // SAFETY: producer keeps the source immutable until the fence.
                .and_then(|_| slot.handle.write_all(unsafe { src.as_slice() }))
            {
                error!(file = ?file, cursor = slot.cursor, len, %err, "write failed, aborting run");
                std::process::abort();
            }
            slot.cursor += len;
        }
        Command::SignalFence { fence, value } => fence.signal(value),
    }
}

fn slot(files: &mut HashMap<FileKind, FileSlot>, file: FileKind) -> &mut FileSlot {
    files
        .get_mut(&file)
        .unwrap_or_else(|| panic!("file {file:?} used before init_file_set"))
}

impl IoQueue for DiskIoQueue {
    fn init_file_set(
        &self,
        file: FileKind,
        name: &str,
        file_count: u32,
        options: FileSetOptions,
    ) -> Result<()> {
        assert_eq!(file_count, 1, "this stage only uses single-file sets");
        let path = self.file_path(name);
        // No truncation: table and map files carry data from the previous
        // stage; marks files are overwritten in place from offset 0.
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        debug!(file = ?file, path = %path.display(), direct_io = options.direct_io, "file set registered");
        self.push(Command::Register { file, handle });
        Ok(())
    }

    fn seek(&self, file: FileKind, origin: SeekOrigin, offset: i64) {
        self.push(Command::Seek { file, origin, offset });
    }

    unsafe fn read_file(&self, file: FileKind, dst: IoBuf) {
        self.push(Command::Read { file, dst });
    }

    unsafe fn write_file(&self, file: FileKind, src: IoBytes) {
        self.push(Command::Write { file, src });
    }

    fn signal_fence(&self, fence: Arc<Fence>, value: u64) {
        self.push(Command::SignalFence { fence, value });
    }

    fn commit_commands(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        assert!(
            self.tx.send(batch).is_ok(),
            "I/O thread terminated with commands outstanding"
        );
    }
}

impl Drop for DiskIoQueue {
    fn drop(&mut self) {
        self.commit_commands();
        // Closing the channel ends the worker loop after the last batch.
        let (closed, _rx) = channel::bounded(0);
        drop(std::mem::replace(&mut self.tx, closed));
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableId;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskIoQueue::new(dir.path()).unwrap();
        let kind = FileKind::Marks(TableId::Table2);
        queue
            .init_file_set(kind, &kind.name(), 1, FileSetOptions::default())
            .unwrap();

        let payload = vec![0xA5u8; 1024];
        let fence = Arc::new(Fence::new());
        unsafe {
            queue.write_file(kind, IoBytes::from_raw(payload.as_ptr(), payload.len()));
        }
        queue.seek(kind, SeekOrigin::Begin, 0);
        let mut readback = vec![0u8; 1024];
        unsafe {
            queue.read_file(kind, IoBuf::from_raw(readback.as_mut_ptr(), readback.len()));
        }
        queue.signal_fence(Arc::clone(&fence), 1);
        queue.commit_commands();
        fence.wait(1);

        assert_eq!(readback, payload);
    }

    #[test]
    fn test_seek_current() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskIoQueue::new(dir.path()).unwrap();
        let kind = FileKind::TablePairs(TableId::Table3);
        queue
            .init_file_set(kind, &kind.name(), 1, FileSetOptions::default())
            .unwrap();

        let payload: Vec<u8> = (0..64).collect();
        let fence = Arc::new(Fence::new());
        unsafe {
            queue.write_file(kind, IoBytes::from_raw(payload.as_ptr(), payload.len()));
        }
        queue.seek(kind, SeekOrigin::Begin, 16);
        queue.seek(kind, SeekOrigin::Current, 16);
        let mut readback = vec![0u8; 8];
        unsafe {
            queue.read_file(kind, IoBuf::from_raw(readback.as_mut_ptr(), readback.len()));
        }
        queue.signal_fence(Arc::clone(&fence), 1);
        queue.commit_commands();
        fence.wait(1);

        assert_eq!(readback, (32..40).collect::<Vec<u8>>());
    }

    #[test]
    fn test_failed_read_terminates_run() {
        // Re-runs this test in a child process. The child queues a read past
        // the end of an empty file and must die promptly; merely killing the
        // I/O thread would leave the fence waiter blocked forever.
        if std::env::var_os("PLOTPRUNE_IO_FAILURE_CHILD").is_some() {
            std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_secs(10));
                // Still alive: the failure did not terminate the process.
                std::process::exit(0);
            });

            let dir = tempfile::tempdir().unwrap();
            let queue = DiskIoQueue::new(dir.path()).unwrap();
            let kind = FileKind::TablePairs(TableId::Table7);
            queue
                .init_file_set(kind, &kind.name(), 1, FileSetOptions::default())
                .unwrap();

            let fence = Arc::new(Fence::new());
            let mut dst = vec![0u8; 64];
            unsafe {
                queue.read_file(kind, IoBuf::from_raw(dst.as_mut_ptr(), dst.len()));
            }
            queue.signal_fence(Arc::clone(&fence), 1);
            queue.commit_commands();
            fence.wait(1);
            unreachable!("short read must abort before the fence is reached");
        }

        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .arg("io::disk::tests::test_failed_read_terminates_run")
            .arg("--exact")
            .arg("--nocapture")
            .env("PLOTPRUNE_IO_FAILURE_CHILD", "1")
            .status()
            .unwrap();
        assert!(!status.success(), "child must die on the failed read");
    }
}
