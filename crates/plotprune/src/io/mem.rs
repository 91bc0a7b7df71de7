//! In-memory I/O queue for tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::fence::Fence;
use crate::io::{FileKind, FileSetOptions, IoBuf, IoBytes, IoQueue, SeekOrigin};

enum Command {
    Seek { file: FileKind, origin: SeekOrigin, offset: i64 },
    Read { file: FileKind, dst: IoBuf },
    Write { file: FileKind, src: IoBytes },
    SignalFence { fence: Arc<Fence>, value: u64 },
}

#[derive(Default)]
struct MemFile {
    data: Vec<u8>,
    cursor: usize,
}

/// An [`IoQueue`] over in-memory byte vectors.
///
/// Commands still stage until [`commit_commands`](IoQueue::commit_commands),
/// which then executes the whole batch synchronously — the same ordering
/// guarantees as the disk queue, without the background thread. Tests preload
/// table files with [`preload`](Self::preload) and inspect outputs with
/// [`contents`](Self::contents).
#[derive(Default)]
pub struct MemIoQueue {
    files: Mutex<HashMap<FileKind, MemFile>>,
    pending: Mutex<Vec<Command>>,
}

impl MemIoQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `file` with `data`, registering it if needed.
    pub fn preload(&self, file: FileKind, data: Vec<u8>) {
        self.files
            .lock()
            .insert(file, MemFile { data, cursor: 0 });
    }

    /// Current contents of `file`, if registered.
    #[must_use]
    pub fn contents(&self, file: FileKind) -> Option<Vec<u8>> {
        self.files.lock().get(&file).map(|f| f.data.clone())
    }

    fn push(&self, command: Command) {
        self.pending.lock().push(command);
    }
}

impl IoQueue for MemIoQueue {
    fn init_file_set(
        &self,
        file: FileKind,
        _name: &str,
        file_count: u32,
        _options: FileSetOptions,
    ) -> Result<()> {
        assert_eq!(file_count, 1, "this stage only uses single-file sets");
        self.files.lock().entry(file).or_default();
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
        let mut files = self.files.lock();
        for command in batch {
            match command {
                Command::Seek { file, origin, offset } => {
                    let slot = files.get_mut(&file).expect("file not registered");
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                    let base = match origin {
                        SeekOrigin::Begin => 0i64,
                        SeekOrigin::Current => slot.cursor as i64,
                    };
                    #[allow(clippy::cast_sign_loss)]
                    {
                        slot.cursor = (base + offset).max(0) as usize;
                    }
                }
                Command::Read { file, mut dst } => {
                    let slot = files.get_mut(&file).expect("file not registered");
                    let end = slot.cursor + dst.len();
                    assert!(end <= slot.data.len(), "read past end of {file:?}");
                    // SAFETY: producer guarantees exclusive access until the
                    // trailing fence fires; commit executes before any signal.
                    unsafe { dst.as_mut_slice() }.copy_from_slice(&slot.data[slot.cursor..end]);
                    slot.cursor = end;
                }
                Command::Write { file, src } => {
                    let slot = files.get_mut(&file).expect("file not registered");
                    let end = slot.cursor + src.len();
                    if slot.data.len() < end {
                        slot.data.resize(end, 0);
                    }
                    // SAFETY: producer keeps the source immutable until the fence.
                    slot.data[slot.cursor..end].copy_from_slice(unsafe { src.as_slice() });
                    slot.cursor = end;
                }
                Command::SignalFence { fence, value } => fence.signal(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableId;

    #[test]
    fn test_commands_stage_until_commit() {
        let queue = MemIoQueue::new();
        let kind = FileKind::Marks(TableId::Table4);
        queue
            .init_file_set(kind, &kind.name(), 1, FileSetOptions::default())
            .unwrap();

        let payload = [1u8, 2, 3, 4];
        let fence = Arc::new(Fence::new());
        unsafe {
            queue.write_file(kind, IoBytes::from_raw(payload.as_ptr(), payload.len()));
        }
        queue.signal_fence(Arc::clone(&fence), 1);

        assert_eq!(queue.contents(kind).unwrap(), Vec::<u8>::new());
        assert_eq!(fence.value(), 0);

        queue.commit_commands();
        assert_eq!(queue.contents(kind).unwrap(), payload.to_vec());
        assert_eq!(fence.value(), 1);
    }

    #[test]
    fn test_preload_and_read() {
        let queue = MemIoQueue::new();
        let kind = FileKind::TableMap(TableId::Table5);
        queue.preload(kind, (0..32).collect());

        queue.seek(kind, SeekOrigin::Begin, 8);
        let mut dst = vec![0u8; 4];
        unsafe {
            queue.read_file(kind, IoBuf::from_raw(dst.as_mut_ptr(), dst.len()));
        }
        queue.commit_commands();
        assert_eq!(dst, vec![8, 9, 10, 11]);
    }
}
