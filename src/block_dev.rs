//! The block-device contract (§6.4): `strategy` reads or writes one
//! fixed-size block; `buffer_synced` completes it.
//!
//! The reference design is interrupt-driven and genuinely asynchronous: a
//! driver queues the request and some other context later calls
//! `buffer_synced`. A hosted re-implementation has no interrupt controller
//! to hook, so the provided [`BlockDevice`] impls complete `strategy`
//! before returning and invoke the completion callback themselves. The
//! trait boundary is kept async-shaped (`strategy` takes the callback
//! rather than returning a result directly) so a real backend — a thread
//! pool, io_uring, a network block service — can complete it later from a
//! different thread without changing any caller above `bcache`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::param::BLOCKSIZE;

/// One logical device: `{major, minor}`. Major selects a driver from an
/// external device table; minor selects an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LDev {
    pub major: u16,
    pub minor: u16,
}

impl LDev {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Outcome of one `strategy` call, delivered to `buffer_synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Ok,
    Err,
}

/// A block-device driver. A `valid` buffer handed to `strategy` is a
/// write; an invalid one is a read (per §6.4).
pub trait BlockDevice: Send + Sync {
    /// Read or write the block at `blockno` into/from `data`, depending on
    /// `is_write`. Must call `on_complete` exactly once.
    fn strategy(
        &self,
        blockno: u32,
        data: &mut [u8; BLOCKSIZE],
        is_write: bool,
        on_complete: &mut dyn FnMut(IoOutcome),
    );
}

/// An in-memory block device, useful for tests and for `mkfs`'s dry runs.
pub struct MemBlockDevice {
    blocks: Mutex<Vec<[u8; BLOCKSIZE]>>,
}

impl MemBlockDevice {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0u8; BLOCKSIZE]; nblocks as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn strategy(
        &self,
        blockno: u32,
        data: &mut [u8; BLOCKSIZE],
        is_write: bool,
        on_complete: &mut dyn FnMut(IoOutcome),
    ) {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.get_mut(blockno as usize) {
            None => on_complete(IoOutcome::Err),
            Some(slot) => {
                if is_write {
                    slot.copy_from_slice(data);
                } else {
                    data.copy_from_slice(slot);
                }
                on_complete(IoOutcome::Ok);
            }
        }
    }
}

/// A block device backed by a plain file on the host filesystem, used by
/// `mkfs` and `fsck` to operate on a real disk image.
pub struct FileBlockDevice {
    file: Mutex<File>,
    nblocks: u32,
}

impl FileBlockDevice {
    pub fn open(path: &Path, nblocks: u32) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }

    pub fn create(path: &Path, nblocks: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks as u64 * BLOCKSIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn strategy(
        &self,
        blockno: u32,
        data: &mut [u8; BLOCKSIZE],
        is_write: bool,
        on_complete: &mut dyn FnMut(IoOutcome),
    ) {
        if blockno >= self.nblocks {
            on_complete(IoOutcome::Err);
            return;
        }
        let mut file = self.file.lock().unwrap();
        let offset = blockno as u64 * BLOCKSIZE as u64;
        let result = (|| -> io::Result<()> {
            file.seek(SeekFrom::Start(offset))?;
            if is_write {
                file.write_all(data)?;
            } else {
                file.read_exact(data)?;
            }
            Ok(())
        })();
        on_complete(match result {
            Ok(()) => IoOutcome::Ok,
            Err(_) => IoOutcome::Err,
        });
    }
}
