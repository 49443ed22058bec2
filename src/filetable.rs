//! The system-wide open-file table (§4.6): a fixed pool of reference
//! counted open-file entries, handed out as `Fd` indices to processes.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::fs::mount::InodeRef;

bitflags::bitflags! {
    /// Open-mode flags (§6.2).
    pub struct OpenFlags: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CREATE = 0b0100;
        const TRUNC = 0b1000;
        const APPEND = 0b1_0000;
    }
}

#[derive(Clone, Copy)]
pub struct OpenFile {
    pub inode: InodeRef,
    pub offset: u64,
    pub flags: OpenFlags,
    refcount: u32,
}

/// A handle into the system-wide file table, held by a process
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub usize);

pub struct FileTable {
    entries: Mutex<Vec<Option<OpenFile>>>,
}

impl FileTable {
    pub fn new(nfile: usize) -> Self {
        Self {
            entries: Mutex::new(vec![None; nfile]),
        }
    }

    /// Allocates a fresh entry for `inode`, opened with `flags`.
    pub fn alloc(&self, inode: InodeRef, flags: OpenFlags) -> Result<FileHandle> {
        let mut entries = self.entries.lock().unwrap();
        let slot = entries
            .iter()
            .position(|e| e.is_none())
            .ok_or(Error::NoFreeFileTableEntries)?;
        entries[slot] = Some(OpenFile {
            inode,
            offset: 0,
            flags,
            refcount: 1,
        });
        Ok(FileHandle(slot))
    }

    pub fn get(&self, handle: FileHandle) -> Result<OpenFile> {
        self.entries
            .lock()
            .unwrap()
            .get(handle.0)
            .and_then(|e| *e)
            .ok_or(Error::BadFd)
    }

    pub fn set_offset(&self, handle: FileHandle, offset: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(handle.0).and_then(|e| e.as_mut()) {
            Some(f) => {
                f.offset = offset;
                Ok(())
            }
            None => Err(Error::BadFd),
        }
    }

    /// Duplicates a handle, bumping its refcount (used by `dup`, and
    /// implicitly whenever a descriptor is inherited).
    pub fn dup(&self, handle: FileHandle) -> Result<FileHandle> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(handle.0).and_then(|e| e.as_mut()) {
            Some(f) => {
                f.refcount += 1;
                Ok(handle)
            }
            None => Err(Error::BadFd),
        }
    }

    /// Number of open entries still referencing `fs_id`, used by `umount`
    /// to refuse unmounting a busy filesystem.
    pub fn count_fs_refs(&self, fs_id: u32) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Some(f) if f.inode.fs_id == fs_id))
            .count()
    }

    /// Drops a reference; the entry is freed once the last reference is
    /// gone. Returns the inode reference when the entry is actually
    /// closed, so the caller can `iput` it.
    pub fn close(&self, handle: FileHandle) -> Result<Option<InodeRef>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(handle.0).and_then(|e| e.as_mut()).ok_or(Error::BadFd)?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let inode = entry.inode;
            entries[handle.0] = None;
            return Ok(Some(inode));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_keeps_entry_alive_until_last_close() {
        let table = FileTable::new(4);
        let inode = InodeRef { fs_id: 1, inum: 7 };
        let handle = table.alloc(inode, OpenFlags::READ).unwrap();
        table.dup(handle).unwrap();
        assert_eq!(table.close(handle).unwrap(), None);
        assert_eq!(table.close(handle).unwrap(), Some(inode));
    }

    #[test]
    fn exhausting_the_table_errors() {
        let table = FileTable::new(1);
        let inode = InodeRef { fs_id: 1, inum: 1 };
        let _handle = table.alloc(inode, OpenFlags::READ).unwrap();
        assert!(matches!(table.alloc(inode, OpenFlags::READ), Err(Error::NoFreeFileTableEntries)));
    }

    #[test]
    fn count_fs_refs_tracks_open_entries() {
        let table = FileTable::new(4);
        let a = InodeRef { fs_id: 1, inum: 1 };
        let b = InodeRef { fs_id: 2, inum: 1 };
        table.alloc(a, OpenFlags::READ).unwrap();
        table.alloc(b, OpenFlags::READ).unwrap();
        assert_eq!(table.count_fs_refs(1), 1);
        assert_eq!(table.count_fs_refs(2), 1);
        assert_eq!(table.count_fs_refs(3), 0);
    }
}
