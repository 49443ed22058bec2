//! The mount table (§4.8, Design Notes §9): a separate structure mapping
//! a covered inode to the filesystem mounted on it, and back. Kept out of
//! the inode struct itself so an inode's representation doesn't carry a
//! mutable pointer whose validity depends on global mount state.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Identifies an inode uniquely across all mounted filesystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef {
    pub fs_id: u32,
    pub inum: u32,
}

#[derive(Default)]
struct MountTableState {
    /// Covered inode -> filesystem mounted there.
    covers: HashMap<InodeRef, u32>,
    /// Filesystem id -> inode it covers in its parent (the inode
    /// `namei` must substitute back in when crossing `..` out of the
    /// mount's root).
    covered_by: HashMap<u32, InodeRef>,
}

#[derive(Default)]
pub struct MountTable {
    state: Mutex<MountTableState>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `fs_id` is now mounted on `covered`.
    pub fn mount(&self, covered: InodeRef, fs_id: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.covers.contains_key(&covered) {
            return Err(Error::AlreadyMounted);
        }
        state.covers.insert(covered, fs_id);
        state.covered_by.insert(fs_id, covered);
        Ok(())
    }

    /// Removes the mount recorded for `fs_id`, returning the inode it
    /// had covered.
    pub fn umount(&self, fs_id: u32) -> Result<InodeRef> {
        let mut state = self.state.lock().unwrap();
        let covered = state.covered_by.remove(&fs_id).ok_or(Error::NotMounted)?;
        state.covers.remove(&covered);
        Ok(covered)
    }

    /// If `inode` is a mount point, returns the filesystem mounted
    /// there (so `namei` can redirect lookups into its root instead).
    pub fn mounted_on(&self, inode: InodeRef) -> Option<u32> {
        self.state.lock().unwrap().covers.get(&inode).copied()
    }

    /// If `fs_id` is a mounted filesystem (not the root filesystem),
    /// returns the inode it covers in its parent (so `..` from the
    /// mount's root can step back out).
    pub fn covering_inode(&self, fs_id: u32) -> Option<InodeRef> {
        self.state.lock().unwrap().covered_by.get(&fs_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_then_umount_round_trips() {
        let table = MountTable::new();
        let covered = InodeRef { fs_id: 1, inum: 5 };
        table.mount(covered, 2).unwrap();
        assert_eq!(table.mounted_on(covered), Some(2));
        assert_eq!(table.covering_inode(2), Some(covered));
        assert_eq!(table.umount(2).unwrap(), covered);
        assert_eq!(table.mounted_on(covered), None);
    }

    #[test]
    fn double_mount_on_same_inode_fails() {
        let table = MountTable::new();
        let covered = InodeRef { fs_id: 1, inum: 5 };
        table.mount(covered, 2).unwrap();
        assert!(matches!(table.mount(covered, 3), Err(Error::AlreadyMounted)));
    }
}
