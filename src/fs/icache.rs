//! The inode cache (§4.3): an arena of in-core inodes hashed by
//! `(fs_id, inum)`, structurally identical to the buffer cache's arena.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::bcache::Bcache;
use crate::error::{Error, Result};
use crate::fs::dinode::{Dinode, DINODE_SIZE, IPB};
use crate::fs::superblock::FsSuperblock;
use crate::slab::Slab;
use crate::stat::FileType;
use crate::waitchannel::WaitChannel;

type InodeKey = (u32, u32);

/// Payload held per in-core inode slot. The on-disk image is cached here
/// while the slot is in use; `dirty` marks that it must be written back
/// before the slot is recycled.
pub struct Inode {
    pub dinode: Dinode,
    pub dirty: bool,
}

/// Where a mounted filesystem's inode table lives, so the cache (shared
/// across every mounted filesystem) can translate an inode number into
/// a block/offset without embedding any one filesystem's geometry.
#[derive(Clone, Copy)]
struct FsLocation {
    dev: u32,
    inode_table_start: u32,
}

pub struct Icache {
    locations: Mutex<HashMap<u32, FsLocation>>,
    inner: std::sync::Mutex<Slab<InodeKey, Inode>>,
    locked: WaitChannel,
}

/// A reference-counted, exclusively-locked handle to an in-core inode.
/// Dropping it does not unlock or release the cache reference: callers
/// must call [`Icache::iput`] explicitly, mirroring `iget`/`iput`'s
/// manual reference counting.
pub struct InodeGuard {
    pub fs_id: u32,
    pub inum: u32,
    idx: usize,
}

impl Icache {
    pub fn new(ninode: usize) -> Self {
        Self {
            locations: Mutex::new(HashMap::new()),
            inner: std::sync::Mutex::new(Slab::new(ninode, || Inode {
                dinode: Dinode::free(),
                dirty: false,
            })),
            locked: WaitChannel::new(),
        }
    }

    /// Registers where `fs_id`'s inode table lives. Called by `mount`
    /// before the filesystem is reachable from `namei`.
    pub fn register_fs(&self, fs_id: u32, dev: u32, inode_table_start: u32) {
        self.locations
            .lock()
            .unwrap()
            .insert(fs_id, FsLocation { dev, inode_table_start });
    }

    /// Drops the location entry for `fs_id`. Called by `umount`.
    pub fn unregister_fs(&self, fs_id: u32) {
        self.locations.lock().unwrap().remove(&fs_id);
    }

    fn location(&self, fs_id: u32) -> Result<FsLocation> {
        // Also used by `ialloc`, which needs the owning device before an
        // inode slot exists to resolve it through.
        self.locations
            .lock()
            .unwrap()
            .get(&fs_id)
            .copied()
            .ok_or(Error::NotMounted)
    }

    fn block_of(loc: FsLocation, inum: u32) -> u32 {
        loc.inode_table_start + (inum - 1) / IPB as u32
    }

    fn offset_of(inum: u32) -> usize {
        ((inum - 1) as usize % IPB) * DINODE_SIZE
    }

    /// Finds or allocates a cache slot for `(fs_id, inum)`, bumping its
    /// refcount; does not lock it. Unlike `getblk`, exhaustion is an
    /// immediate error rather than a sleep-retry: an inode cache miss
    /// under load is not expected to resolve itself the way a transient
    /// buffer shortage can.
    pub fn iget(&self, bcache: &Arc<Bcache>, fs_id: u32, inum: u32) -> Result<usize> {
        let key = (fs_id, inum);
        let mut g = self.inner.lock().unwrap();
        if let Some(idx) = g.find(&key) {
            g.remove_from_free(idx);
            g.slot_mut(idx).refcount += 1;
            return Ok(idx);
        }
        let idx = g.pop_free_front().ok_or_else(|| {
            warn!("icache: exhausted for fs {}", fs_id);
            Error::NoFreeInodes
        })?;
        if g.slot(idx).key.is_some() {
            g.unhash(idx);
        }
        g.rehash(idx, key);
        g.slot_mut(idx).refcount = 1;
        g.slot_mut(idx).data.dirty = false;
        g.slot_mut(idx).data.dinode = Dinode::free();
        drop(g);
        self.load(bcache, idx, fs_id, inum)?;
        Ok(idx)
    }

    fn load(&self, bcache: &Arc<Bcache>, idx: usize, fs_id: u32, inum: u32) -> Result<()> {
        let loc = self.location(fs_id)?;
        let block = Self::block_of(loc, inum);
        let offset = Self::offset_of(inum);
        let buf = bcache.bread(loc.dev, block)?;
        let mut raw = [0u8; DINODE_SIZE];
        bcache.read(&buf, offset, &mut raw);
        bcache.brelse(buf);
        let dinode = Dinode::from_bytes(&raw)?;
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(idx).data.dinode = dinode;
        Ok(())
    }

    /// Locks the inode slot for exclusive access, sleeping on
    /// `INODELOCKED` if another caller holds it.
    pub fn lock(&self, idx: usize, fs_id: u32, inum: u32) -> InodeGuard {
        let mut g = self.inner.lock().unwrap();
        while g.slot(idx).busy {
            g = self.locked.sleep(g);
        }
        g.slot_mut(idx).busy = true;
        InodeGuard { fs_id, inum, idx }
    }

    pub fn unlock(&self, guard: InodeGuard) {
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(guard.idx).busy = false;
        drop(g);
        self.locked.wake_all();
        std::mem::forget(guard);
    }

    pub fn with_inode<R>(&self, idx: usize, f: impl FnOnce(&Inode) -> R) -> R {
        let g = self.inner.lock().unwrap();
        f(&g.slot(idx).data)
    }

    pub fn with_inode_mut<R>(&self, idx: usize, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        let r = f(&mut g.slot_mut(idx).data);
        g.slot_mut(idx).data.dirty = true;
        r
    }

    /// Writes the in-core inode back to its on-disk slot if dirty.
    pub fn iupdate(&self, bcache: &Arc<Bcache>, idx: usize, fs_id: u32, inum: u32) -> Result<()> {
        let (dirty, dinode) = {
            let g = self.inner.lock().unwrap();
            (g.slot(idx).data.dirty, g.slot(idx).data.dinode)
        };
        if !dirty {
            return Ok(());
        }
        let loc = self.location(fs_id)?;
        let block = Self::block_of(loc, inum);
        let offset = Self::offset_of(inum);
        let buf = bcache.bread(loc.dev, block)?;
        bcache.write(&buf, offset, &dinode.to_bytes());
        bcache.bwrite(&buf)?;
        bcache.brelse(buf);
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(idx).data.dirty = false;
        Ok(())
    }

    /// Drops a reference; if it was the last one and the link count has
    /// also dropped to zero, frees the on-disk inode and recycles the
    /// slot.
    pub fn iput(&self, bcache: &Arc<Bcache>, fs: &FsSuperblock, idx: usize, inum: u32) -> Result<()> {
        let should_free = {
            let mut g = self.inner.lock().unwrap();
            let slot = g.slot_mut(idx);
            slot.refcount -= 1;
            slot.refcount == 0 && slot.data.dinode.nlink == 0
        };
        if should_free {
            crate::fs::bmap::itrunc(fs, bcache, self, idx)?;
            {
                let mut g = self.inner.lock().unwrap();
                g.slot_mut(idx).data.dinode = Dinode::free();
                g.slot_mut(idx).data.dirty = true;
            }
            self.iupdate(bcache, idx, fs.fs_id, inum)?;
            free_inode(fs, bcache, inum)?;
        }
        let mut g = self.inner.lock().unwrap();
        if g.slot(idx).refcount == 0 {
            g.unhash(idx);
            g.push_free_back(idx);
        }
        Ok(())
    }

    pub fn bump_ref(&self, idx: usize) {
        self.inner.lock().unwrap().slot_mut(idx).refcount += 1;
    }
}

/// Allocates a fresh on-disk inode of type `ftype`, scanning the
/// superblock's free-inode cache the same way `balloc` scans free
/// blocks.
pub fn ialloc(fs: &FsSuperblock, bcache: &Arc<Bcache>, icache: &Icache, ftype: FileType) -> Result<u32> {
    let loc = icache.location(fs.fs_id)?;
    let dev = loc.dev;
    let inum = {
        let mut state = fs.state.lock().unwrap();
        loop {
            if let Some(inum) = state.free_inodes.cached.pop() {
                break inum;
            }
            let ninodes = state.on_disk.ninodes;
            let inode_table_start = state.on_disk.inode_table_start;
            // Inode numbering is 1-based (`ROOTINO` itself is inode 1 and
            // is scanned for like any other on a fresh filesystem, where
            // `format_root` allocates it through this same path).
            let mut scanned = state.free_inodes.scan_cursor.max(1);
            let mut found = Vec::new();
            while scanned <= ninodes && found.len() < crate::param::FREE_CACHE_CAP {
                let block = inode_table_start + (scanned - 1) / IPB as u32;
                let offset = ((scanned - 1) as usize % IPB) * DINODE_SIZE;
                let buf = bcache.bread(dev, block)?;
                let mut raw = [0u8; DINODE_SIZE];
                bcache.read(&buf, offset, &mut raw);
                bcache.brelse(buf);
                if raw[0] == FileType::Free as u8 {
                    found.push(scanned);
                }
                scanned += 1;
            }
            state.free_inodes.scan_cursor = scanned;
            for i in found {
                let _ = state.free_inodes.cached.try_push(i);
            }
            if state.free_inodes.cached.is_empty() {
                if scanned > ninodes {
                    state.free_inodes.scan_cursor = 1;
                }
                warn!("ialloc: no free inodes on fs {}", fs.fs_id);
                return Err(Error::NoFreeInodes);
            }
        }
    };
    // Write the initial record straight to its on-disk slot rather than
    // going through `iget`, so this doesn't leave a cache reference the
    // caller has to know to release: callers `iget` the inum themselves
    // once they're ready to populate and link it.
    let mut dinode = Dinode::free();
    dinode.ftype = ftype;
    let block = Icache::block_of(loc, inum);
    let offset = Icache::offset_of(inum);
    let buf = bcache.bread(dev, block)?;
    bcache.write(&buf, offset, &dinode.to_bytes());
    bcache.bwrite(&buf)?;
    bcache.brelse(buf);
    Ok(inum)
}

fn free_inode(fs: &FsSuperblock, _bcache: &Arc<Bcache>, inum: u32) -> Result<()> {
    let mut state = fs.state.lock().unwrap();
    if state.free_inodes.cached.len() < crate::param::FREE_CACHE_CAP {
        let _ = state.free_inodes.cached.try_push(inum);
    }
    Ok(())
}

impl Drop for InodeGuard {
    fn drop(&mut self) {
        debug_assert!(
            false,
            "InodeGuard for ({}, {}) dropped without Icache::unlock",
            self.fs_id, self.inum
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcache::DeviceTable;
    use crate::block_dev::MemBlockDevice;

    fn setup() -> (Arc<Bcache>, Icache) {
        let devices = Arc::new(DeviceTable::new());
        devices.register(0, Arc::new(MemBlockDevice::new(16)));
        let bcache = Bcache::new(8, devices);
        for block in 0..4 {
            let buf = bcache.getblk(0, block).unwrap();
            bcache.zero(&buf);
            bcache.bwrite(&buf).unwrap();
            bcache.brelse(buf);
        }
        let icache = Icache::new(4);
        icache.register_fs(1, 0, 2);
        (bcache, icache)
    }

    #[test]
    fn iget_same_inum_twice_shares_one_slot() {
        let (bcache, icache) = setup();
        let a = icache.iget(&bcache, 1, 1).unwrap();
        let b = icache.iget(&bcache, 1, 1).unwrap();
        assert_eq!(a, b);
        icache.with_inode(a, |inode| assert_eq!(inode.dinode.ftype, FileType::Free));
    }

    #[test]
    fn unregistered_fs_fails_lookup() {
        let (bcache, icache) = setup();
        assert!(matches!(icache.iget(&bcache, 99, 1), Err(Error::NotMounted)));
    }
}
