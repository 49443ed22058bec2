//! The on-disk superblock (§3, §6.1) and its in-core counterpart
//! (§3 "In-core superblock").

use std::sync::{Arc, Mutex};

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::bcache::Bcache;
use crate::error::{Error, Result};
use crate::param::{FsParams, BLOCKSIZE, FREE_CACHE_CAP, FSMAGIC};
use crate::waitchannel::WaitChannel;

/// Bytes occupied by the on-disk superblock record within sector 1.
pub const ONDISK_SUPERBLOCK_SIZE: usize = 4 * 8 + 1;
const_assert!(ONDISK_SUPERBLOCK_SIZE <= BLOCKSIZE);

/// Stored at sector 1, little-endian, per §6.1.
#[derive(Debug, Clone, Copy)]
pub struct OnDiskSuperblock {
    pub magic: u32,
    pub fstype: u32,
    pub version: u32,
    pub clean: bool,
    pub inode_table_start: u32,
    pub block_bitmap_start: u32,
    pub first_data_block: u32,
    pub ninodes: u32,
    pub nblocks: u32,
}

impl OnDiskSuperblock {
    pub fn to_bytes(&self) -> [u8; ONDISK_SUPERBLOCK_SIZE] {
        let mut out = [0u8; ONDISK_SUPERBLOCK_SIZE];
        let mut w = 0;
        let mut put_u32 = |out: &mut [u8; ONDISK_SUPERBLOCK_SIZE], w: &mut usize, v: u32| {
            out[*w..*w + 4].copy_from_slice(&v.to_le_bytes());
            *w += 4;
        };
        put_u32(&mut out, &mut w, self.magic);
        put_u32(&mut out, &mut w, self.fstype);
        put_u32(&mut out, &mut w, self.version);
        put_u32(&mut out, &mut w, self.inode_table_start);
        put_u32(&mut out, &mut w, self.block_bitmap_start);
        put_u32(&mut out, &mut w, self.first_data_block);
        put_u32(&mut out, &mut w, self.ninodes);
        put_u32(&mut out, &mut w, self.nblocks);
        out[w] = u8::from(self.clean);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let get_u32 = |w: usize| u32::from_le_bytes(buf[w..w + 4].try_into().unwrap());
        Self {
            magic: get_u32(0),
            fstype: get_u32(4),
            version: get_u32(8),
            inode_table_start: get_u32(12),
            block_bitmap_start: get_u32(16),
            first_data_block: get_u32(20),
            ninodes: get_u32(24),
            nblocks: get_u32(28),
            clean: buf[32] != 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == FSMAGIC
            && self.ninodes != 0
            && self.nblocks != 0
            && self.block_bitmap_start < self.nblocks
            && self.first_data_block < self.nblocks
            && self.inode_table_start < self.nblocks
    }

    /// Reads the superblock from sector 1 of `dev`.
    pub fn read(bcache: &Arc<Bcache>, dev: u32) -> Result<Self> {
        let buf = bcache.bread(dev, 1)?;
        let mut raw = [0u8; ONDISK_SUPERBLOCK_SIZE];
        bcache.read(&buf, 0, &mut raw);
        bcache.brelse(buf);
        let sb = Self::from_bytes(&raw);
        if !sb.is_valid() {
            return Err(Error::BadMagic);
        }
        Ok(sb)
    }

    /// Writes the superblock to sector 1 of `dev`.
    pub fn write(&self, bcache: &Arc<Bcache>, dev: u32) -> Result<()> {
        let buf = bcache.getblk(dev, 1)?;
        bcache.write(&buf, 0, &self.to_bytes());
        bcache.bwrite(&buf)?;
        bcache.brelse(buf);
        Ok(())
    }
}

/// Free-{block,inode} cache shared shape: up to [`FREE_CACHE_CAP`] cached
/// indices plus a scan cursor, per §3.
#[derive(Default)]
pub struct FreeCache {
    pub cached: ArrayVec<u32, FREE_CACHE_CAP>,
    pub scan_cursor: u32,
}

pub struct SuperblockState {
    pub on_disk: OnDiskSuperblock,
    pub free_blocks: FreeCache,
    pub free_inodes: FreeCache,
    pub modified: bool,
}

/// The in-core superblock: the on-disk record plus lifecycle bookkeeping
/// and the free-block/free-inode caches. Its own `Mutex` is the
/// `SBLOCKBUSY` lock (§5); `sblock_busy` is the channel released when it
/// clears.
pub struct FsSuperblock {
    pub fs_id: u32,
    pub dev: u32,
    pub state: Mutex<SuperblockState>,
    pub sblock_busy: WaitChannel,
}

impl FsSuperblock {
    pub fn new(fs_id: u32, dev: u32, on_disk: OnDiskSuperblock, _params: &FsParams) -> Self {
        Self {
            fs_id,
            dev,
            state: Mutex::new(SuperblockState {
                on_disk,
                free_blocks: FreeCache::default(),
                free_inodes: FreeCache::default(),
                modified: false,
            }),
            sblock_busy: WaitChannel::new(),
        }
    }

    pub fn ninodes(&self) -> u32 {
        self.state.lock().unwrap().on_disk.ninodes
    }

    pub fn nblocks(&self) -> u32 {
        self.state.lock().unwrap().on_disk.nblocks
    }
}
