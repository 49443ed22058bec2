//! File-system implementation, layered as described in the overview:
//! superblocks, the block allocator, the inode cache + `bmap`, the path
//! resolver, directory mutators, and mount/umount/sync.

pub mod balloc;
pub mod bmap;
pub mod dinode;
pub mod dirent;
pub mod dirops;
pub mod icache;
pub mod mount;
pub mod path;
pub mod superblock;

pub use dinode::Dinode;
pub use dirent::Dirent;
pub use icache::{Icache, Inode, InodeGuard};
pub use mount::MountTable;
pub use path::{namei, nameiparent, FsLookup, NameiResult, PathContext};
pub use superblock::{FsSuperblock, OnDiskSuperblock};

use std::sync::Arc;

use crate::bcache::Bcache;
use crate::error::Result;
use crate::param::FsParams;

/// One mounted filesystem: its logical device id and in-core superblock.
///
/// The buffer cache and inode cache are process-wide (owned by
/// [`crate::vfs::Vfs`], not per filesystem) because mount-point
/// redirection (§4.3, §4.8) needs to `iget` across filesystems; what's
/// per-mount is the superblock and its allocators.
pub struct FileSystem {
    pub superblock: Arc<FsSuperblock>,
}

impl FileSystem {
    /// Mounts the filesystem found on `dev`, validating the on-disk
    /// superblock per §6.1 and registering its inode-table location with
    /// the shared inode cache so `iget` can resolve it.
    pub fn mount(
        bcache: &Arc<Bcache>,
        icache: &icache::Icache,
        dev: u32,
        fs_id: u32,
        params: &FsParams,
    ) -> Result<Self> {
        let on_disk = OnDiskSuperblock::read(bcache, dev)?;
        icache.register_fs(fs_id, dev, on_disk.inode_table_start);
        Ok(Self {
            superblock: Arc::new(FsSuperblock::new(fs_id, dev, on_disk, params)),
        })
    }
}
