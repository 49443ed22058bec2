//! The VFS entry-point surface (§4.5–§4.9, §6.2): ties the buffer cache,
//! inode cache, mounted filesystems, mount table, and file table
//! together behind the syscalls a process actually calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::bcache::{Bcache, DeviceTable};
use crate::block_dev::BlockDevice;
use crate::error::{Error, Result};
use crate::filetable::{FileTable, OpenFlags};
use crate::fs::dirops;
use crate::fs::icache::{ialloc, Icache};
use crate::fs::mount::{InodeRef, MountTable};
use crate::fs::path::{self, FsLookup, PathContext};
use crate::fs::{FileSystem, FsSuperblock};
use crate::param::{FsParams, ROOTINO};
use crate::process::ProcessView;
use crate::stat::{FileType, Stat};

struct FsRegistry {
    filesystems: Mutex<HashMap<u32, Arc<FileSystem>>>,
    next_fs_id: Mutex<u32>,
}

impl FsLookup for FsRegistry {
    fn superblock(&self, fs_id: u32) -> Option<Arc<FsSuperblock>> {
        self.filesystems
            .lock()
            .unwrap()
            .get(&fs_id)
            .map(|fs| fs.superblock.clone())
    }
}

/// The virtual filesystem: owns every subsystem and dispatches the
/// syscall-shaped entry points across them.
pub struct Vfs {
    bcache: Arc<Bcache>,
    devices: Arc<DeviceTable>,
    icache: Icache,
    mounts: MountTable,
    registry: FsRegistry,
    file_table: FileTable,
    params: FsParams,
}

/// Directory-entry result handed back by `readdir`.
pub struct DirEntry {
    pub inum: u32,
    pub name: String,
}

impl Vfs {
    pub fn new(params: FsParams) -> Self {
        let devices = Arc::new(DeviceTable::new());
        Self {
            bcache: Bcache::new(params.nbuf, devices.clone()),
            devices,
            icache: Icache::new(params.ninode),
            mounts: MountTable::new(),
            registry: FsRegistry {
                filesystems: Mutex::new(HashMap::new()),
                next_fs_id: Mutex::new(1),
            },
            file_table: FileTable::new(params.nfile),
            params,
        }
    }

    pub fn register_device(&self, dev: u32, device: Arc<dyn BlockDevice>) {
        self.devices.register(dev, device);
    }

    /// Lays down a fresh filesystem on an already-registered `dev` (the
    /// same layout `mkfs` writes to a disk image) and mounts it. Meant
    /// for tests that want an isolated, in-memory filesystem without
    /// shelling out to the `mkfs` binary.
    pub fn mkfs_and_mount(&self, dev: u32, nblocks: u32, ninodes: u32, covered: Option<InodeRef>) -> Result<u32> {
        use crate::fs::dinode::IPB;
        use crate::fs::superblock::OnDiskSuperblock;
        use crate::param::{BLOCKSIZE, FSMAGIC};

        let inode_blocks = (ninodes as usize).div_ceil(IPB) as u32;
        let inode_table_start = 2;
        let block_bitmap_start = inode_table_start + inode_blocks;
        let bitmap_blocks = (nblocks as usize).div_ceil(BLOCKSIZE * 8) as u32;
        let first_data_block = block_bitmap_start + bitmap_blocks;
        if first_data_block >= nblocks {
            return Err(Error::InvalidArgument);
        }

        let on_disk = OnDiskSuperblock {
            magic: FSMAGIC,
            fstype: 1,
            version: 1,
            clean: true,
            inode_table_start,
            block_bitmap_start,
            first_data_block,
            ninodes,
            nblocks,
        };
        on_disk.write(&self.bcache, dev)?;
        for block in inode_table_start..first_data_block {
            let buf = self.bcache.getblk(dev, block)?;
            self.bcache.zero(&buf);
            self.bcache.bwrite(&buf)?;
            self.bcache.brelse(buf);
        }

        let fs_id = self.mount(dev, covered)?;
        let fs = self.fs(fs_id)?;
        crate::vfs::format_root(&fs, &self.bcache, &self.icache)?;
        Ok(fs_id)
    }

    /// Mounts the filesystem on `dev`, redirecting lookups of `covered`
    /// into it. Pass `covered: None` only for the initial root mount.
    pub fn mount(&self, dev: u32, covered: Option<InodeRef>) -> Result<u32> {
        let fs_id = {
            let mut next = self.registry.next_fs_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let fs = FileSystem::mount(&self.bcache, &self.icache, dev, fs_id, &self.params)?;
        if let Some(covered) = covered {
            self.mounts.mount(covered, fs_id)?;
        }
        self.registry.filesystems.lock().unwrap().insert(fs_id, Arc::new(fs));
        info!("mount: fs {} on dev {}", fs_id, dev);
        Ok(fs_id)
    }

    /// Unmounts `fs_id`, syncing its buffers first. Refuses if any
    /// open-file-table entry still references it.
    pub fn umount(&self, fs_id: u32) -> Result<()> {
        if self.file_table.count_fs_refs(fs_id) > 0 {
            return Err(Error::FilesystemBusy);
        }
        let fs = self
            .registry
            .filesystems
            .lock()
            .unwrap()
            .remove(&fs_id)
            .ok_or(Error::NotMounted)?;
        self.bcache.sync_device(fs.superblock.dev);
        self.icache.unregister_fs(fs_id);
        let _ = self.mounts.umount(fs_id);
        info!("umount: fs {}", fs_id);
        Ok(())
    }

    /// Flushes every dirty buffer across every mounted filesystem.
    pub fn sync(&self) {
        self.bcache.sync_all();
    }

    fn fs(&self, fs_id: u32) -> Result<Arc<FsSuperblock>> {
        self.registry.superblock(fs_id).ok_or(Error::NotMounted)
    }

    fn resolve(&self, proc: &dyn ProcessView, path: &str) -> Result<path::NameiResult> {
        path::namei(&self.bcache, &self.icache, &self.mounts, &self.registry, &proc.path_context(), path)
    }

    fn resolve_parent(&self, proc: &dyn ProcessView, path: &str) -> Result<(path::NameiResult, String)> {
        path::nameiparent(&self.bcache, &self.icache, &self.mounts, &self.registry, &proc.path_context(), path)
    }

    /// Opens `path`, creating it (as a regular file) first if `CREATE`
    /// is set and it doesn't exist.
    pub fn open(&self, proc: &dyn ProcessView, path: &str, flags: OpenFlags) -> Result<u32> {
        let resolved = if flags.contains(OpenFlags::CREATE) {
            match self.resolve(proc, path) {
                Ok(r) => r,
                Err(Error::NotFound) => {
                    let (parent, name) = self.resolve_parent(proc, path)?;
                    let fs = self.fs(parent.fs_id)?;
                    let inum = dirops::mknode(&fs, &self.bcache, &self.icache, parent.idx, &name, FileType::Regular, None)?;
                    self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
                    let idx = self.icache.iget(&self.bcache, parent.fs_id, inum)?;
                    path::NameiResult {
                        fs_id: parent.fs_id,
                        inum,
                        idx,
                    }
                }
                Err(e) => return Err(e),
            }
        } else {
            self.resolve(proc, path)?
        };

        let ftype = self.icache.with_inode(resolved.idx, |inode| inode.dinode.ftype);
        if ftype == FileType::Directory && flags.intersects(OpenFlags::WRITE) {
            let fs = self.fs(resolved.fs_id)?;
            self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
            return Err(Error::IsADirectory);
        }
        if flags.contains(OpenFlags::TRUNC) && ftype == FileType::Regular {
            let fs = self.fs(resolved.fs_id)?;
            crate::fs::bmap::itrunc(&fs, &self.bcache, &self.icache, resolved.idx)?;
        }

        let inode_ref = InodeRef {
            fs_id: resolved.fs_id,
            inum: resolved.inum,
        };
        let handle = self.file_table.alloc(inode_ref, flags)?;
        proc.alloc_fd(handle)
    }

    pub fn close(&self, proc: &dyn ProcessView, fd: u32) -> Result<()> {
        let handle = proc.free_fd(fd)?;
        if let Some(inode_ref) = self.file_table.close(handle)? {
            let fs = self.fs(inode_ref.fs_id)?;
            // `open` left the inode cache reference it acquired while
            // resolving the path held open for the file table entry's
            // lifetime. Re-resolve the same cache slot through `iget`
            // (a no-op beyond a refcount bump, since it's already
            // hashed) and drop both that bump and the original
            // reference in one place.
            let idx = self.icache.iget(&self.bcache, inode_ref.fs_id, inode_ref.inum)?;
            self.icache.iput(&self.bcache, &fs, idx, inode_ref.inum)?;
            self.icache.iput(&self.bcache, &fs, idx, inode_ref.inum)?;
        }
        Ok(())
    }

    pub fn read(&self, proc: &dyn ProcessView, fd: u32, buf: &mut [u8]) -> Result<usize> {
        let handle = proc.fd(fd)?;
        let file = self.file_table.get(handle)?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(Error::InvalidArgument);
        }
        let fs = self.fs(file.inode.fs_id)?;
        let idx = self.icache.iget(&self.bcache, file.inode.fs_id, file.inode.inum)?;
        let n = self.read_inode(&fs, idx, file.offset, buf)?;
        self.icache.iput(&self.bcache, &fs, idx, file.inode.inum)?;
        self.file_table.set_offset(handle, file.offset + n as u64)?;
        Ok(n)
    }

    fn read_inode(&self, fs: &FsSuperblock, idx: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.icache.with_inode(idx, |inode| inode.dinode.size);
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);
        let mut done = 0;
        while done < to_read {
            let file_off = offset + done as u64;
            let block_idx = file_off / crate::param::BLOCKSIZE as u64;
            let in_block = (file_off % crate::param::BLOCKSIZE as u64) as usize;
            let blockno = crate::fs::bmap::bmap(fs, &self.bcache, &self.icache, idx, block_idx)?;
            let chunk = (crate::param::BLOCKSIZE - in_block).min(to_read - done);
            let b = self.bcache.bread(fs.dev, blockno)?;
            let mut raw = [0u8; crate::param::BLOCKSIZE];
            self.bcache.read(&b, 0, &mut raw);
            self.bcache.brelse(b);
            buf[done..done + chunk].copy_from_slice(&raw[in_block..in_block + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    pub fn write(&self, proc: &dyn ProcessView, fd: u32, buf: &[u8]) -> Result<usize> {
        let handle = proc.fd(fd)?;
        let file = self.file_table.get(handle)?;
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(Error::InvalidArgument);
        }
        let fs = self.fs(file.inode.fs_id)?;
        let idx = self.icache.iget(&self.bcache, file.inode.fs_id, file.inode.inum)?;
        let offset = if file.flags.contains(OpenFlags::APPEND) {
            self.icache.with_inode(idx, |inode| inode.dinode.size)
        } else {
            file.offset
        };
        let n = self.write_inode(&fs, idx, offset, buf)?;
        self.icache.iupdate(&self.bcache, idx, file.inode.fs_id, file.inode.inum)?;
        self.icache.iput(&self.bcache, &fs, idx, file.inode.inum)?;
        self.file_table.set_offset(handle, offset + n as u64)?;
        Ok(n)
    }

    fn write_inode(&self, fs: &FsSuperblock, idx: usize, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let file_off = offset + done as u64;
            let block_idx = file_off / crate::param::BLOCKSIZE as u64;
            let in_block = (file_off % crate::param::BLOCKSIZE as u64) as usize;
            let chunk = (crate::param::BLOCKSIZE - in_block).min(buf.len() - done);
            let blockno = crate::fs::bmap::bmap(fs, &self.bcache, &self.icache, idx, block_idx)?;
            let b = self.bcache.bread(fs.dev, blockno)?;
            self.bcache.write(&b, in_block, &buf[done..done + chunk]);
            self.bcache.brelse(b);
            done += chunk;
        }
        let new_size = offset + done as u64;
        self.icache.with_inode_mut(idx, |inode| {
            if new_size > inode.dinode.size {
                inode.dinode.size = new_size;
            }
        });
        Ok(done)
    }

    pub fn lseek(&self, proc: &dyn ProcessView, fd: u32, offset: u64) -> Result<()> {
        let handle = proc.fd(fd)?;
        self.file_table.set_offset(handle, offset)
    }

    pub fn dup(&self, proc: &dyn ProcessView, fd: u32) -> Result<u32> {
        let (new_fd, handle) = proc.dup_fd(fd)?;
        self.file_table.dup(handle)?;
        Ok(new_fd)
    }

    pub fn link(&self, proc: &dyn ProcessView, existing: &str, new_path: &str) -> Result<()> {
        let target = self.resolve(proc, existing)?;
        let (parent, name) = self.resolve_parent(proc, new_path)?;
        if parent.fs_id != target.fs_id {
            let fs = self.fs(parent.fs_id)?;
            self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
            let fs = self.fs(target.fs_id)?;
            self.icache.iput(&self.bcache, &fs, target.idx, target.inum)?;
            return Err(Error::CrossDevice);
        }
        let fs = self.fs(parent.fs_id)?;
        // `linki` bumps the target's nlink itself on success.
        let result = dirops::linki(&fs, &self.bcache, &self.icache, parent.idx, &name, target.inum);
        self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
        self.icache.iput(&self.bcache, &fs, target.idx, target.inum)?;
        result
    }

    pub fn unlink(&self, proc: &dyn ProcessView, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(proc, path)?;
        if name == "." || name == ".." {
            let fs = self.fs(parent.fs_id)?;
            self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
            return Err(Error::InvalidArgument);
        }
        let fs = self.fs(parent.fs_id)?;
        // `unlinki` drops the removed entry's target's nlink itself.
        dirops::unlinki(&fs, &self.bcache, &self.icache, parent.idx, &name)?;
        self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
        Ok(())
    }

    pub fn mkdir(&self, proc: &dyn ProcessView, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(proc, path)?;
        let fs = self.fs(parent.fs_id)?;
        let result = dirops::mkdir(&fs, &self.bcache, &self.icache, parent.idx, parent.inum, &name);
        self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
        result.map(|_| ())
    }

    pub fn rmdir(&self, proc: &dyn ProcessView, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(proc, path)?;
        let fs = self.fs(parent.fs_id)?;
        let result = dirops::rmdir(&fs, &self.bcache, &self.icache, parent.idx, &name);
        self.icache.iput(&self.bcache, &fs, parent.idx, parent.inum)?;
        result
    }

    pub fn rename(&self, proc: &dyn ProcessView, old_path: &str, new_path: &str) -> Result<()> {
        let (old_parent, old_name) = self.resolve_parent(proc, old_path)?;
        let (new_parent, new_name) = self.resolve_parent(proc, new_path)?;
        if old_parent.fs_id != new_parent.fs_id {
            let fs = self.fs(old_parent.fs_id)?;
            self.icache.iput(&self.bcache, &fs, old_parent.idx, old_parent.inum)?;
            let fs = self.fs(new_parent.fs_id)?;
            self.icache.iput(&self.bcache, &fs, new_parent.idx, new_parent.inum)?;
            return Err(Error::CrossDevice);
        }
        let fs = self.fs(old_parent.fs_id)?;
        let result = dirops::rename(
            &fs,
            &self.bcache,
            &self.icache,
            old_parent.idx,
            old_parent.inum,
            &old_name,
            new_parent.idx,
            new_parent.inum,
            &new_name,
        );
        self.icache.iput(&self.bcache, &fs, old_parent.idx, old_parent.inum)?;
        if new_parent.idx != old_parent.idx {
            self.icache.iput(&self.bcache, &fs, new_parent.idx, new_parent.inum)?;
        }
        result
    }

    pub fn stat(&self, proc: &dyn ProcessView, path: &str) -> Result<Stat> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        let stat = self.icache.with_inode(resolved.idx, |inode| Stat {
            dev: fs.dev,
            ino: resolved.inum,
            ftype: inode.dinode.ftype,
            nlink: inode.dinode.nlink,
            size: inode.dinode.size,
            uid: inode.dinode.uid,
            gid: inode.dinode.gid,
            mode: inode.dinode.mode,
            mtime: inode.dinode.mtime,
        });
        self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
        Ok(stat)
    }

    pub fn chmod(&self, proc: &dyn ProcessView, path: &str, mode: u16) -> Result<()> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        self.icache.with_inode_mut(resolved.idx, |inode| inode.dinode.mode = mode);
        self.icache.iupdate(&self.bcache, resolved.idx, resolved.fs_id, resolved.inum)?;
        self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
        Ok(())
    }

    pub fn chown(&self, proc: &dyn ProcessView, path: &str, uid: u16, gid: u16) -> Result<()> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        self.icache.with_inode_mut(resolved.idx, |inode| {
            inode.dinode.uid = uid;
            inode.dinode.gid = gid;
        });
        self.icache.iupdate(&self.bcache, resolved.idx, resolved.fs_id, resolved.inum)?;
        self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
        Ok(())
    }

    pub fn chdir(&self, proc: &dyn ProcessView, path: &str) -> Result<()> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        let ftype = self.icache.with_inode(resolved.idx, |inode| inode.dinode.ftype);
        if ftype != FileType::Directory {
            self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
            return Err(Error::NotADirectory);
        }
        let old_cwd = proc.path_context().cwd;
        proc.set_cwd(InodeRef {
            fs_id: resolved.fs_id,
            inum: resolved.inum,
        });
        let old_idx = self.icache.iget(&self.bcache, old_cwd.fs_id, old_cwd.inum)?;
        let old_fs = self.fs(old_cwd.fs_id)?;
        self.icache.iput(&self.bcache, &old_fs, old_idx, old_cwd.inum)?;
        Ok(())
    }

    pub fn chroot(&self, proc: &dyn ProcessView, path: &str) -> Result<()> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        let ftype = self.icache.with_inode(resolved.idx, |inode| inode.dinode.ftype);
        if ftype != FileType::Directory {
            self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
            return Err(Error::NotADirectory);
        }
        proc.set_root(InodeRef {
            fs_id: resolved.fs_id,
            inum: resolved.inum,
        });
        Ok(())
    }

    /// Reads directory `path` in full, returning its non-empty entries.
    /// (`opendir`/`readdir`/`closedir` collapse to this in a hosted,
    /// non-streaming re-implementation: there is no descriptor-held
    /// cursor to advance between calls.)
    pub fn readdir(&self, proc: &dyn ProcessView, path: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(proc, path)?;
        let fs = self.fs(resolved.fs_id)?;
        let ftype = self.icache.with_inode(resolved.idx, |inode| inode.dinode.ftype);
        if ftype != FileType::Directory {
            self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
            return Err(Error::NotADirectory);
        }
        let size = self.icache.with_inode(resolved.idx, |inode| inode.dinode.size);
        let nblocks = (size as usize).div_ceil(crate::param::BLOCKSIZE);
        let mut entries = Vec::new();
        for block_idx in 0..nblocks {
            let blockno = crate::fs::bmap::bmap(&fs, &self.bcache, &self.icache, resolved.idx, block_idx as u64)?;
            let b = self.bcache.bread(fs.dev, blockno)?;
            let mut raw = [0u8; crate::param::BLOCKSIZE];
            self.bcache.read(&b, 0, &mut raw);
            self.bcache.brelse(b);
            for chunk in raw.chunks_exact(crate::fs::dirent::DIRENT_SIZE) {
                let dirent = crate::fs::Dirent::from_bytes(chunk);
                if !dirent.is_unused() {
                    entries.push(DirEntry {
                        inum: dirent.inum as u32,
                        name: dirent.name().to_string(),
                    });
                }
            }
        }
        self.icache.iput(&self.bcache, &fs, resolved.idx, resolved.inum)?;
        Ok(entries)
    }
}

/// Formats the root directory of a freshly `mkfs`'d filesystem: the
/// root inode itself plus its `.`/`..` entries, both pointing at
/// [`ROOTINO`]. Used by `mkfs` before the filesystem is ever mounted
/// through a [`Vfs`].
pub fn format_root(fs: &FsSuperblock, bcache: &Arc<Bcache>, icache: &Icache) -> Result<()> {
    let inum = ialloc(fs, bcache, icache, FileType::Directory)?;
    if inum != ROOTINO {
        return Err(Error::InvalidArgument);
    }
    let idx = icache.iget(bcache, fs.fs_id, inum)?;
    // `.` and `..` both reference the root itself; `linki` bumps its
    // nlink for each, landing on 2 with no manual accounting needed.
    dirops::linki(fs, bcache, icache, idx, ".", ROOTINO)?;
    dirops::linki(fs, bcache, icache, idx, "..", ROOTINO)?;
    icache.iput(bcache, fs, idx, inum)?;
    Ok(())
}
