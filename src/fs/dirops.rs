//! Directory mutators (§4.7): linking, unlinking, and creating files,
//! directories, and device special files.

use std::sync::Arc;

use crate::bcache::Bcache;
use crate::error::{Error, Result};
use crate::fs::dirent::{validate_name, Dirent, DIRENT_SIZE};
use crate::fs::icache::{ialloc, Icache};
use crate::fs::superblock::FsSuperblock;
use crate::param::{BLOCKSIZE, ROOTINO};
use crate::stat::FileType;

/// Appends `(inum, name)` as a new entry in directory `dir_idx`, reusing
/// the first unused slot if one exists, and bumps `inum`'s own link
/// count to account for the new reference.
pub fn linki(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    name: &str,
    inum: u32,
) -> Result<()> {
    validate_name(name)?;
    if dir_lookup(fs, bcache, icache, dir_idx, name)?.is_some() {
        return Err(Error::AlreadyExists);
    }

    let size = icache.with_inode(dir_idx, |inode| inode.dinode.size);
    let nentries = (size as usize) / DIRENT_SIZE;

    for slot in 0..nentries {
        let (block_idx, offset) = entry_location(slot);
        let blockno = crate::fs::bmap::bmap(fs, bcache, icache, dir_idx, block_idx)?;
        let buf = bcache.bread(fs.dev, blockno)?;
        let mut raw = [0u8; DIRENT_SIZE];
        bcache.read(&buf, offset, &mut raw);
        if Dirent::from_bytes(&raw).is_unused() {
            let dirent = Dirent::new(inum, name);
            bcache.write(&buf, offset, &dirent.to_bytes());
            bcache.brelse(buf);
            return bump_nlink(fs, bcache, icache, inum, 1);
        }
        bcache.brelse(buf);
    }

    let (block_idx, offset) = entry_location(nentries);
    let blockno = crate::fs::bmap::bmap(fs, bcache, icache, dir_idx, block_idx)?;
    let buf = bcache.bread(fs.dev, blockno)?;
    let dirent = Dirent::new(inum, name);
    bcache.write(&buf, offset, &dirent.to_bytes());
    bcache.brelse(buf);
    icache.with_inode_mut(dir_idx, |inode| {
        inode.dinode.size = ((nentries + 1) * DIRENT_SIZE) as u64;
    });
    bump_nlink(fs, bcache, icache, inum, 1)
}

/// Clears the entry named `name` from directory `dir_idx`, dropping the
/// removed entry's target's link count to match.
pub fn unlinki(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    name: &str,
) -> Result<u32> {
    validate_name(name)?;
    let size = icache.with_inode(dir_idx, |inode| inode.dinode.size);
    let nentries = (size as usize) / DIRENT_SIZE;
    for slot in 0..nentries {
        let (block_idx, offset) = entry_location(slot);
        let blockno = crate::fs::bmap::bmap(fs, bcache, icache, dir_idx, block_idx)?;
        let buf = bcache.bread(fs.dev, blockno)?;
        let mut raw = [0u8; DIRENT_SIZE];
        bcache.read(&buf, offset, &mut raw);
        let dirent = Dirent::from_bytes(&raw);
        if !dirent.is_unused() && dirent.name_matches(name) {
            bcache.write(&buf, offset, &Dirent::empty().to_bytes());
            bcache.brelse(buf);
            let inum = dirent.inum as u32;
            bump_nlink(fs, bcache, icache, inum, -1)?;
            return Ok(inum);
        }
        bcache.brelse(buf);
    }
    Err(Error::NotFound)
}

/// Adjusts `inum`'s on-disk link count by `delta`, the way `linki`/
/// `unlinki` account for a directory entry being added or removed.
fn bump_nlink(fs: &FsSuperblock, bcache: &Arc<Bcache>, icache: &Icache, inum: u32, delta: i32) -> Result<()> {
    let idx = icache.iget(bcache, fs.fs_id, inum)?;
    icache.with_inode_mut(idx, |inode| {
        inode.dinode.nlink = (inode.dinode.nlink as i32 + delta) as u16;
    });
    icache.iupdate(bcache, idx, fs.fs_id, inum)?;
    icache.iput(bcache, fs, idx, inum)?;
    Ok(())
}

fn dir_lookup(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    name: &str,
) -> Result<Option<u32>> {
    let size = icache.with_inode(dir_idx, |inode| inode.dinode.size);
    let nentries = (size as usize) / DIRENT_SIZE;
    for slot in 0..nentries {
        let (block_idx, offset) = entry_location(slot);
        let blockno = crate::fs::bmap::bmap(fs, bcache, icache, dir_idx, block_idx)?;
        let buf = bcache.bread(fs.dev, blockno)?;
        let mut raw = [0u8; DIRENT_SIZE];
        bcache.read(&buf, offset, &mut raw);
        bcache.brelse(buf);
        let dirent = Dirent::from_bytes(&raw);
        if !dirent.is_unused() && dirent.name_matches(name) {
            return Ok(Some(dirent.inum as u32));
        }
    }
    Ok(None)
}

/// Returns true if directory `dir_idx` has no entries besides `.`/`..`.
pub fn dir_is_empty(fs: &FsSuperblock, bcache: &Arc<Bcache>, icache: &Icache, dir_idx: usize) -> Result<bool> {
    let size = icache.with_inode(dir_idx, |inode| inode.dinode.size);
    let nentries = (size as usize) / DIRENT_SIZE;
    for slot in 2..nentries {
        let (block_idx, offset) = entry_location(slot);
        let blockno = crate::fs::bmap::bmap(fs, bcache, icache, dir_idx, block_idx)?;
        let buf = bcache.bread(fs.dev, blockno)?;
        let mut raw = [0u8; DIRENT_SIZE];
        bcache.read(&buf, offset, &mut raw);
        bcache.brelse(buf);
        if !Dirent::from_bytes(&raw).is_unused() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn entry_location(slot: usize) -> (u64, usize) {
    let entries_per_block = BLOCKSIZE / DIRENT_SIZE;
    let block_idx = (slot / entries_per_block) as u64;
    let offset = (slot % entries_per_block) * DIRENT_SIZE;
    (block_idx, offset)
}

/// Creates a new inode of type `ftype` and links it into `dir_idx` as
/// `name`. `linki` accounts for the resulting link count itself.
pub fn mknode(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    name: &str,
    ftype: FileType,
    device: Option<(u16, u16)>,
) -> Result<u32> {
    let inum = ialloc(fs, bcache, icache, ftype)?;
    let idx = icache.iget(bcache, fs.fs_id, inum)?;
    if let Some((major, minor)) = device {
        icache.with_inode_mut(idx, |inode| inode.dinode.set_device_id(major, minor));
        icache.iupdate(bcache, idx, fs.fs_id, inum)?;
    }
    // Held open across `linki` so a failed link (name already taken)
    // leaves nlink at 0 and this `iput` reclaims the orphaned inode.
    let link_result = linki(fs, bcache, icache, dir_idx, name, inum);
    icache.iput(bcache, fs, idx, inum)?;
    link_result?;
    Ok(inum)
}

/// Creates a new directory `name` under `dir_idx`, pre-populating `.`
/// and `..`. `linki` accounts for every link this creates: `.` and the
/// parent's entry both reference the new directory (nlink ends at 2),
/// and `..` references the parent (whose own nlink goes up by one).
pub fn mkdir(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    dir_inum: u32,
    name: &str,
) -> Result<u32> {
    let inum = ialloc(fs, bcache, icache, FileType::Directory)?;
    let idx = icache.iget(bcache, fs.fs_id, inum)?;
    let result = linki(fs, bcache, icache, idx, ".", inum).and_then(|_| linki(fs, bcache, icache, idx, "..", dir_inum));
    icache.iput(bcache, fs, idx, inum)?;
    result?;

    if let Err(e) = linki(fs, bcache, icache, dir_idx, name, inum) {
        // Orphan the half-built directory: nothing in the tree names it.
        let idx = icache.iget(bcache, fs.fs_id, inum)?;
        icache.with_inode_mut(idx, |inode| inode.dinode.nlink = 0);
        icache.iput(bcache, fs, idx, inum)?;
        return Err(e);
    }
    Ok(inum)
}

/// Removes directory `name` from `dir_idx` after checking it is empty
/// (and isn't `.`, `..`, or the filesystem root).
pub fn rmdir(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    dir_idx: usize,
    name: &str,
) -> Result<()> {
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument);
    }
    let inum = dir_lookup(fs, bcache, icache, dir_idx, name)?.ok_or(Error::NotFound)?;
    if inum == ROOTINO {
        return Err(Error::InvalidArgument);
    }
    let idx = icache.iget(bcache, fs.fs_id, inum)?;
    let ftype = icache.with_inode(idx, |inode| inode.dinode.ftype);
    if ftype != FileType::Directory {
        icache.iput(bcache, fs, idx, inum)?;
        return Err(Error::NotADirectory);
    }
    if !dir_is_empty(fs, bcache, icache, idx)? {
        icache.iput(bcache, fs, idx, inum)?;
        return Err(Error::DirectoryNotEmpty);
    }
    unlinki(fs, bcache, icache, dir_idx, name)?;
    icache.with_inode_mut(dir_idx, |inode| inode.dinode.nlink -= 1);
    icache.with_inode_mut(idx, |inode| inode.dinode.nlink = 0);
    icache.iput(bcache, fs, idx, inum)?;
    Ok(())
}

/// Moves `old_name` out of `old_dir_idx` into `new_dir_idx` as
/// `new_name`, rewriting the moved directory's `..` if it is one.
/// Both directories must belong to the same mounted filesystem: the
/// VFS layer rejects cross-device renames before calling this.
#[allow(clippy::too_many_arguments)]
pub fn rename(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    old_dir_idx: usize,
    old_dir_inum: u32,
    old_name: &str,
    new_dir_idx: usize,
    new_dir_inum: u32,
    new_name: &str,
) -> Result<()> {
    validate_name(new_name)?;
    if let Some(existing) = dir_lookup(fs, bcache, icache, new_dir_idx, new_name)? {
        let _ = existing;
        return Err(Error::AlreadyExists);
    }
    let inum = unlinki(fs, bcache, icache, old_dir_idx, old_name)?;
    if let Err(e) = linki(fs, bcache, icache, new_dir_idx, new_name, inum) {
        let _ = linki(fs, bcache, icache, old_dir_idx, old_name, inum);
        return Err(e);
    }

    if old_dir_idx != new_dir_idx {
        let idx = icache.iget(bcache, fs.fs_id, inum)?;
        let ftype = icache.with_inode(idx, |inode| inode.dinode.ftype);
        if ftype == FileType::Directory {
            // Rewriting `..` moves its reference from the old parent to
            // the new one; `unlinki`/`linki` adjust each parent's own
            // nlink as a side effect.
            unlinki(fs, bcache, icache, idx, "..")?;
            linki(fs, bcache, icache, idx, "..", new_dir_inum)?;
        }
        let _ = old_dir_inum;
        icache.iput(bcache, fs, idx, inum)?;
    }
    Ok(())
}
