//! `namei` (§4.5): path resolution across mount points.

use std::sync::Arc;

use crate::bcache::Bcache;
use crate::error::{Error, Result};
use crate::fs::dirent::{Dirent, DIRENT_SIZE};
use crate::fs::icache::Icache;
use crate::fs::mount::{InodeRef, MountTable};
use crate::fs::superblock::FsSuperblock;
use crate::param::{BLOCKSIZE, ROOTINO};
use crate::stat::FileType;

/// The two mounted-filesystem-aware anchors `namei` resolves a path
/// against: the process root and current working directory.
#[derive(Debug, Clone, Copy)]
pub struct PathContext {
    pub root: InodeRef,
    pub cwd: InodeRef,
}

/// Result of a successful lookup: the resolved inode's cache slot and
/// identity, already `iget`'d (refcount held, not locked).
pub struct NameiResult {
    pub fs_id: u32,
    pub inum: u32,
    pub idx: usize,
}

/// Supplies the superblock for a mounted filesystem id, so `namei` can
/// read directory blocks without owning a registry of its own.
pub trait FsLookup {
    fn superblock(&self, fs_id: u32) -> Option<Arc<FsSuperblock>>;
}

/// Walks `path`, honouring `.`/`..` and mount-point redirection, and
/// returns the resolved inode. If `want_parent` is set, stops one
/// component short and returns the parent directory plus the final
/// component's name instead.
pub fn namei(
    bcache: &Arc<Bcache>,
    icache: &Icache,
    mounts: &MountTable,
    fs_lookup: &dyn FsLookup,
    ctx: &PathContext,
    path: &str,
) -> Result<NameiResult> {
    resolve(bcache, icache, mounts, fs_lookup, ctx, path, false).map(|(r, _)| r.unwrap())
}

/// `namei`, stopping short of the final component. Returns the parent
/// directory and the unresolved final component name.
pub fn nameiparent(
    bcache: &Arc<Bcache>,
    icache: &Icache,
    mounts: &MountTable,
    fs_lookup: &dyn FsLookup,
    ctx: &PathContext,
    path: &str,
) -> Result<(NameiResult, String)> {
    let (_, parent) = resolve(bcache, icache, mounts, fs_lookup, ctx, path, true)?;
    let (parent, name) = parent.unwrap();
    Ok((parent, name))
}

#[allow(clippy::type_complexity)]
fn resolve(
    bcache: &Arc<Bcache>,
    icache: &Icache,
    mounts: &MountTable,
    fs_lookup: &dyn FsLookup,
    ctx: &PathContext,
    path: &str,
    want_parent: bool,
) -> Result<(Option<NameiResult>, Option<(NameiResult, String)>)> {
    let mut cur = if path.starts_with('/') {
        iref_to_result(icache, bcache, ctx.root)?
    } else {
        iref_to_result(icache, bcache, ctx.cwd)?
    };

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Ok((Some(cur), None));
    }

    for (i, &name) in components.iter().enumerate() {
        let is_last = i == components.len() - 1;
        crate::fs::dirent::validate_name(name)?;

        if want_parent && is_last {
            return Ok((None, Some((cur, name.to_string()))));
        }

        let ftype = icache.with_inode(cur.idx, |inode| inode.dinode.ftype);
        if ftype != FileType::Directory {
            release(icache, bcache, fs_lookup, &cur);
            return Err(Error::NotADirectory);
        }

        let next = if name == "." {
            clone_result(icache, &cur)
        } else if name == ".." {
            resolve_dotdot(bcache, icache, mounts, fs_lookup, &cur)?
        } else {
            let found = lookup_in_dir(bcache, icache, fs_lookup, &cur, name)?;
            redirect_through_mount(icache, bcache, mounts, fs_lookup, found)?
        };

        release(icache, bcache, fs_lookup, &cur);
        cur = next;
    }

    Ok((Some(cur), None))
}

fn iref_to_result(icache: &Icache, bcache: &Arc<Bcache>, iref: InodeRef) -> Result<NameiResult> {
    let idx = icache.iget(bcache, iref.fs_id, iref.inum)?;
    Ok(NameiResult {
        fs_id: iref.fs_id,
        inum: iref.inum,
        idx,
    })
}

fn clone_result(icache: &Icache, r: &NameiResult) -> NameiResult {
    icache.bump_ref(r.idx);
    NameiResult {
        fs_id: r.fs_id,
        inum: r.inum,
        idx: r.idx,
    }
}

fn release(icache: &Icache, bcache: &Arc<Bcache>, fs_lookup: &dyn FsLookup, r: &NameiResult) {
    if let Some(fs) = fs_lookup.superblock(r.fs_id) {
        let _ = icache.iput(bcache, &fs, r.idx, r.inum);
    }
}

/// Crossing `..`: if `cur` is the root of a mounted filesystem (not the
/// global root), step out to the inode it covers in its parent
/// filesystem first, per the component design.
fn resolve_dotdot(
    bcache: &Arc<Bcache>,
    icache: &Icache,
    mounts: &MountTable,
    fs_lookup: &dyn FsLookup,
    cur: &NameiResult,
) -> Result<NameiResult> {
    if cur.inum == ROOTINO {
        if let Some(covering) = mounts.covering_inode(cur.fs_id) {
            return iref_to_result(icache, bcache, covering);
        }
        // Global root's `..` is itself.
        return Ok(clone_result(icache, cur));
    }
    let found = lookup_in_dir(bcache, icache, fs_lookup, cur, "..")?;
    Ok(found)
}

/// Scans directory `dir` for `name`, returning its inode.
fn lookup_in_dir(
    bcache: &Arc<Bcache>,
    icache: &Icache,
    fs_lookup: &dyn FsLookup,
    dir: &NameiResult,
    name: &str,
) -> Result<NameiResult> {
    let fs = fs_lookup.superblock(dir.fs_id).ok_or(Error::NotMounted)?;
    let size = icache.with_inode(dir.idx, |inode| inode.dinode.size);
    let nblocks = (size as usize).div_ceil(BLOCKSIZE);
    for block_idx in 0..nblocks {
        let blockno = crate::fs::bmap::bmap(&fs, bcache, icache, dir.idx, block_idx as u64)?;
        let buf = bcache.bread(fs.dev, blockno)?;
        let mut raw = [0u8; BLOCKSIZE];
        bcache.read(&buf, 0, &mut raw);
        bcache.brelse(buf);
        for entry in raw.chunks_exact(DIRENT_SIZE) {
            let dirent = Dirent::from_bytes(entry);
            if !dirent.is_unused() && dirent.name_matches(name) {
                let idx = icache.iget(bcache, dir.fs_id, dirent.inum as u32)?;
                return Ok(NameiResult {
                    fs_id: dir.fs_id,
                    inum: dirent.inum as u32,
                    idx,
                });
            }
        }
    }
    Err(Error::NotFound)
}

/// If the looked-up inode is itself a mount point, substitutes the
/// mounted filesystem's root inode instead.
fn redirect_through_mount(
    icache: &Icache,
    bcache: &Arc<Bcache>,
    mounts: &MountTable,
    fs_lookup: &dyn FsLookup,
    found: NameiResult,
) -> Result<NameiResult> {
    let covered = InodeRef {
        fs_id: found.fs_id,
        inum: found.inum,
    };
    match mounts.mounted_on(covered) {
        Some(mounted_fs) => {
            let root = InodeRef {
                fs_id: mounted_fs,
                inum: ROOTINO,
            };
            let redirected = iref_to_result(icache, bcache, root)?;
            release(icache, bcache, fs_lookup, &found);
            Ok(redirected)
        }
        None => Ok(found),
    }
}
