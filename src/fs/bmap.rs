//! `bmap` (§4.4): maps a logical file block index to a physical block
//! number, allocating direct and indirect blocks on demand.

use std::sync::Arc;

use crate::bcache::Bcache;
use crate::error::{Error, Result};
use crate::fs::balloc::balloc;
use crate::fs::icache::Icache;
use crate::fs::superblock::FsSuperblock;
use crate::param::{IDX_DOUBLE, IDX_SINGLE, MAXFILE_BLOCKS, NDIRECT, NINDIRECT};

/// Returns the physical block backing logical block `bn` of the inode at
/// `idx`, allocating it (and any indirect blocks along the way) if it
/// does not yet exist.
pub fn bmap(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    idx: usize,
    bn: u64,
) -> Result<u32> {
    if bn >= MAXFILE_BLOCKS {
        return Err(Error::FileTooLarge);
    }

    if bn < NDIRECT as u64 {
        let slot = bn as usize;
        let existing = icache.with_inode(idx, |inode| inode.dinode.addrs[slot]);
        if existing != 0 {
            return Ok(existing);
        }
        let buf = balloc(fs, bcache)?;
        let allocated = buf_block(&buf);
        bcache.brelse(buf);
        icache.with_inode_mut(idx, |inode| inode.dinode.addrs[slot] = allocated);
        return Ok(allocated);
    }

    let bn = bn - NDIRECT as u64;
    if bn < NINDIRECT as u64 {
        return bmap_indirect(fs, bcache, icache, idx, IDX_SINGLE, bn as usize);
    }

    let bn = bn - NINDIRECT as u64;
    let outer_slot = (bn / NINDIRECT as u64) as usize;
    let inner_slot = (bn % NINDIRECT as u64) as usize;
    bmap_double_indirect(fs, bcache, icache, idx, IDX_DOUBLE, outer_slot, inner_slot)
}

fn buf_block(buf: &crate::bcache::Buf) -> u32 {
    buf.block_number()
}

/// Releases every data block and indirect block owned by the inode at
/// `idx` and resets its size to zero. Used when an inode's link count
/// and reference count both reach zero.
pub fn itrunc(fs: &FsSuperblock, bcache: &Arc<Bcache>, icache: &Icache, idx: usize) -> Result<()> {
    use crate::fs::balloc::bfree;

    let addrs = icache.with_inode(idx, |inode| inode.dinode.addrs);

    for &addr in &addrs[..NDIRECT] {
        if addr != 0 {
            bfree(fs, bcache, addr)?;
        }
    }

    if addrs[IDX_SINGLE] != 0 {
        free_indirect_block(fs, bcache, addrs[IDX_SINGLE])?;
        bfree(fs, bcache, addrs[IDX_SINGLE])?;
    }

    if addrs[IDX_DOUBLE] != 0 {
        let buf = bcache.bread(fs.dev, addrs[IDX_DOUBLE])?;
        let outer_entries: Vec<u32> = bcache.with_u32_slice(&buf, |words| words.to_vec());
        bcache.brelse(buf);
        for entry in outer_entries {
            if entry != 0 {
                free_indirect_block(fs, bcache, entry)?;
                bfree(fs, bcache, entry)?;
            }
        }
        bfree(fs, bcache, addrs[IDX_DOUBLE])?;
    }

    icache.with_inode_mut(idx, |inode| {
        inode.dinode.addrs = [0; crate::param::NADDRS];
        inode.dinode.size = 0;
    });
    Ok(())
}

fn free_indirect_block(fs: &FsSuperblock, bcache: &Arc<Bcache>, indirect_block: u32) -> Result<()> {
    use crate::fs::balloc::bfree;

    let buf = bcache.bread(fs.dev, indirect_block)?;
    let entries: Vec<u32> = bcache.with_u32_slice(&buf, |words| words.to_vec());
    bcache.brelse(buf);
    for entry in entries {
        if entry != 0 {
            bfree(fs, bcache, entry)?;
        }
    }
    Ok(())
}

/// Resolves one level of indirection rooted at `addrs[root_slot]`,
/// allocating the indirect block itself if absent, then the target
/// block at `entry` within it.
fn bmap_indirect(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    idx: usize,
    root_slot: usize,
    entry: usize,
) -> Result<u32> {
    let indirect_block = ensure_indirect_block(fs, bcache, icache, idx, root_slot)?;
    read_or_alloc_entry(fs, bcache, indirect_block, entry)
}

fn bmap_double_indirect(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    idx: usize,
    root_slot: usize,
    outer_slot: usize,
    inner_slot: usize,
) -> Result<u32> {
    let outer_block = ensure_indirect_block(fs, bcache, icache, idx, root_slot)?;
    let inner_root = ensure_indirect_entry(fs, bcache, outer_block, outer_slot)?;
    read_or_alloc_entry(fs, bcache, inner_root, inner_slot)
}

fn ensure_indirect_block(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    icache: &Icache,
    idx: usize,
    root_slot: usize,
) -> Result<u32> {
    let existing = icache.with_inode(idx, |inode| inode.dinode.addrs[root_slot]);
    if existing != 0 {
        return Ok(existing);
    }
    let buf = balloc(fs, bcache)?;
    let allocated = buf_block(&buf);
    bcache.brelse(buf);
    icache.with_inode_mut(idx, |inode| inode.dinode.addrs[root_slot] = allocated);
    Ok(allocated)
}

fn ensure_indirect_entry(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    indirect_block: u32,
    entry: usize,
) -> Result<u32> {
    read_or_alloc_entry(fs, bcache, indirect_block, entry)
}

/// Reads entry `entry` of the indirect block `indirect_block`,
/// allocating and writing back a new block if the entry is empty.
fn read_or_alloc_entry(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    indirect_block: u32,
    entry: usize,
) -> Result<u32> {
    let buf = bcache.bread(fs.dev, indirect_block)?;
    let existing = bcache.with_u32_slice(&buf, |words| words[entry]);
    if existing != 0 {
        bcache.brelse(buf);
        return Ok(existing);
    }
    bcache.brelse(buf);
    let data_buf = balloc(fs, bcache)?;
    let allocated = buf_block(&data_buf);
    bcache.brelse(data_buf);
    let buf = bcache.bread(fs.dev, indirect_block)?;
    bcache.with_u32_slice_mut(&buf, |words| words[entry] = allocated);
    bcache.brelse(buf);
    Ok(allocated)
}
