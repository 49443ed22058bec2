//! The block allocator (§4.2): a per-superblock free-block cache refilled
//! by scanning the on-disk bitmap, protected by the superblock's own
//! lock (`SBLOCKBUSY`).

use std::sync::Arc;

use log::warn;

use crate::bcache::{Bcache, Buf};
use crate::error::{Error, Result};
use crate::fs::superblock::FsSuperblock;
use crate::param::{BLOCKSIZE, FREE_CACHE_CAP};

const BITS_PER_BLOCK: u32 = BLOCKSIZE as u32 * 8;

fn bitmap_block(sb_start: u32, block: u32) -> u32 {
    sb_start + block / BITS_PER_BLOCK
}

fn bit_test(byte: u8, bit: u32) -> bool {
    byte & (1 << (bit % 8)) != 0
}

/// Allocates a freshly zeroed data block, returning it busy in the buffer
/// cache.
pub fn balloc(fs: &FsSuperblock, bcache: &Arc<Bcache>) -> Result<Buf> {
    let blockno = alloc_index(fs, bcache)?;
    let buf = bcache.getblk(fs.dev, blockno)?;
    bcache.zero(&buf);
    bcache.mark_dwrite(&buf);
    Ok(buf)
}

fn alloc_index(fs: &FsSuperblock, bcache: &Arc<Bcache>) -> Result<u32> {
    let mut state = fs.state.lock().unwrap();
    loop {
        if let Some(idx) = state.free_blocks.cached.pop() {
            drop(state);
            set_bit(fs, bcache, idx, true)?;
            return Ok(idx);
        }
        refill_free_blocks(fs, bcache, &mut state)?;
        if state.free_blocks.cached.is_empty() {
            warn!("balloc: no free blocks on fs {}", fs.fs_id);
            return Err(Error::NoFreeBlocks);
        }
    }
}

fn refill_free_blocks(
    fs: &FsSuperblock,
    bcache: &Arc<Bcache>,
    state: &mut std::sync::MutexGuard<'_, crate::fs::superblock::SuperblockState>,
) -> Result<()> {
    let nblocks = state.on_disk.nblocks;
    let first = state.on_disk.first_data_block;
    let bmap_start = state.on_disk.block_bitmap_start;
    let mut scanned = state.free_blocks.scan_cursor.max(first);
    let mut found = Vec::new();
    // Pre-read bitmap blocks pairwise, per the component design.
    let mut cur_bitmap_block = u32::MAX;
    let mut cur_bytes: Option<[u8; BLOCKSIZE]> = None;
    while scanned < nblocks && found.len() < FREE_CACHE_CAP {
        let bb = bitmap_block(bmap_start, scanned);
        if bb != cur_bitmap_block {
            let buf = bcache.breada(fs.dev, bb, bb + 1)?;
            let mut raw = [0u8; BLOCKSIZE];
            bcache.read(&buf, 0, &mut raw);
            bcache.brelse(buf);
            cur_bytes = Some(raw);
            cur_bitmap_block = bb;
        }
        let byte_idx = ((scanned % BITS_PER_BLOCK) / 8) as usize;
        let byte = cur_bytes.as_ref().unwrap()[byte_idx];
        if !bit_test(byte, scanned) {
            found.push(scanned);
        }
        scanned += 1;
    }
    state.free_blocks.scan_cursor = scanned;
    for idx in found {
        // Safe: capacity bounded by FREE_CACHE_CAP above.
        let _ = state.free_blocks.cached.try_push(idx);
    }
    if scanned >= nblocks {
        state.free_blocks.scan_cursor = first;
    }
    Ok(())
}

fn set_bit(fs: &FsSuperblock, bcache: &Arc<Bcache>, block: u32, set: bool) -> Result<()> {
    let bmap_start = { fs.state.lock().unwrap().on_disk.block_bitmap_start };
    let bb = bitmap_block(bmap_start, block);
    let buf = bcache.bread(fs.dev, bb)?;
    let byte_idx = ((block % BITS_PER_BLOCK) / 8) as usize;
    let mut raw = [0u8; BLOCKSIZE];
    bcache.read(&buf, 0, &mut raw);
    let mask = 1u8 << (block % 8);
    let was_set = raw[byte_idx] & mask != 0;
    if set == was_set {
        bcache.brelse(buf);
        return if set {
            Err(Error::BitmapInconsistent)
        } else {
            Err(Error::BitmapInconsistent)
        };
    }
    if set {
        raw[byte_idx] |= mask;
    } else {
        raw[byte_idx] &= !mask;
    }
    bcache.write(&buf, byte_idx, &raw[byte_idx..byte_idx + 1]);
    bcache.brelse(buf);
    Ok(())
}

/// Returns a block to the free pool, inserting it into the cache in
/// ascending order so future scans can skip it, then clearing the bitmap
/// bit.
pub fn bfree(fs: &FsSuperblock, bcache: &Arc<Bcache>, block: u32) -> Result<()> {
    set_bit(fs, bcache, block, false)?;
    let mut state = fs.state.lock().unwrap();
    if state.free_blocks.cached.len() < FREE_CACHE_CAP {
        let pos = state
            .free_blocks
            .cached
            .iter()
            .position(|&b| b > block)
            .unwrap_or(state.free_blocks.cached.len());
        let _ = state.free_blocks.cached.try_insert(pos, block);
    }
    Ok(())
}
