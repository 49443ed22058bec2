//! The buffer cache (§4.1).
//!
//! `getblk` implements the four-step algorithm from the component design
//! exactly: search the hash table; if busy, sleep on `BLOCKBUSY`; if not
//! found, take the head of the free list (sleeping on `NOFREEBLOCKS` if
//! it's empty); if that buffer carries a delayed write, flush it and
//! retry; otherwise rehash it for the new `(dev, block)` and return it
//! busy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::block_dev::{BlockDevice, IoOutcome};
use crate::error::{Error, Result};
use crate::param::BLOCKSIZE;
use crate::slab::Slab;
use crate::waitchannel::WaitChannel;

/// Registry mapping a logical device id to the driver that backs it.
#[derive(Default)]
pub struct DeviceTable {
    devices: Mutex<HashMap<u32, Arc<dyn BlockDevice>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dev: u32, device: Arc<dyn BlockDevice>) {
        self.devices.lock().unwrap().insert(dev, device);
    }

    pub fn unregister(&self, dev: u32) {
        self.devices.lock().unwrap().remove(&dev);
    }

    fn get(&self, dev: u32) -> Option<Arc<dyn BlockDevice>> {
        self.devices.lock().unwrap().get(&dev).cloned()
    }
}

pub struct BufPayload {
    pub valid: bool,
    pub error: bool,
    pub dwrite: bool,
    pub data: [u8; BLOCKSIZE],
}

impl BufPayload {
    fn new() -> Self {
        Self {
            valid: false,
            error: false,
            dwrite: false,
            data: [0u8; BLOCKSIZE],
        }
    }
}

type BufKey = (u32, u32);

pub struct Bcache {
    devices: Arc<DeviceTable>,
    inner: Mutex<Slab<BufKey, BufPayload>>,
    block_busy: WaitChannel,
    no_free_blocks: WaitChannel,
}

/// A busy buffer, uniquely reserved for its `(dev, block)`. Released
/// automatically on drop (`brelse`) if the caller doesn't release it
/// explicitly first.
pub struct Buf {
    idx: usize,
    dev: u32,
    block: u32,
    released: bool,
}

impl Buf {
    pub fn block_number(&self) -> u32 {
        self.block
    }
}

impl Bcache {
    pub fn new(nbuf: usize, devices: Arc<DeviceTable>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            inner: Mutex::new(Slab::new(nbuf, BufPayload::new)),
            block_busy: WaitChannel::new(),
            no_free_blocks: WaitChannel::new(),
        })
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Returns a busy buffer reserved for `(dev, block)`; does not ensure
    /// its contents are loaded from disk (use [`Bcache::bread`] for that).
    pub fn getblk(self: &Arc<Self>, dev: u32, block: u32) -> Result<Buf> {
        let key = (dev, block);
        loop {
            let mut g = self.inner.lock().unwrap();
            if let Some(idx) = g.find(&key) {
                if g.slot(idx).busy {
                    g = self.block_busy.sleep(g);
                    continue;
                }
                g.remove_from_free(idx);
                g.slot_mut(idx).busy = true;
                drop(g);
                return Ok(Buf {
                    idx,
                    dev,
                    block,
                    released: false,
                });
            }

            let idx = match g.pop_free_front() {
                Some(idx) => idx,
                None => {
                    g = self.no_free_blocks.sleep(g);
                    continue;
                }
            };

            if g.slot(idx).data.dwrite {
                // Step 3: flush the delayed write, then restart the search.
                let (old_dev, old_block) = g.slot(idx).key.expect("dwrite buffer must be hashed");
                g.slot_mut(idx).busy = true;
                let mut data = g.slot(idx).data.data;
                drop(g);
                let outcome = self.do_io(old_dev, old_block, &mut data, true);
                self.buffer_synced(idx, old_dev, old_block, outcome);
                continue;
            }

            if g.slot(idx).key.is_some() {
                g.unhash(idx);
            }
            g.rehash(idx, key);
            g.slot_mut(idx).data.valid = false;
            g.slot_mut(idx).data.error = false;
            g.slot_mut(idx).busy = true;
            drop(g);
            return Ok(Buf {
                idx,
                dev,
                block,
                released: false,
            });
        }
    }

    /// `getblk` followed by ensuring the content is loaded from disk.
    pub fn bread(self: &Arc<Self>, dev: u32, block: u32) -> Result<Buf> {
        let buf = self.getblk(dev, block)?;
        self.ensure_valid(&buf)?;
        Ok(buf)
    }

    /// `bread(b1)` with a hinted read-ahead on `b2`. The read-ahead is a
    /// hint that may be dropped (per the open question on `breada`'s
    /// historical race): failures on `b2` are ignored.
    pub fn breada(self: &Arc<Self>, dev: u32, b1: u32, b2: u32) -> Result<Buf> {
        if b2 != b1 {
            if let Ok(ahead) = self.getblk(dev, b2) {
                let _ = self.ensure_valid(&ahead);
                self.brelse(ahead);
            }
        }
        self.bread(dev, b1)
    }

    fn ensure_valid(self: &Arc<Self>, buf: &Buf) -> Result<()> {
        {
            let g = self.inner.lock().unwrap();
            if g.slot(buf.idx).data.valid {
                return Ok(());
            }
        }
        let mut data = [0u8; BLOCKSIZE];
        let outcome = self.do_io(buf.dev, buf.block, &mut data, false);
        let mut g = self.inner.lock().unwrap();
        match outcome {
            IoOutcome::Ok => {
                g.slot_mut(buf.idx).data.data = data;
                g.slot_mut(buf.idx).data.valid = true;
                g.slot_mut(buf.idx).data.error = false;
                Ok(())
            }
            IoOutcome::Err => {
                g.slot_mut(buf.idx).data.error = true;
                Err(Error::Io(format!("read failure on block {}", buf.block)))
            }
        }
    }

    fn do_io(&self, dev: u32, block: u32, data: &mut [u8; BLOCKSIZE], is_write: bool) -> IoOutcome {
        let device = match self.devices.get(dev) {
            Some(d) => d,
            None => return IoOutcome::Err,
        };
        let mut outcome = IoOutcome::Err;
        device.strategy(block, data, is_write, &mut |o| outcome = o);
        outcome
    }

    /// Writes the buffer synchronously unless it is marked for delayed
    /// write, in which case writing is deferred to eviction or `sync`.
    pub fn bwrite(&self, buf: &Buf) -> Result<()> {
        let dwrite = { self.inner.lock().unwrap().slot(buf.idx).data.dwrite };
        if dwrite {
            return Ok(());
        }
        let mut data = { self.inner.lock().unwrap().slot(buf.idx).data.data };
        let outcome = self.do_io(buf.dev, buf.block, &mut data, true);
        if outcome == IoOutcome::Err {
            warn!("bwrite: I/O error on dev {} block {}", buf.dev, buf.block);
            return Err(Error::Io(format!("write failure on block {}", buf.block)));
        }
        Ok(())
    }

    /// Marks the buffer dirty; the actual write is deferred to eviction
    /// or the next `sync`.
    pub fn mark_dwrite(&self, buf: &Buf) {
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(buf.idx).data.dwrite = true;
        g.slot_mut(buf.idx).data.valid = true;
    }

    pub fn mark_initialized(&self, buf: &Buf) {
        self.inner.lock().unwrap().slot_mut(buf.idx).data.valid = true;
    }

    /// Reads `len` bytes from the buffer at `offset`.
    pub fn read(&self, buf: &Buf, offset: usize, out: &mut [u8]) {
        let g = self.inner.lock().unwrap();
        out.copy_from_slice(&g.slot(buf.idx).data.data[offset..offset + out.len()]);
    }

    /// Writes `src` into the buffer at `offset` and marks it dirty.
    pub fn write(&self, buf: &Buf, offset: usize, src: &[u8]) {
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(buf.idx).data.data[offset..offset + src.len()].copy_from_slice(src);
        g.slot_mut(buf.idx).data.dwrite = true;
    }

    pub fn zero(&self, buf: &Buf) {
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(buf.idx).data.data = [0u8; BLOCKSIZE];
        g.slot_mut(buf.idx).data.valid = true;
    }

    pub fn with_u32_slice_mut<R>(&self, buf: &Buf, f: impl FnOnce(&mut [u32]) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        let bytes = &mut g.slot_mut(buf.idx).data.data;
        let mut words = [0u32; BLOCKSIZE / 4];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        let r = f(&mut words);
        for (i, w) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        g.slot_mut(buf.idx).data.dwrite = true;
        r
    }

    pub fn with_u32_slice<R>(&self, buf: &Buf, f: impl FnOnce(&[u32]) -> R) -> R {
        let g = self.inner.lock().unwrap();
        let bytes = &g.slot(buf.idx).data.data;
        let mut words = [0u32; BLOCKSIZE / 4];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        f(&words)
    }

    /// Releases a busy buffer back to the free list: the head if its
    /// content is invalid (so it's reused first), the tail otherwise
    /// (LRU).
    pub fn brelse(&self, mut buf: Buf) {
        self.release(&mut buf);
    }

    fn release(&self, buf: &mut Buf) {
        if buf.released {
            return;
        }
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(buf.idx).busy = false;
        let valid = g.slot(buf.idx).data.valid;
        if valid {
            g.push_free_back(buf.idx);
        } else {
            g.push_free_front(buf.idx);
        }
        drop(g);
        buf.released = true;
        self.block_busy.wake_all();
    }

    /// Completes an in-flight I/O: clears `dwrite`; on success marks
    /// `valid`; if the buffer is not presently busy, returns it to the
    /// free list (at the head on error).
    fn buffer_synced(&self, idx: usize, dev: u32, block: u32, outcome: IoOutcome) {
        let mut g = self.inner.lock().unwrap();
        g.slot_mut(idx).data.dwrite = false;
        match outcome {
            IoOutcome::Ok => {
                g.slot_mut(idx).data.valid = true;
                g.slot_mut(idx).data.error = false;
                trace!("buffer_synced: wrote back dev {} block {}", dev, block);
            }
            IoOutcome::Err => {
                g.slot_mut(idx).data.error = true;
                warn!("buffer_synced: write failed for dev {} block {}", dev, block);
            }
        }
        if !g.slot(idx).busy {
            if outcome == IoOutcome::Err {
                g.push_free_front(idx);
            } else {
                g.push_free_back(idx);
            }
        }
        drop(g);
        self.no_free_blocks.wake_all();
    }

    /// Writes back every dirty, valid buffer. Used by `sync` and by
    /// `umount` before releasing a superblock slot.
    pub fn sync_all(&self) {
        let snapshot: Vec<(usize, u32, u32)> = {
            let g = self.inner.lock().unwrap();
            (0..g.len())
                .filter_map(|idx| {
                    let slot = g.slot(idx);
                    if slot.data.dwrite && slot.data.valid {
                        slot.key.map(|(d, b)| (idx, d, b))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (idx, dev, block) in snapshot {
            let mut data = { self.inner.lock().unwrap().slot(idx).data.data };
            let outcome = self.do_io(dev, block, &mut data, true);
            let mut g = self.inner.lock().unwrap();
            if g.slot(idx).key == Some((dev, block)) {
                g.slot_mut(idx).data.dwrite = outcome != IoOutcome::Ok;
            }
        }
    }

    /// Writes back every dirty buffer belonging to `dev` (used by
    /// `umount`).
    pub fn sync_device(&self, dev: u32) {
        let snapshot: Vec<(usize, u32)> = {
            let g = self.inner.lock().unwrap();
            (0..g.len())
                .filter_map(|idx| {
                    let slot = g.slot(idx);
                    match slot.key {
                        Some((d, b)) if d == dev && slot.data.dwrite && slot.data.valid => {
                            Some((idx, b))
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        for (idx, block) in snapshot {
            let mut data = { self.inner.lock().unwrap().slot(idx).data.data };
            let outcome = self.do_io(dev, block, &mut data, true);
            let mut g = self.inner.lock().unwrap();
            if g.slot(idx).key == Some((dev, block)) {
                g.slot_mut(idx).data.dwrite = outcome != IoOutcome::Ok;
            }
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort: a `Buf` dropped without an explicit `brelse`
            // still needs its `busy` flag cleared so the cache doesn't
            // wedge. Callers should prefer explicit `brelse`.
            debug_assert!(
                false,
                "Buf for ({}, {}) dropped without brelse",
                self.dev, self.block
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_dev::MemBlockDevice;

    fn cache(nbuf: usize, nblocks: u32) -> Arc<Bcache> {
        let devices = Arc::new(DeviceTable::new());
        devices.register(0, Arc::new(MemBlockDevice::new(nblocks)));
        Bcache::new(nbuf, devices)
    }

    #[test]
    fn bread_then_brelse_then_bread_returns_same_slot() {
        let bc = cache(4, 8);
        let a = bc.bread(0, 1).unwrap();
        let a_idx = a.idx;
        bc.brelse(a);
        let b = bc.bread(0, 1).unwrap();
        assert_eq!(a_idx, b.idx);
        bc.brelse(b);
    }

    #[test]
    fn write_then_reread_round_trips() {
        let bc = cache(4, 8);
        let buf = bc.getblk(0, 2).unwrap();
        bc.zero(&buf);
        bc.write(&buf, 0, b"EdgeCaseTest");
        bc.bwrite(&buf).unwrap();
        bc.brelse(buf);

        let buf = bc.bread(0, 2).unwrap();
        let mut out = [0u8; 12];
        bc.read(&buf, 0, &mut out);
        bc.brelse(buf);
        assert_eq!(&out, b"EdgeCaseTest");
    }

    #[test]
    fn getblk_on_out_of_range_block_errors() {
        let bc = cache(4, 8);
        assert!(bc.bread(0, 100).is_err());
    }
}
