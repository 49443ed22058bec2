//! The character list (§4.10): a fixed pool of 16-byte nodes chained
//! into per-device FIFO byte queues, the buffering primitive underneath
//! character devices.

use std::sync::Mutex;

use crate::error::{Error, Result};

const NODE_CAPACITY: usize = 16;

struct ClistNode {
    data: [u8; NODE_CAPACITY],
    len: u8,
    read_pos: u8,
    next: Option<usize>,
}

struct ClistPoolState {
    nodes: Vec<ClistNode>,
    free: Vec<usize>,
}

/// A fixed arena of 16-byte nodes shared by every [`Clist`] built from
/// this pool.
pub struct ClistPool {
    state: Mutex<ClistPoolState>,
}

impl ClistPool {
    pub fn new(capacity: usize) -> Self {
        let nodes = (0..capacity)
            .map(|_| ClistNode {
                data: [0; NODE_CAPACITY],
                len: 0,
                read_pos: 0,
                next: None,
            })
            .collect();
        Self {
            state: Mutex::new(ClistPoolState {
                nodes,
                free: (0..capacity).rev().collect(),
            }),
        }
    }
}

/// A FIFO byte queue over a shared [`ClistPool`]: head/tail indices into
/// the pool's node arena.
pub struct Clist<'a> {
    pool: &'a ClistPool,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<'a> Clist<'a> {
    pub fn new(pool: &'a ClistPool) -> Self {
        Self {
            pool,
            head: None,
            tail: None,
        }
    }

    /// Appends a byte, allocating a new tail node from the pool if the
    /// current tail is full.
    pub fn put(&mut self, byte: u8) -> Result<()> {
        let mut state = self.pool.state.lock().unwrap();
        let need_new_node = match self.tail {
            Some(idx) => state.nodes[idx].len as usize == NODE_CAPACITY,
            None => true,
        };
        if need_new_node {
            let idx = state.free.pop().ok_or(Error::NoFreeBuffers)?;
            state.nodes[idx] = ClistNode {
                data: [0; NODE_CAPACITY],
                len: 0,
                read_pos: 0,
                next: None,
            };
            if let Some(tail) = self.tail {
                state.nodes[tail].next = Some(idx);
            } else {
                self.head = Some(idx);
            }
            self.tail = Some(idx);
        }
        let tail = self.tail.unwrap();
        let node = &mut state.nodes[tail];
        node.data[node.len as usize] = byte;
        node.len += 1;
        Ok(())
    }

    /// Pops the next byte, recycling the head node back to the pool
    /// once it's fully drained.
    pub fn get(&mut self) -> Option<u8> {
        let mut state = self.pool.state.lock().unwrap();
        let head = self.head?;
        let byte = {
            let node = &mut state.nodes[head];
            let byte = node.data[node.read_pos as usize];
            node.read_pos += 1;
            byte
        };
        if state.nodes[head].read_pos == state.nodes[head].len {
            let next = state.nodes[head].next;
            self.head = next;
            if next.is_none() {
                self.tail = None;
            }
            state.free.push(head);
        }
        Some(byte)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved_across_node_boundary() {
        let pool = ClistPool::new(4);
        let mut clist = Clist::new(&pool);
        let bytes: Vec<u8> = (0..40).collect();
        for &b in &bytes {
            clist.put(b).unwrap();
        }
        let mut out = Vec::new();
        while let Some(b) = clist.get() {
            out.push(b);
        }
        assert_eq!(out, bytes);
        assert!(clist.is_empty());
    }

    #[test]
    fn pool_exhaustion_errors_rather_than_blocking() {
        let pool = ClistPool::new(1);
        let mut a = Clist::new(&pool);
        let mut b = Clist::new(&pool);
        for _ in 0..NODE_CAPACITY {
            a.put(1).unwrap();
        }
        assert!(b.put(2).is_err());
    }
}
