//! stix-fs: a hosted re-implementation of a classical Unix file-system core.
//!
//! Layered bottom-up, mirroring the on-disk format's own layering:
//!   + `block_dev`: the async block-device contract.
//!   + `bcache`: the buffer cache.
//!   + `fs::balloc` / `fs::icache`: block and inode allocators.
//!   + `fs::bmap`: file-offset to block-number mapping.
//!   + `fs::path`: `namei`, the path resolver.
//!   + `filetable` / `process`: the open-file table and per-process descriptors.
//!   + `vfs`: the syscall-shaped entry points tying everything together.

pub mod bcache;
pub mod block_dev;
pub mod cdev;
pub mod clist;
pub mod error;
pub mod filetable;
pub mod fs;
pub mod param;
pub mod process;
pub mod slab;
pub mod stat;
pub mod vfs;
pub mod waitchannel;

pub use error::{Error, Result};
