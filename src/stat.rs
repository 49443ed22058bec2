//! File type and `stat` metadata, shared between on-disk inodes and the
//! `stat`/`fstat` VFS entry points.

/// File type, stored in the on-disk inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    /// Unused inode slot.
    Free = 0,
    Regular = 1,
    Directory = 2,
    Character = 3,
    Block = 4,
    Fifo = 5,
    /// Recognized but not otherwise interpreted by this core.
    Unspec = 6,
}

impl FileType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Free,
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::Character,
            4 => Self::Block,
            5 => Self::Fifo,
            6 => Self::Unspec,
            _ => return None,
        })
    }
}

/// Metadata returned by `stat`/`fstat`.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub ftype: FileType,
    pub nlink: u16,
    pub size: u64,
    pub uid: u16,
    pub gid: u16,
    pub mode: u16,
    pub mtime: u32,
}
