//! Crate-wide error type.
//!
//! Groups the six kinds of failure named by the error-handling design:
//! resource exhaustion, lookup, type mismatch, state, I/O, and validation.
//! Internal APIs return `Result<T, Error>`; the classical negative-sentinel
//! convention is only surfaced at the `mkfs`/`fsck` process-exit boundary.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // -- resource exhaustion --
    #[error("no free buffers")]
    NoFreeBuffers,
    #[error("no free inodes")]
    NoFreeInodes,
    #[error("no free blocks")]
    NoFreeBlocks,
    #[error("no free file-table entries")]
    NoFreeFileTableEntries,
    #[error("no free descriptors")]
    NoFreeDescriptors,
    #[error("no free superblock slots")]
    NoFreeSuperblocks,

    // -- lookup --
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("path component name too long")]
    NameTooLong,

    // -- type mismatch --
    #[error("is a directory")]
    IsADirectory,
    #[error("inappropriate file type for operation")]
    WrongFileType,

    // -- state --
    #[error("file already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("filesystem busy")]
    FilesystemBusy,
    #[error("not a mount point")]
    NotMounted,
    #[error("already a mount point")]
    AlreadyMounted,
    #[error("cross-device link")]
    CrossDevice,

    // -- I/O --
    #[error("device I/O error: {0}")]
    Io(String),

    // -- validation --
    #[error("bad superblock magic")]
    BadMagic,
    #[error("invalid inode type")]
    InvalidInodeType,
    #[error("free-block bitmap is inconsistent")]
    BitmapInconsistent,
    #[error("file offset exceeds maximum file size")]
    FileTooLarge,

    // -- descriptor-level --
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    InvalidArgument,
}

impl Error {
    /// The classical non-negative-on-success / negative-on-error convention
    /// used by the VFS surface (`open` returns a descriptor, `read`/`write`
    /// return a byte count, everything else is a small negative sentinel on
    /// failure). Used only by the `mkfs`/`fsck` binaries' exit codes.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoFreeBuffers
            | Error::NoFreeInodes
            | Error::NoFreeBlocks
            | Error::NoFreeFileTableEntries
            | Error::NoFreeDescriptors
            | Error::NoFreeSuperblocks => -1,
            Error::NotFound => -2,
            Error::NotADirectory => -3,
            Error::NameTooLong => -4,
            Error::IsADirectory => -5,
            Error::WrongFileType => -6,
            Error::AlreadyExists => -7,
            Error::DirectoryNotEmpty => -8,
            Error::FilesystemBusy => -9,
            Error::NotMounted => -10,
            Error::AlreadyMounted => -11,
            Error::CrossDevice => -12,
            Error::Io(_) => -13,
            Error::BadMagic => -14,
            Error::InvalidInodeType => -15,
            Error::BitmapInconsistent => -16,
            Error::FileTooLarge => -17,
            Error::BadFd => -18,
            Error::InvalidArgument => -19,
        }
    }
}
