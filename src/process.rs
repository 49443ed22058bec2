//! The per-process user area (§3 "Per-process user area", §6.3): root
//! and working-directory inodes plus a fixed descriptor array.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::filetable::FileHandle;
use crate::fs::mount::InodeRef;
use crate::fs::path::PathContext;

/// What the VFS layer needs from "the current process": its path
/// context and a descriptor table it can allocate/release into. Kept as
/// a trait (§6.3) so the core doesn't depend on any particular
/// scheduler or process representation.
pub trait ProcessView {
    fn path_context(&self) -> PathContext;
    fn set_cwd(&self, cwd: InodeRef);
    fn set_root(&self, root: InodeRef);
    fn alloc_fd(&self, handle: FileHandle) -> Result<u32>;
    fn fd(&self, fd: u32) -> Result<FileHandle>;
    fn free_fd(&self, fd: u32) -> Result<FileHandle>;
    fn dup_fd(&self, fd: u32) -> Result<(u32, FileHandle)>;
}

struct ProcessState {
    root: InodeRef,
    cwd: InodeRef,
    descriptors: Vec<Option<FileHandle>>,
}

/// A plain, thread-safe process handle: the hosted re-implementation's
/// stand-in for a PCB's user area.
pub struct Process {
    state: Mutex<ProcessState>,
}

impl Process {
    pub fn new(nofile: usize, root: InodeRef, cwd: InodeRef) -> Self {
        Self {
            state: Mutex::new(ProcessState {
                root,
                cwd,
                descriptors: vec![None; nofile],
            }),
        }
    }
}

impl ProcessView for Process {
    fn path_context(&self) -> PathContext {
        let state = self.state.lock().unwrap();
        PathContext {
            root: state.root,
            cwd: state.cwd,
        }
    }

    fn set_cwd(&self, cwd: InodeRef) {
        self.state.lock().unwrap().cwd = cwd;
    }

    fn set_root(&self, root: InodeRef) {
        self.state.lock().unwrap().root = root;
    }

    fn alloc_fd(&self, handle: FileHandle) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .descriptors
            .iter()
            .position(|d| d.is_none())
            .ok_or(Error::NoFreeDescriptors)?;
        state.descriptors[slot] = Some(handle);
        Ok(slot as u32)
    }

    fn fd(&self, fd: u32) -> Result<FileHandle> {
        self.state
            .lock()
            .unwrap()
            .descriptors
            .get(fd as usize)
            .and_then(|d| *d)
            .ok_or(Error::BadFd)
    }

    fn free_fd(&self, fd: u32) -> Result<FileHandle> {
        let mut state = self.state.lock().unwrap();
        let slot = state.descriptors.get_mut(fd as usize).ok_or(Error::BadFd)?;
        slot.take().ok_or(Error::BadFd)
    }

    fn dup_fd(&self, fd: u32) -> Result<(u32, FileHandle)> {
        let mut state = self.state.lock().unwrap();
        let handle = state.descriptors.get(fd as usize).and_then(|d| *d).ok_or(Error::BadFd)?;
        let slot = state
            .descriptors
            .iter()
            .position(|d| d.is_none())
            .ok_or(Error::NoFreeDescriptors)?;
        state.descriptors[slot] = Some(handle);
        Ok((slot as u32, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> InodeRef {
        InodeRef { fs_id: 1, inum: 1 }
    }

    #[test]
    fn fd_alloc_reuses_freed_slots() {
        let proc = Process::new(2, root(), root());
        let a = proc.alloc_fd(FileHandle(10)).unwrap();
        let b = proc.alloc_fd(FileHandle(20)).unwrap();
        assert_ne!(a, b);
        proc.free_fd(a).unwrap();
        let c = proc.alloc_fd(FileHandle(30)).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn exhausting_descriptors_errors() {
        let proc = Process::new(1, root(), root());
        proc.alloc_fd(FileHandle(1)).unwrap();
        assert!(matches!(proc.alloc_fd(FileHandle(2)), Err(Error::NoFreeDescriptors)));
    }

    #[test]
    fn chdir_updates_path_context() {
        let proc = Process::new(2, root(), root());
        let new_cwd = InodeRef { fs_id: 1, inum: 5 };
        proc.set_cwd(new_cwd);
        assert_eq!(proc.path_context().cwd, new_cwd);
        assert_eq!(proc.path_context().root, root());
    }
}
