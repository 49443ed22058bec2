//! End-to-end scenario tests driving the whole stack (buffer cache,
//! inode cache, allocators, `namei`, VFS surface) through an in-memory
//! block device, no real disk involved.

use std::sync::Arc;

use stix_fs::block_dev::MemBlockDevice;
use stix_fs::filetable::OpenFlags;
use stix_fs::fs::dirent::DIRENT_SIZE;
use stix_fs::fs::mount::InodeRef;
use stix_fs::param::{FsParams, ROOTINO};
use stix_fs::process::{Process, ProcessView};
use stix_fs::stat::FileType;
use stix_fs::vfs::Vfs;
use stix_fs::Error;

fn small_params() -> FsParams {
    FsParams {
        nbuf: 32,
        ninode: 32,
        nfile: 16,
        nofile: 16,
        nsuperblock: 4,
    }
}

fn fresh_vfs_and_process(dev: u32, nblocks: u32, ninodes: u32) -> (Vfs, Process) {
    let vfs = Vfs::new(small_params());
    vfs.register_device(dev, Arc::new(MemBlockDevice::new(nblocks)));
    let fs_id = vfs.mkfs_and_mount(dev, nblocks, ninodes, None).unwrap();
    let root = InodeRef { fs_id, inum: ROOTINO };
    let proc = Process::new(small_params().nofile, root, root);
    (vfs, proc)
}

#[test]
fn scenario_1_fresh_mkfs_and_mount() {
    let (vfs, proc) = fresh_vfs_and_process(0, 128, 64);
    let stat = vfs.stat(&proc, "/").unwrap();
    assert_eq!(stat.ftype, FileType::Directory);
    assert_eq!(stat.nlink, 2);
    assert_eq!(stat.size, 2 * DIRENT_SIZE as u64);
}

#[test]
fn scenario_2_write_then_read_a_string() {
    let (vfs, proc) = fresh_vfs_and_process(0, 128, 64);
    vfs.mkdir(&proc, "/t").unwrap();

    // A freshly created subdirectory is referenced by its own `.` entry
    // and by the parent's entry naming it: nlink must be 2, not 1.
    let t_stat = vfs.stat(&proc, "/t").unwrap();
    assert_eq!(t_stat.nlink, 2);

    let fd = vfs
        .open(&proc, "/t/f", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    let written = vfs.write(&proc, fd, b"Hello World\0").unwrap();
    assert_eq!(written, 12);
    vfs.close(&proc, fd).unwrap();

    let fd = vfs.open(&proc, "/t/f", OpenFlags::READ | OpenFlags::WRITE).unwrap();
    let mut buf = [0u8; 12];
    let n = vfs.read(&proc, fd, &mut buf).unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf, b"Hello World\0");
    vfs.close(&proc, fd).unwrap();

    vfs.unlink(&proc, "/t/f").unwrap();
    vfs.rmdir(&proc, "/t").unwrap();
}

#[test]
fn scenario_3_fill_then_free() {
    // A tiny filesystem: just enough data blocks to exhaust quickly.
    let (vfs, proc) = fresh_vfs_and_process(0, 20, 16);

    let fd = vfs
        .open(&proc, "/f", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    let chunk = [0x41u8; 512];
    let mut exhausted = false;
    for _ in 0..64 {
        match vfs.write(&proc, fd, &chunk) {
            Ok(_) => continue,
            Err(Error::NoFreeBlocks) => {
                exhausted = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(exhausted, "expected the tiny filesystem to run out of blocks");
    vfs.close(&proc, fd).unwrap();
    vfs.unlink(&proc, "/f").unwrap();

    // Blocks freed by the unlink above must be available again.
    let fd = vfs
        .open(&proc, "/g", OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE)
        .unwrap();
    vfs.write(&proc, fd, b"Hello World\0").unwrap();
    vfs.close(&proc, fd).unwrap();
}

#[test]
fn scenario_5_mount_busy() {
    let vfs = Vfs::new(small_params());
    vfs.register_device(0, Arc::new(MemBlockDevice::new(128)));
    vfs.register_device(1, Arc::new(MemBlockDevice::new(64)));
    let root_fs = vfs.mkfs_and_mount(0, 128, 64, None).unwrap();
    let root = InodeRef { fs_id: root_fs, inum: ROOTINO };
    let proc = Process::new(small_params().nofile, root, root);
    vfs.mkdir(&proc, "/mnt1").unwrap();
    let mnt_dir = vfs.stat(&proc, "/mnt1").unwrap();
    let covered = InodeRef { fs_id: root_fs, inum: mnt_dir.ino };

    let mounted_fs = vfs.mkfs_and_mount(1, 64, 32, Some(covered)).unwrap();

    let fd = vfs
        .open(&proc, "/mnt1/x", OpenFlags::CREATE | OpenFlags::WRITE)
        .unwrap();
    assert!(matches!(vfs.umount(mounted_fs), Err(Error::FilesystemBusy)));
    vfs.close(&proc, fd).unwrap();
    vfs.umount(mounted_fs).unwrap();
}

#[test]
fn scenario_6_path_traversal_over_mount() {
    let vfs = Vfs::new(small_params());
    vfs.register_device(0, Arc::new(MemBlockDevice::new(128)));
    vfs.register_device(1, Arc::new(MemBlockDevice::new(64)));
    let root_fs = vfs.mkfs_and_mount(0, 128, 64, None).unwrap();
    let root = InodeRef { fs_id: root_fs, inum: ROOTINO };
    let proc = Process::new(small_params().nofile, root, root);
    vfs.mkdir(&proc, "/mnt1").unwrap();
    let mnt_dir = vfs.stat(&proc, "/mnt1").unwrap();
    let covered = InodeRef { fs_id: root_fs, inum: mnt_dir.ino };

    let mounted_fs = vfs.mkfs_and_mount(1, 64, 32, Some(covered)).unwrap();

    // `namei("/mnt1")` must land on the mounted filesystem's root, not
    // the covered directory itself.
    let mounted_root = vfs.stat(&proc, "/mnt1").unwrap();
    assert_eq!(mounted_root.dev, 1);
    assert_eq!(mounted_root.ino, ROOTINO);

    // `..` from the mounted root steps back to the covered directory in
    // the outer filesystem.
    proc.set_cwd(InodeRef { fs_id: mounted_fs, inum: ROOTINO });
    let parent = vfs.stat(&proc, "..").unwrap();
    assert_eq!(parent.dev, 0);
    assert_eq!(parent.ino, mnt_dir.ino);
}

#[test]
fn scenario_7_mkfs_then_fsck_reports_clean() {
    use std::process::Command;

    let dir = std::env::temp_dir().join(format!("stix-fs-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let image = dir.join("disk.img");

    let mkfs = Command::new(env!("CARGO_BIN_EXE_mkfs"))
        .arg(&image)
        .arg("--nblocks")
        .arg("128")
        .arg("--ninodes")
        .arg("64")
        .status()
        .unwrap();
    assert!(mkfs.success());

    let fsck = Command::new(env!("CARGO_BIN_EXE_fsck")).arg(&image).status().unwrap();
    assert!(fsck.success());

    let _ = std::fs::remove_dir_all(&dir);
}
