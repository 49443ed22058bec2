//! Offline tool that lays down a fresh on-disk filesystem image (§6.1).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::info;

use stix_fs::bcache::{Bcache, DeviceTable};
use stix_fs::block_dev::FileBlockDevice;
use stix_fs::fs::icache::Icache;
use stix_fs::fs::superblock::{FsSuperblock, OnDiskSuperblock};
use stix_fs::param::{FsParams, BLOCKSIZE, FSMAGIC};
use stix_fs::vfs::format_root;

#[derive(Parser)]
#[command(name = "mkfs", about = "Create a fresh stix-fs filesystem image")]
struct Args {
    /// Path to the disk image to create (overwritten if it exists).
    image: PathBuf,

    /// Total size of the image, in blocks.
    #[arg(long, default_value_t = 2048)]
    nblocks: u32,

    /// Number of inodes to provision.
    #[arg(long, default_value_t = 256)]
    ninodes: u32,
}

fn run(args: Args) -> stix_fs::Result<()> {
    let device = FileBlockDevice::create(&args.image, args.nblocks)
        .map_err(|e| stix_fs::Error::Io(e.to_string()))?;

    let devices = Arc::new(DeviceTable::new());
    devices.register(0, Arc::new(device));
    let bcache = Bcache::new(FsParams::default().nbuf, devices);

    let inode_blocks = (args.ninodes as usize).div_ceil(stix_fs::fs::dinode::IPB) as u32;
    let inode_table_start = 2; // sector 0: boot block, sector 1: superblock
    let block_bitmap_start = inode_table_start + inode_blocks;
    let bitmap_blocks = (args.nblocks as usize).div_ceil(BLOCKSIZE * 8) as u32;
    let first_data_block = block_bitmap_start + bitmap_blocks;

    if first_data_block >= args.nblocks {
        return Err(stix_fs::Error::InvalidArgument);
    }

    let on_disk = OnDiskSuperblock {
        magic: FSMAGIC,
        fstype: 1,
        version: 1,
        clean: true,
        inode_table_start,
        block_bitmap_start,
        first_data_block,
        ninodes: args.ninodes,
        nblocks: args.nblocks,
    };
    on_disk.write(&bcache, 0)?;

    // Zero the inode table and bitmap region so every slot starts FREE
    // and every bit starts clear.
    for block in inode_table_start..first_data_block {
        let buf = bcache.getblk(0, block)?;
        bcache.zero(&buf);
        bcache.bwrite(&buf)?;
        bcache.brelse(buf);
    }

    let fs = FsSuperblock::new(1, 0, on_disk, &FsParams::default());
    let icache = Icache::new(FsParams::default().ninode);
    icache.register_fs(1, 0, inode_table_start);
    format_root(&fs, &bcache, &icache)?;

    bcache.sync_all();
    info!(
        "mkfs: wrote {} blocks, {} inodes to {}",
        args.nblocks,
        args.ninodes,
        args.image.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mkfs: {}", e);
            ExitCode::from(e.errno().unsigned_abs() as u8)
        }
    }
}
