//! Offline consistency checker and repair tool (§6.1, scenario 7).
//!
//! Walks the on-disk image directly through the buffer cache, without
//! going through `Icache`/`Vfs`: fsck has to tolerate exactly the kind
//! of inconsistency those layers assume can't happen.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};

use stix_fs::bcache::{Bcache, DeviceTable};
use stix_fs::block_dev::FileBlockDevice;
use stix_fs::fs::dinode::{Dinode, DINODE_SIZE, IPB};
use stix_fs::fs::superblock::OnDiskSuperblock;
use stix_fs::param::{BLOCKSIZE, IDX_DOUBLE, IDX_SINGLE, NDIRECT, ROOTINO};
use stix_fs::stat::FileType;

#[derive(Parser)]
#[command(name = "fsck", about = "Check and repair a stix-fs filesystem image")]
struct Args {
    /// Path to the disk image to check.
    image: PathBuf,

    /// Write repairs back to the image instead of only reporting them.
    #[arg(long)]
    repair: bool,
}

struct Report {
    errors: u32,
    repaired: u32,
}

impl Report {
    fn new() -> Self {
        Self { errors: 0, repaired: 0 }
    }

    fn flag(&mut self, msg: &str) {
        self.errors += 1;
        warn!("fsck: {}", msg);
    }

    fn flag_repaired(&mut self, msg: &str, repair: bool) {
        self.errors += 1;
        if repair {
            self.repaired += 1;
            warn!("fsck: {} (repaired)", msg);
        } else {
            warn!("fsck: {} (pass --repair to fix)", msg);
        }
    }
}

fn run(args: Args) -> stix_fs::Result<()> {
    let len = std::fs::metadata(&args.image)
        .map_err(|e| stix_fs::Error::Io(e.to_string()))?
        .len();
    let nblocks = (len / BLOCKSIZE as u64) as u32;

    let device = FileBlockDevice::open(&args.image, nblocks).map_err(|e| stix_fs::Error::Io(e.to_string()))?;
    let devices = Arc::new(DeviceTable::new());
    devices.register(0, Arc::new(device));
    let bcache = Bcache::new(64, devices);

    let sb = OnDiskSuperblock::read(&bcache, 0)?;
    info!(
        "fsck: {} blocks, {} inodes, inode table at {}, bitmap at {}, data from {}",
        sb.nblocks, sb.ninodes, sb.inode_table_start, sb.block_bitmap_start, sb.first_data_block
    );

    let mut report = Report::new();

    // Pass 1: walk every allocated inode, collecting the blocks it
    // claims and the link count it records.
    let mut claimed_by: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
    let mut nlink_found: std::collections::HashMap<u32, u16> = std::collections::HashMap::new();
    let mut seen_blocks = HashSet::new();

    for inum in 1..=sb.ninodes {
        let block = sb.inode_table_start + (inum - 1) / IPB as u32;
        let offset = ((inum - 1) as usize % IPB) * DINODE_SIZE;
        let buf = bcache.bread(0, block)?;
        let mut raw = [0u8; DINODE_SIZE];
        bcache.read(&buf, offset, &mut raw);
        bcache.brelse(buf);

        let dinode = match Dinode::from_bytes(&raw) {
            Ok(d) => d,
            Err(_) => {
                report.flag(&format!("inode {}: unreadable type byte, treating as free", inum));
                continue;
            }
        };
        if matches!(dinode.ftype, FileType::Free) {
            continue;
        }

        for blockno in inode_blocks(&bcache, 0, &dinode)? {
            if blockno < sb.first_data_block || blockno >= sb.nblocks {
                report.flag(&format!(
                    "inode {}: references out-of-range block {}",
                    inum, blockno
                ));
                continue;
            }
            if !seen_blocks.insert(blockno) {
                report.flag(&format!(
                    "inode {}: block {} is claimed by more than one inode",
                    inum, blockno
                ));
            }
            *claimed_by.entry(blockno).or_insert(0) += 1;
        }
    }

    // Pass 2: walk the root directory tree to recompute real link
    // counts, so we can cross-check each inode's stored `nlink`.
    walk_dir_links(&bcache, &sb, ROOTINO, &mut nlink_found)?;

    for inum in 1..=sb.ninodes {
        let block = sb.inode_table_start + (inum - 1) / IPB as u32;
        let offset = ((inum - 1) as usize % IPB) * DINODE_SIZE;
        let buf = bcache.bread(0, block)?;
        let mut raw = [0u8; DINODE_SIZE];
        bcache.read(&buf, offset, &mut raw);

        let mut dinode = match Dinode::from_bytes(&raw) {
            Ok(d) => d,
            Err(_) => {
                bcache.brelse(buf);
                continue;
            }
        };
        if matches!(dinode.ftype, FileType::Free) {
            bcache.brelse(buf);
            continue;
        }
        let counted = nlink_found.get(&inum).copied().unwrap_or(0);
        if counted != dinode.nlink {
            report.flag_repaired(
                &format!(
                    "inode {}: nlink {} but {} directory entries reference it",
                    inum, dinode.nlink, counted
                ),
                args.repair,
            );
            if args.repair {
                dinode.nlink = counted;
                bcache.write(&buf, offset, &dinode.to_bytes());
                bcache.bwrite(&buf)?;
            }
        }
        bcache.brelse(buf);
    }

    // Pass 3: cross-check the free-block bitmap against what pass 1
    // actually found allocated.
    let bits_per_block = BLOCKSIZE as u32 * 8;
    for blockno in sb.first_data_block..sb.nblocks {
        let bb = sb.block_bitmap_start + blockno / bits_per_block;
        let byte_idx = ((blockno % bits_per_block) / 8) as usize;
        let mask = 1u8 << (blockno % 8);
        let buf = bcache.bread(0, bb)?;
        let mut raw = [0u8; BLOCKSIZE];
        bcache.read(&buf, 0, &mut raw);
        let marked = raw[byte_idx] & mask != 0;
        let used = claimed_by.contains_key(&blockno);
        if marked && !used {
            report.flag_repaired(
                &format!("block {} marked allocated but owned by no inode", blockno),
                args.repair,
            );
            if args.repair {
                raw[byte_idx] &= !mask;
                bcache.write(&buf, byte_idx, &raw[byte_idx..byte_idx + 1]);
                bcache.bwrite(&buf)?;
            }
        } else if !marked && used {
            report.flag_repaired(
                &format!("block {} in use but not marked allocated in the bitmap", blockno),
                args.repair,
            );
            if args.repair {
                raw[byte_idx] |= mask;
                bcache.write(&buf, byte_idx, &raw[byte_idx..byte_idx + 1]);
                bcache.bwrite(&buf)?;
            }
        }
        bcache.brelse(buf);
    }

    bcache.sync_all();

    if report.errors == 0 {
        info!("fsck: clean");
    } else {
        warn!(
            "fsck: {} inconsistencies found, {} repaired",
            report.errors, report.repaired
        );
    }

    if report.errors > 0 && !args.repair {
        return Err(stix_fs::Error::BitmapInconsistent);
    }
    Ok(())
}

/// Every data/indirect block number referenced by `dinode`, read
/// straight off disk rather than through `bmap` (which would allocate
/// on a hole).
fn inode_blocks(bcache: &Arc<Bcache>, dev: u32, dinode: &Dinode) -> stix_fs::Result<Vec<u32>> {
    if matches!(dinode.ftype, FileType::Character | FileType::Block) {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for &addr in &dinode.addrs[..NDIRECT] {
        if addr != 0 {
            out.push(addr);
        }
    }
    if dinode.addrs[IDX_SINGLE] != 0 {
        out.push(dinode.addrs[IDX_SINGLE]);
        out.extend(read_indirect_entries(bcache, dev, dinode.addrs[IDX_SINGLE])?);
    }
    if dinode.addrs[IDX_DOUBLE] != 0 {
        out.push(dinode.addrs[IDX_DOUBLE]);
        let outer = read_indirect_entries(bcache, dev, dinode.addrs[IDX_DOUBLE])?;
        for entry in outer {
            if entry != 0 {
                out.push(entry);
                out.extend(read_indirect_entries(bcache, dev, entry)?);
            }
        }
    }
    Ok(out)
}

fn read_indirect_entries(bcache: &Arc<Bcache>, dev: u32, block: u32) -> stix_fs::Result<Vec<u32>> {
    let buf = bcache.bread(dev, block)?;
    let entries = bcache.with_u32_slice(&buf, |words| words.iter().filter(|&&w| w != 0).copied().collect());
    bcache.brelse(buf);
    Ok(entries)
}

/// Recursively walks directory entries from `dir_inum` down, recording
/// how many directory entries actually reference each inode number.
fn walk_dir_links(
    bcache: &Arc<Bcache>,
    sb: &OnDiskSuperblock,
    dir_inum: u32,
    nlink_found: &mut std::collections::HashMap<u32, u16>,
) -> stix_fs::Result<()> {
    use stix_fs::fs::dirent::{Dirent, DIRENT_SIZE};

    let block = sb.inode_table_start + (dir_inum - 1) / IPB as u32;
    let offset = ((dir_inum - 1) as usize % IPB) * DINODE_SIZE;
    let buf = bcache.bread(0, block)?;
    let mut raw = [0u8; DINODE_SIZE];
    bcache.read(&buf, offset, &mut raw);
    bcache.brelse(buf);
    let dinode = match Dinode::from_bytes(&raw) {
        Ok(d) => d,
        Err(_) => return Ok(()),
    };
    if !matches!(dinode.ftype, FileType::Directory) {
        return Ok(());
    }

    let blocks = inode_blocks(bcache, 0, &dinode)?;
    let mut children = Vec::new();
    for blockno in blocks {
        let buf = bcache.bread(0, blockno)?;
        for slot in 0..(BLOCKSIZE / DIRENT_SIZE) {
            let mut raw = [0u8; DIRENT_SIZE];
            bcache.read(&buf, slot * DIRENT_SIZE, &mut raw);
            let dirent = Dirent::from_bytes(&raw);
            if dirent.is_unused() {
                continue;
            }
            let inum = dirent.inum as u32;
            let name = dirent.name().to_string();
            *nlink_found.entry(inum).or_insert(0) += 1;
            if name != "." && name != ".." {
                children.push(inum);
            }
        }
        bcache.brelse(buf);
    }

    for child in children {
        walk_dir_links(bcache, sb, child, nlink_found)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fsck: {}", e);
            ExitCode::from(e.errno().unsigned_abs() as u8)
        }
    }
}
