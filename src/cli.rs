use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{ChunkSearch, RangeBounds, RevertConfig};

mod export;
mod inspect;
mod list;
mod revert;

#[derive(Parser, Debug)]
#[command(
    name = "snaprevert",
    version,
    about = "Export snapshot changed blocks as a COW exception store, or revert a device to a snapshot",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// List discovered snapshots, newest first
    List {
        /// Directory holding the snapshot files
        #[arg(long)]
        snapshots: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Build a COW exception store image from the target back to the oldest snapshot
    ///
    /// Example:
    ///   snaprevert export --snapshots /mnt/.snapshots --target snap.3 --out ./snap3.cow
    Export {
        #[arg(long)]
        snapshots: PathBuf,
        /// Snapshot file name (inside --snapshots) or full path
        #[arg(long)]
        target: String,
        /// Output image path (truncated)
        #[arg(long)]
        out: PathBuf,
        /// Sector size in bytes (power of two, 512..=1MiB)
        #[arg(long)]
        sector_size: Option<u32>,
        /// Snapshot file shift in bytes
        #[arg(long)]
        shift: Option<u64>,
        /// Search re-read chunks with binary search (assumes sorted chunks)
        #[arg(long, default_value_t = false)]
        bisect: bool,
        /// Record numeric min/max per chunk instead of first/last key
        #[arg(long, default_value_t = false)]
        numeric_ranges: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Revert a device to the target snapshot (NOT transactional)
    ///
    /// Example:
    ///   SNAPREVERT_UNMOUNT_CMD=umount snaprevert revert --snapshots /mnt/.snapshots \
    ///       --target snap.3 --device /dev/sda4
    Revert {
        #[arg(long)]
        snapshots: PathBuf,
        #[arg(long)]
        target: String,
        /// Block device (or image file) to rewrite
        #[arg(long)]
        device: PathBuf,
        /// Scratch diff image path
        #[arg(long)]
        diff_image: Option<PathBuf>,
        /// Keep the diff image after success
        #[arg(long, default_value_t = false)]
        keep_diff: bool,
        /// Skip the consistency check hook
        #[arg(long, default_value_t = false)]
        no_check: bool,
        /// Enumerate the diff image by scanning for data instead of FIEMAP
        #[arg(long, default_value_t = false)]
        scan_diff: bool,
        #[arg(long)]
        sector_size: Option<u32>,
        #[arg(long)]
        shift: Option<u64>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print header, chunks and (optionally) every exception of a COW image
    Inspect {
        #[arg(long)]
        image: PathBuf,
        /// Print every exception entry
        #[arg(long, default_value_t = false)]
        entries: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Cli as Parser>::parse()
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::List { snapshots, json } => list::cmd_list(snapshots, json),

        Cmd::Export {
            snapshots,
            target,
            out,
            sector_size,
            shift,
            bisect,
            numeric_ranges,
            json,
        } => {
            let mut cfg = apply_geometry(RevertConfig::from_env(), sector_size, shift);
            if bisect {
                cfg = cfg.with_chunk_search(ChunkSearch::Bisect);
            }
            if numeric_ranges {
                cfg = cfg.with_range_bounds(RangeBounds::Numeric);
            }
            export::cmd_export(cfg, snapshots, target, out, json)
        }

        Cmd::Revert {
            snapshots,
            target,
            device,
            diff_image,
            keep_diff,
            no_check,
            scan_diff,
            sector_size,
            shift,
            json,
        } => {
            let mut cfg = apply_geometry(RevertConfig::from_env(), sector_size, shift);
            if let Some(p) = diff_image {
                cfg = cfg.with_diff_image(p);
            }
            if keep_diff {
                cfg = cfg.with_keep_diff_image(true);
            }
            if no_check {
                cfg = cfg.with_check_after_revert(false);
            }
            revert::cmd_revert(cfg, snapshots, target, device, scan_diff, json)
        }

        Cmd::Inspect { image, entries, json } => inspect::cmd_inspect(image, entries, json),
    }
}

fn apply_geometry(cfg: RevertConfig, sector_size: Option<u32>, shift: Option<u64>) -> RevertConfig {
    let mut cfg = cfg;
    if let Some(ss) = sector_size {
        cfg = cfg.with_sector_size(ss);
    }
    if let Some(s) = shift {
        cfg = cfg.with_snapshot_shift(s);
    }
    cfg.build()
}

/// A bare name is looked up inside the snapshot directory; anything with a
/// separator is taken as a path.
pub(crate) fn target_path(snapshots: &Path, target: &str) -> PathBuf {
    let p = Path::new(target);
    if p.is_absolute() || p.components().count() > 1 {
        p.to_path_buf()
    } else {
        snapshots.join(p)
    }
}
