//! Centralized configuration for export and revert runs.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - RevertConfig::from_env() reads SNAPREVERT_* variables; CLI flags override on top.
//! - Fluent `with_*` setters for library callers and tests.
//!
//! Hook commands are argv vectors (whitespace-split in ENV). The snapshot or
//! device path is appended as the last argument when the hook runs.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::consts::{
    BASE_SECTOR_SIZE, DEFAULT_COPY_BUFFER_BYTES, DEFAULT_DIFF_IMAGE, DEFAULT_SECTOR_SIZE,
    DEFAULT_SNAPSHOT_SHIFT, MAX_SECTOR_SIZE,
};
use crate::error::RevertError;

/// How a re-read metadata chunk is searched for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSearch {
    /// Scan every entry. Correct for discovery-ordered chunks.
    Linear,
    /// Binary search that assumes entries are sorted by key. Misses keys in
    /// chunks whose keys were not discovered in ascending order.
    Bisect,
}

/// What `[min_key, max_key]` of a flushed chunk means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeBounds {
    /// First and last inserted key (the classic exception-store convention).
    Positional,
    /// Numeric minimum and maximum over the chunk.
    Numeric,
}

impl ChunkSearch {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Some(ChunkSearch::Linear),
            "bisect" | "binary" => Some(ChunkSearch::Bisect),
            _ => None,
        }
    }
}

impl RangeBounds {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positional" => Some(RangeBounds::Positional),
            "numeric" => Some(RangeBounds::Numeric),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RevertConfig {
    /// Device block size in bytes; unit of keys, metadata chunks and data chunks.
    /// Env: SNAPREVERT_SECTOR_SIZE (default 4096)
    pub sector_size: u32,

    /// Byte distance between snapshot-file logical offsets and device offsets.
    /// Env: SNAPREVERT_SNAPSHOT_SHIFT (default 4096*1036)
    pub snapshot_shift: u64,

    /// Env: SNAPREVERT_CHUNK_SEARCH = linear|bisect (default linear)
    pub chunk_search: ChunkSearch,

    /// Env: SNAPREVERT_RANGE_BOUNDS = positional|numeric (default positional)
    pub range_bounds: RangeBounds,

    /// Scratch diff image used by revert.
    /// Env: SNAPREVERT_DIFF_IMAGE (default /tmp/disk_image.img)
    pub diff_image: PathBuf,

    /// Keep the diff image after a successful revert.
    /// Env: SNAPREVERT_KEEP_DIFF = 0|1 (default 0)
    pub keep_diff_image: bool,

    /// Run the consistency checker hook after replay.
    /// Env: SNAPREVERT_CHECK_AFTER_REVERT = 0|1 (default 1)
    pub check_after_revert: bool,

    /// Size of the reusable copy buffer.
    /// Env: SNAPREVERT_COPY_BUFFER_BYTES (default 1 MiB)
    pub copy_buffer_bytes: usize,

    // ---------- controller hooks ----------
    /// Env: SNAPREVERT_ENABLE_CMD, e.g. "chattr -X +n"
    pub enable_cmd: Option<Vec<String>>,
    /// Exit status 0 => snapshot is deleted.
    /// Env: SNAPREVERT_DELETED_CMD
    pub deleted_cmd: Option<Vec<String>>,
    /// Env: SNAPREVERT_UNMOUNT_CMD, e.g. "umount"
    pub unmount_cmd: Option<Vec<String>>,
    /// Env: SNAPREVERT_FSCK_CMD, e.g. "e2fsck -fy"
    pub fsck_cmd: Option<Vec<String>>,
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            snapshot_shift: DEFAULT_SNAPSHOT_SHIFT,
            chunk_search: ChunkSearch::Linear,
            range_bounds: RangeBounds::Positional,
            diff_image: PathBuf::from(DEFAULT_DIFF_IMAGE),
            keep_diff_image: false,
            check_after_revert: true,
            copy_buffer_bytes: DEFAULT_COPY_BUFFER_BYTES,
            enable_cmd: None,
            deleted_cmd: None,
            unmount_cmd: None,
            fsck_cmd: None,
        }
    }
}

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "on" || s == "yes"
}

fn env_argv(v: &str) -> Option<Vec<String>> {
    let argv: Vec<String> = v.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        None
    } else {
        Some(argv)
    }
}

impl RevertConfig {
    /// Load configuration from SNAPREVERT_* environment variables.
    /// Unparsable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SNAPREVERT_SECTOR_SIZE") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.sector_size = n;
            }
        }
        if let Ok(v) = std::env::var("SNAPREVERT_SNAPSHOT_SHIFT") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.snapshot_shift = n;
            }
        }
        if let Ok(v) = std::env::var("SNAPREVERT_CHUNK_SEARCH") {
            if let Some(s) = ChunkSearch::parse(&v) {
                cfg.chunk_search = s;
            }
        }
        if let Ok(v) = std::env::var("SNAPREVERT_RANGE_BOUNDS") {
            if let Some(b) = RangeBounds::parse(&v) {
                cfg.range_bounds = b;
            }
        }
        if let Ok(v) = std::env::var("SNAPREVERT_DIFF_IMAGE") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.diff_image = PathBuf::from(s);
            }
        }
        if let Ok(v) = std::env::var("SNAPREVERT_KEEP_DIFF") {
            cfg.keep_diff_image = env_flag(&v);
        }
        if let Ok(v) = std::env::var("SNAPREVERT_CHECK_AFTER_REVERT") {
            cfg.check_after_revert = env_flag(&v);
        }
        if let Ok(v) = std::env::var("SNAPREVERT_COPY_BUFFER_BYTES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.copy_buffer_bytes = n;
            }
        }

        // ----- hooks -----
        if let Ok(v) = std::env::var("SNAPREVERT_ENABLE_CMD") {
            cfg.enable_cmd = env_argv(&v);
        }
        if let Ok(v) = std::env::var("SNAPREVERT_DELETED_CMD") {
            cfg.deleted_cmd = env_argv(&v);
        }
        if let Ok(v) = std::env::var("SNAPREVERT_UNMOUNT_CMD") {
            cfg.unmount_cmd = env_argv(&v);
        }
        if let Ok(v) = std::env::var("SNAPREVERT_FSCK_CMD") {
            cfg.fsck_cmd = env_argv(&v);
        }

        cfg
    }

    pub fn with_sector_size(mut self, bytes: u32) -> Self {
        self.sector_size = bytes;
        self
    }

    pub fn with_snapshot_shift(mut self, shift: u64) -> Self {
        self.snapshot_shift = shift;
        self
    }

    pub fn with_chunk_search(mut self, search: ChunkSearch) -> Self {
        self.chunk_search = search;
        self
    }

    pub fn with_range_bounds(mut self, bounds: RangeBounds) -> Self {
        self.range_bounds = bounds;
        self
    }

    pub fn with_diff_image<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.diff_image = path.into();
        self
    }

    pub fn with_keep_diff_image(mut self, on: bool) -> Self {
        self.keep_diff_image = on;
        self
    }

    pub fn with_check_after_revert(mut self, on: bool) -> Self {
        self.check_after_revert = on;
        self
    }

    pub fn with_copy_buffer_bytes(mut self, bytes: usize) -> Self {
        self.copy_buffer_bytes = bytes;
        self
    }

    pub fn with_enable_cmd(mut self, argv: Option<Vec<String>>) -> Self {
        self.enable_cmd = argv;
        self
    }

    pub fn with_deleted_cmd(mut self, argv: Option<Vec<String>>) -> Self {
        self.deleted_cmd = argv;
        self
    }

    pub fn with_unmount_cmd(mut self, argv: Option<Vec<String>>) -> Self {
        self.unmount_cmd = argv;
        self
    }

    pub fn with_fsck_cmd(mut self, argv: Option<Vec<String>>) -> Self {
        self.fsck_cmd = argv;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }

    /// Check geometry and buffer sizes before any file is touched.
    pub fn validate(&self) -> Result<()> {
        validate_sector_size(self.sector_size)?;
        // Keys are dev_off / sector_size; an unaligned shift would mix two blocks in one slot.
        if self.snapshot_shift % self.sector_size as u64 != 0 {
            return Err(RevertError::Config(format!(
                "snapshot_shift {} is not a multiple of sector_size {}",
                self.snapshot_shift, self.sector_size
            ))
            .into());
        }
        if self.copy_buffer_bytes == 0 {
            return Err(RevertError::Config("copy_buffer_bytes must be > 0".into()).into());
        }
        Ok(())
    }
}

/// Sector size must be a power of two in [512 .. 1 MiB].
pub fn validate_sector_size(sector_size: u32) -> Result<()> {
    if sector_size < BASE_SECTOR_SIZE
        || sector_size > MAX_SECTOR_SIZE
        || !sector_size.is_power_of_two()
    {
        return Err(RevertError::Config(format!(
            "sector_size must be a power of two in [{} .. {}], got {}",
            BASE_SECTOR_SIZE, MAX_SECTOR_SIZE, sector_size
        ))
        .into());
    }
    Ok(())
}

fn fmt_argv(argv: &Option<Vec<String>>) -> String {
    argv.as_ref()
        .map(|v| format!("\"{}\"", v.join(" ")))
        .unwrap_or_else(|| "none".to_string())
}

impl fmt::Display for RevertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RevertConfig {{ \
             sector_size: {}, \
             snapshot_shift: {}, \
             chunk_search: {:?}, \
             range_bounds: {:?}, \
             diff_image: {}, \
             keep_diff_image: {}, \
             check_after_revert: {}, \
             copy_buffer_bytes: {}, \
             enable_cmd: {}, \
             deleted_cmd: {}, \
             unmount_cmd: {}, \
             fsck_cmd: {} \
             }}",
            self.sector_size,
            self.snapshot_shift,
            self.chunk_search,
            self.range_bounds,
            self.diff_image.display(),
            self.keep_diff_image,
            self.check_after_revert,
            self.copy_buffer_bytes,
            fmt_argv(&self.enable_cmd),
            fmt_argv(&self.deleted_cmd),
            fmt_argv(&self.unmount_cmd),
            fmt_argv(&self.fsck_cmd),
        )
    }
}
