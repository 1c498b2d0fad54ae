//! Shared constants for the COW image format, sector geometry and defaults.

// -------- COW image header --------
// Header sector (LE): [magic u32][format_version u32][sector_multiplier u32][zero padding]
pub const COW_MAGIC: u32 = 0x7041_6e53; // "SnAp"
pub const COW_FORMAT_VERSION: u32 = 1;
pub const COW_HDR_OFF_MAGIC: usize = 0;
pub const COW_HDR_OFF_VERSION: usize = 4;
pub const COW_HDR_OFF_MULTIPLIER: usize = 8;
pub const COW_HDR_FIELDS_LEN: usize = 12;

// -------- Sectors --------
/// Base unit of the sector multiplier stored in the header.
pub const BASE_SECTOR_SIZE: u32 = 512;
pub const MAX_SECTOR_SIZE: u32 = 1 << 20;
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

// -------- Exception entries --------
// Entry (LE): [old_chunk u64][new_chunk u64]
pub const EXCEPTION_ENTRY_SIZE: usize = 16;

/// Continuation slot `new_chunk` value of the final (partial) metadata chunk.
pub const NO_NEXT_CHUNK: u64 = 0;

// -------- Snapshot files --------
/// Distance between a snapshot file's logical offsets and device offsets
/// (private snapshot header blocks).
pub const DEFAULT_SNAPSHOT_SHIFT: u64 = 4096 * 1036;

// -------- Restore --------
pub const DEFAULT_DIFF_IMAGE: &str = "/tmp/disk_image.img";
pub const DEFAULT_COPY_BUFFER_BYTES: usize = 1024 * 1024;

/// Physical offset reported by extent sources that cannot see the block map.
pub const UNKNOWN_PHYSICAL: u64 = u64::MAX;
