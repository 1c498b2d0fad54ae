//! cow: copy-on-write exception store image (build, index, read).
//!
//! Format (LE, every unit is one sector of `sector_size` bytes):
//! - sector 0: header [magic u32 = "SnAp"][format_version u32 = 1][sector_multiplier u32]
//!   (sector_size = multiplier * 512), zero padded;
//! - then groups of [metadata chunk][data sector for entry 0]..[data sector for entry N-1].
//!
//! Metadata chunk = sector_size / 16 slots of [old_chunk u64][new_chunk u64].
//! The last slot is the continuation slot: [used entries u64][next metadata sector u64],
//! next = 0 for the final partial chunk. Usable capacity C = sector_size / 16 - 1.
//!
//! Addressing (C = capacity):
//! - metadata chunk c at sector 1 + c*(C+1)
//! - exception n (new_chunk) at sector 1 + (n/C)*(C+1) + 1 + n%C
//!
//! Submodules:
//! - layout.rs: header + sector arithmetic.
//! - chunk.rs: ExceptionEntry / MetadataChunk encode/decode/search.
//! - index.rs: ExceptionChunkIndex (range bracketing + chunk re-read).
//! - builder.rs: ExceptionStoreBuilder and `export`.
//! - reader.rs: CowImage reader.

mod builder;
mod chunk;
mod index;
mod layout;
mod reader;

pub use builder::{export, BuilderState, CowExport, ExceptionStoreBuilder, ExportReport};
pub use chunk::{ExceptionEntry, MetadataChunk};
pub use index::{ChunkRange, ExceptionChunkIndex};
pub use layout::{CowHeader, CowLayout};
pub use reader::CowImage;
