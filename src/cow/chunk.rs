use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::path::Path;

use super::layout::CowLayout;
use crate::config::ChunkSearch;
use crate::consts::EXCEPTION_ENTRY_SIZE;
use crate::error::RevertError;

/// Device block `old_chunk` keeps its pre-snapshot contents in image slot `new_chunk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExceptionEntry {
    pub old_chunk: u64,
    pub new_chunk: u64,
}

/// One metadata sector worth of exceptions, in discovery order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataChunk {
    seq: u64,
    capacity: usize,
    entries: Vec<ExceptionEntry>,
}

impl MetadataChunk {
    pub fn new(seq: u64, capacity: usize) -> Self {
        Self {
            seq,
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[ExceptionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub(crate) fn push(&mut self, entry: ExceptionEntry) {
        debug_assert!(!self.is_full(), "push into a full metadata chunk");
        self.entries.push(entry);
    }

    pub fn first_key(&self) -> Option<u64> {
        self.entries.first().map(|e| e.old_chunk)
    }

    pub fn last_key(&self) -> Option<u64> {
        self.entries.last().map(|e| e.old_chunk)
    }

    pub fn find_linear(&self, key: u64) -> Option<ExceptionEntry> {
        self.entries.iter().copied().find(|e| e.old_chunk == key)
    }

    /// Binary search over `old_chunk`. Only valid when the chunk happens to be
    /// key-sorted; entries are stored in discovery order.
    pub fn find_bisect(&self, key: u64) -> Option<ExceptionEntry> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let k = self.entries[mid].old_chunk;
            if k == key {
                return Some(self.entries[mid]);
            } else if k < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    pub fn find(&self, key: u64, search: ChunkSearch) -> Option<ExceptionEntry> {
        match search {
            ChunkSearch::Linear => self.find_linear(key),
            ChunkSearch::Bisect => self.find_bisect(key),
        }
    }

    /// Encode into one sector. `next_sector` goes into the continuation slot.
    pub fn encode(&self, layout: &CowLayout, next_sector: u64) -> Vec<u8> {
        let mut sector = vec![0u8; layout.sector_size() as usize];
        for (i, e) in self.entries.iter().enumerate() {
            let off = i * EXCEPTION_ENTRY_SIZE;
            LittleEndian::write_u64(&mut sector[off..off + 8], e.old_chunk);
            LittleEndian::write_u64(&mut sector[off + 8..off + 16], e.new_chunk);
        }
        let cont = layout.capacity() as usize * EXCEPTION_ENTRY_SIZE;
        LittleEndian::write_u64(&mut sector[cont..cont + 8], self.entries.len() as u64);
        LittleEndian::write_u64(&mut sector[cont + 8..cont + 16], next_sector);
        sector
    }

    /// Decode a metadata sector. Returns the chunk and its continuation target.
    pub fn decode(
        sector: &[u8],
        seq: u64,
        layout: &CowLayout,
        path: &Path,
    ) -> Result<(Self, u64)> {
        if sector.len() as u64 != layout.sector_size() {
            return Err(RevertError::bad_image(
                path,
                format!("metadata chunk {} has {} bytes", seq, sector.len()),
            )
            .into());
        }
        let capacity = layout.capacity() as usize;
        let cont = capacity * EXCEPTION_ENTRY_SIZE;
        let used = LittleEndian::read_u64(&sector[cont..cont + 8]);
        let next = LittleEndian::read_u64(&sector[cont + 8..cont + 16]);
        if used == 0 || used > capacity as u64 {
            return Err(RevertError::bad_image(
                path,
                format!(
                    "metadata chunk {} claims {} entries (capacity {})",
                    seq, used, capacity
                ),
            )
            .into());
        }

        let mut chunk = Self::new(seq, capacity);
        for i in 0..used as usize {
            let off = i * EXCEPTION_ENTRY_SIZE;
            chunk.entries.push(ExceptionEntry {
                old_chunk: LittleEndian::read_u64(&sector[off..off + 8]),
                new_chunk: LittleEndian::read_u64(&sector[off + 8..off + 16]),
            });
        }
        Ok((chunk, next))
    }
}
