//! Exception chunk index: "was this device block already captured?"
//!
//! Two levels: the in-flight chunk is scanned directly; flushed chunks are
//! bracketed by their recorded `[min_key, max_key]` and only bracketing chunks
//! are re-read from the image. With positional bounds (first/last inserted
//! key) a key inside an unsorted chunk can fall outside its bracket and be
//! missed; that costs a duplicate exception, not a wrong block.

use anyhow::{Context, Result};
use log::trace;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::chunk::MetadataChunk;
use super::layout::CowLayout;
use crate::config::{ChunkSearch, RangeBounds};
use crate::error::RevertError;
use crate::metrics::record_chunk_reread;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkRange {
    pub chunk_seq: u64,
    pub min_key: u64,
    pub max_key: u64,
}

impl ChunkRange {
    #[inline]
    pub fn brackets(&self, key: u64) -> bool {
        self.min_key <= key && key <= self.max_key
    }
}

#[derive(Clone, Debug)]
pub struct ExceptionChunkIndex {
    layout: CowLayout,
    search: ChunkSearch,
    bounds: RangeBounds,
    ranges: Vec<ChunkRange>,
    rereads: u64,
}

impl ExceptionChunkIndex {
    pub fn new(layout: CowLayout, search: ChunkSearch, bounds: RangeBounds) -> Self {
        Self {
            layout,
            search,
            bounds,
            ranges: Vec::new(),
            rereads: 0,
        }
    }

    /// Ranges in flush order.
    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    /// Number of flushed chunks re-read by lookups so far.
    pub fn rereads(&self) -> u64 {
        self.rereads
    }

    /// Record the key range of a chunk that was just flushed.
    pub fn register(&mut self, chunk: &MetadataChunk) -> Result<()> {
        let (min_key, max_key) = match self.bounds {
            RangeBounds::Positional => match (chunk.first_key(), chunk.last_key()) {
                (Some(f), Some(l)) => (f, l),
                _ => return Ok(()),
            },
            RangeBounds::Numeric => {
                let mut keys = chunk.entries().iter().map(|e| e.old_chunk);
                let Some(first) = keys.next() else {
                    return Ok(());
                };
                keys.fold((first, first), |(lo, hi), k| (lo.min(k), hi.max(k)))
            }
        };
        self.ranges
            .try_reserve(1)
            .map_err(|_| RevertError::OutOfMemory("exception chunk index"))?;
        self.ranges.push(ChunkRange {
            chunk_seq: chunk.seq(),
            min_key,
            max_key,
        });
        Ok(())
    }

    /// Flushed chunks whose recorded range brackets `key`, in flush order.
    pub fn candidates(&self, key: u64) -> impl Iterator<Item = &ChunkRange> + '_ {
        self.ranges.iter().filter(move |r| r.brackets(key))
    }

    /// Image slot (`new_chunk`) holding `key`, if it was captured.
    pub fn lookup<R: Read + Seek>(
        &mut self,
        key: u64,
        inflight: &MetadataChunk,
        image: &mut R,
        path: &Path,
    ) -> Result<Option<u64>> {
        if let Some(e) = inflight.find_linear(key) {
            return Ok(Some(e.new_chunk));
        }

        let seqs: Vec<u64> = self.candidates(key).map(|r| r.chunk_seq).collect();
        for seq in seqs {
            let chunk = self.read_chunk(seq, image, path)?;
            if let Some(e) = chunk.find(key, self.search) {
                trace!("lookup: key {} found in chunk {}", key, seq);
                return Ok(Some(e.new_chunk));
            }
        }
        Ok(None)
    }

    /// Re-read a flushed metadata chunk from the image.
    pub fn read_chunk<R: Read + Seek>(
        &mut self,
        seq: u64,
        image: &mut R,
        path: &Path,
    ) -> Result<MetadataChunk> {
        let off = self.layout.offset_of(self.layout.meta_sector(seq));
        let mut sector = vec![0u8; self.layout.sector_size() as usize];
        image
            .seek(SeekFrom::Start(off))
            .and_then(|_| image.read_exact(&mut sector))
            .with_context(|| format!("re-read metadata chunk {} of {}", seq, path.display()))?;
        self.rereads += 1;
        record_chunk_reread();
        let (chunk, _next) = MetadataChunk::decode(&sector, seq, &self.layout, path)?;
        Ok(chunk)
    }
}
