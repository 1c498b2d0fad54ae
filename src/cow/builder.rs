//! Exception store builder.
//!
//! Walks the snapshot chain from the target to the oldest version. The first
//! snapshot that covers a device block wins; later (older) copies of the same
//! block are skipped through the exception chunk index.
//!
//! Data sectors are written as soon as an exception is appended (their slot is
//! fixed by `new_chunk`); the metadata sector is written once, when its chunk
//! is full or at `finish`. A failed export leaves a truncated image behind
//! that must be discarded.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::chunk::{ExceptionEntry, MetadataChunk};
use super::index::ExceptionChunkIndex;
use super::layout::{CowHeader, CowLayout};
use crate::config::RevertConfig;
use crate::consts::NO_NEXT_CHUNK;
use crate::extent::ExtentSource;
use crate::metrics::{
    record_chunk_flush, record_dedup_hit, record_exception, record_extent_diverging,
    record_snapshot_walked,
};
use crate::snapshots::{SnapshotController, SnapshotIndex, SnapshotVersion};

/// Run counters of one export. Owned by the builder, never shared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BuilderState {
    pub next_new_chunk_id: u64,
    pub current_offset_in_chunk: u64,
    pub flushed_chunk_count: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ExportReport {
    pub image: PathBuf,
    pub target: Option<PathBuf>,
    pub sector_size: u32,
    pub snapshots_walked: u64,
    pub extents_seen: u64,
    pub extents_diverging: u64,
    pub blocks_looked_up: u64,
    pub exceptions: u64,
    pub dedup_hits: u64,
    pub chunks_flushed: u64,
    pub chunk_rereads: u64,
    pub image_bytes: u64,
}

/// Result of a finished export: summary plus the in-memory chunk index.
#[derive(Debug)]
pub struct CowExport {
    pub report: ExportReport,
    pub state: BuilderState,
    pub index: ExceptionChunkIndex,
}

pub struct ExceptionStoreBuilder {
    path: PathBuf,
    image: File,
    layout: CowLayout,
    shift: u64,
    state: BuilderState,
    inflight: MetadataChunk,
    index: ExceptionChunkIndex,
    report: ExportReport,
    sector_buf: Vec<u8>,
}

impl ExceptionStoreBuilder {
    /// Create (truncate) the image at `path` and write its header.
    pub fn create(path: &Path, cfg: &RevertConfig) -> Result<Self> {
        cfg.validate()?;
        let layout = CowLayout::new(cfg.sector_size)?;

        let mut image = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create COW image {}", path.display()))?;
        CowHeader::new(cfg.sector_size)
            .write_to(&mut image)
            .with_context(|| format!("write COW header {}", path.display()))?;

        debug!(
            "cow: created {} (sector_size={}, capacity={})",
            path.display(),
            layout.sector_size(),
            layout.capacity()
        );

        Ok(Self {
            path: path.to_path_buf(),
            image,
            layout,
            shift: cfg.snapshot_shift,
            state: BuilderState::default(),
            inflight: MetadataChunk::new(0, layout.capacity() as usize),
            index: ExceptionChunkIndex::new(layout, cfg.chunk_search, cfg.range_bounds),
            report: ExportReport {
                image: path.to_path_buf(),
                sector_size: cfg.sector_size,
                ..ExportReport::default()
            },
            sector_buf: vec![0u8; layout.sector_size() as usize],
        })
    }

    pub fn layout(&self) -> &CowLayout {
        &self.layout
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// The chunk currently being filled (not yet on disk).
    pub fn inflight(&self) -> &MetadataChunk {
        &self.inflight
    }

    pub fn index(&self) -> &ExceptionChunkIndex {
        &self.index
    }

    /// Image slot holding `key`, if already captured.
    pub fn lookup(&mut self, key: u64) -> Result<Option<u64>> {
        self.index
            .lookup(key, &self.inflight, &mut self.image, &self.path)
    }

    /// Capture `data` for device block `key` unless it is already recorded.
    /// Returns true when a new exception was appended.
    pub fn record_block(&mut self, key: u64, data: &[u8]) -> Result<bool> {
        self.capture_with(key, || Ok(data.to_vec()))
    }

    /// Look `key` up; on a miss, fetch its data through `read` and append it.
    /// `read` is not called for blocks already captured.
    fn capture_with<F>(&mut self, key: u64, read: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        self.report.blocks_looked_up += 1;
        if self.lookup(key)?.is_some() {
            self.report.dedup_hits += 1;
            record_dedup_hit();
            return Ok(false);
        }
        let data = read()?;
        self.append(key, &data)?;
        Ok(true)
    }

    fn append(&mut self, key: u64, data: &[u8]) -> Result<u64> {
        let new_chunk = self.state.next_new_chunk_id;
        let ss = self.layout.sector_size() as usize;

        let n = data.len().min(ss);
        self.sector_buf[..n].copy_from_slice(&data[..n]);
        self.sector_buf[n..].fill(0);

        let off = self.layout.offset_of(self.layout.data_sector(new_chunk));
        self.image
            .seek(SeekFrom::Start(off))
            .and_then(|_| self.image.write_all(&self.sector_buf))
            .with_context(|| {
                format!(
                    "write data chunk {} at {} in {}",
                    new_chunk,
                    off,
                    self.path.display()
                )
            })?;

        self.inflight.push(ExceptionEntry {
            old_chunk: key,
            new_chunk,
        });
        self.state.next_new_chunk_id += 1;
        self.state.current_offset_in_chunk += 1;
        self.report.exceptions += 1;
        record_exception();

        if self.inflight.is_full() {
            self.flush()?;
        }
        Ok(new_chunk)
    }

    /// Write the in-flight chunk, register its range and open the next one.
    fn flush(&mut self) -> Result<()> {
        if self.inflight.is_empty() {
            return Ok(());
        }
        let seq = self.inflight.seq();
        let next = if self.inflight.is_full() {
            self.layout.meta_sector(seq + 1)
        } else {
            NO_NEXT_CHUNK
        };
        let sector = self.inflight.encode(&self.layout, next);
        let off = self.layout.offset_of(self.layout.meta_sector(seq));
        self.image
            .seek(SeekFrom::Start(off))
            .and_then(|_| self.image.write_all(&sector))
            .with_context(|| {
                format!("write metadata chunk {} in {}", seq, self.path.display())
            })?;

        self.index.register(&self.inflight)?;
        debug!(
            "cow: flushed chunk {} ({} entries, next sector {})",
            seq,
            self.inflight.len(),
            next
        );

        self.state.flushed_chunk_count += 1;
        self.state.current_offset_in_chunk = 0;
        self.report.chunks_flushed += 1;
        record_chunk_flush();
        self.inflight = MetadataChunk::new(seq + 1, self.layout.capacity() as usize);
        Ok(())
    }

    /// Capture every diverging block of one snapshot.
    pub fn add_snapshot(
        &mut self,
        version: &SnapshotVersion,
        extents: &dyn ExtentSource,
        controller: &dyn SnapshotController,
    ) -> Result<()> {
        let path = version.path();
        controller
            .enable(path)
            .with_context(|| format!("enable snapshot {}", path.display()))?;
        let mut snap = File::open(path)
            .with_context(|| format!("open snapshot {}", path.display()))?;
        let list = extents.query_extents(&snap, path)?;

        self.report.snapshots_walked += 1;
        record_snapshot_walked();
        let before = self.report.exceptions;
        let ss = self.layout.sector_size();

        for ext in &list {
            self.report.extents_seen += 1;
            if !ext.diverges(self.shift) {
                continue;
            }
            let Some(dev_off) = ext.device_offset(self.shift) else {
                continue;
            };
            self.report.extents_diverging += 1;
            record_extent_diverging();

            let first_key = dev_off / ss;
            for i in 0..ext.slice_count(ss) {
                let src_off = ext.logical_offset + i * ss;
                let want = (ext.length - i * ss).min(ss) as usize;
                self.capture_with(first_key + i, || read_slice(&mut snap, src_off, want, path))?;
            }
        }

        info!(
            "export: snapshot {} (version {}): {} extent(s), {} new exception(s)",
            path.display(),
            version.version_id(),
            list.len(),
            self.report.exceptions - before
        );
        Ok(())
    }

    /// Flush the final partial chunk and sync the image.
    pub fn finish(mut self) -> Result<CowExport> {
        self.flush()?;
        self.image
            .sync_all()
            .with_context(|| format!("sync COW image {}", self.path.display()))?;
        self.report.image_bytes = self.image.metadata()?.len();
        self.report.chunk_rereads = self.index.rereads();
        Ok(CowExport {
            report: self.report,
            state: self.state,
            index: self.index,
        })
    }
}

/// Read up to `want` bytes at `off`; a short read at EOF is zero padded.
fn read_slice(f: &mut File, off: u64, want: usize, path: &Path) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; want];
    f.seek(SeekFrom::Start(off))
        .with_context(|| format!("seek {} in {}", off, path.display()))?;
    let mut filled = 0;
    while filled < want {
        let n = f
            .read(&mut buf[filled..])
            .with_context(|| format!("read {} at {}", path.display(), off + filled as u64))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf)
}

/// Export the chain from `target` down to the oldest snapshot into `out`.
pub fn export(
    index: &SnapshotIndex,
    target: &Path,
    out: &Path,
    cfg: &RevertConfig,
    extents: &dyn ExtentSource,
    controller: &dyn SnapshotController,
) -> Result<CowExport> {
    let target_version = index.resolve_target(target)?;
    info!(
        "export: start, target={} (version {}), out={}, {}",
        target.display(),
        target_version.version_id(),
        out.display(),
        cfg
    );

    let mut builder = ExceptionStoreBuilder::create(out, cfg)?;
    for version in index.iterate_from_target_to_oldest(target_version) {
        builder.add_snapshot(version, extents, controller)?;
    }
    let mut done = builder.finish()?;
    done.report.target = Some(target.to_path_buf());

    info!(
        "export: done exceptions={}, dedup_hits={}, chunks={}, bytes={}, out={}",
        done.report.exceptions,
        done.report.dedup_hits,
        done.report.chunks_flushed,
        done.report.image_bytes,
        out.display()
    );
    Ok(done)
}
