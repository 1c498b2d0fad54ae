use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::chunk::{ExceptionEntry, MetadataChunk};
use super::layout::{CowHeader, CowLayout};
use crate::error::RevertError;

/// Read-only view of a COW exception store image.
pub struct CowImage {
    path: PathBuf,
    file: File,
    header: CowHeader,
    layout: CowLayout,
    len: u64,
}

impl CowImage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("open COW image {}", path.display()))?;
        let header = CowHeader::read_from(&mut file, path)?;
        let layout = CowLayout::new(header.sector_size())?;
        let len = file.metadata()?.len();
        if len < layout.sector_size() {
            return Err(RevertError::bad_image(
                path,
                format!("{} bytes is shorter than the header sector", len),
            )
            .into());
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            layout,
            len,
        })
    }

    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    pub fn layout(&self) -> &CowLayout {
        &self.layout
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Walk the metadata chunks through their continuation slots.
    pub fn chunks(&mut self) -> Result<Vec<MetadataChunk>> {
        let ss = self.layout.sector_size();
        let mut out = Vec::new();
        let mut sector = vec![0u8; ss as usize];
        let mut seq = 0u64;

        loop {
            let meta = self.layout.meta_sector(seq);
            let off = self.layout.offset_of(meta);
            if off >= self.len {
                break;
            }
            if off + ss > self.len {
                return Err(RevertError::bad_image(
                    &self.path,
                    format!("metadata chunk {} truncated at {}", seq, self.len),
                )
                .into());
            }
            self.file.seek(SeekFrom::Start(off))?;
            self.file
                .read_exact(&mut sector)
                .with_context(|| format!("read metadata chunk {} of {}", seq, self.path.display()))?;
            let (chunk, next) = MetadataChunk::decode(&sector, seq, &self.layout, &self.path)?;
            let full = chunk.is_full();
            out.push(chunk);
            if !full {
                break;
            }
            let expected = self.layout.meta_sector(seq + 1);
            if next != expected {
                return Err(RevertError::bad_image(
                    &self.path,
                    format!(
                        "chunk {} continues at sector {} (expected {})",
                        seq, next, expected
                    ),
                )
                .into());
            }
            seq += 1;
        }
        Ok(out)
    }

    /// Every exception, in on-disk order.
    pub fn exceptions(&mut self) -> Result<Vec<ExceptionEntry>> {
        Ok(self
            .chunks()?
            .iter()
            .flat_map(|c| c.entries().iter().copied())
            .collect())
    }

    /// Exception recorded for device block `old_chunk`, by full scan.
    pub fn find(&mut self, old_chunk: u64) -> Result<Option<ExceptionEntry>> {
        Ok(self
            .exceptions()?
            .into_iter()
            .find(|e| e.old_chunk == old_chunk))
    }

    /// Preserved contents of exception slot `new_chunk`.
    pub fn read_data(&mut self, new_chunk: u64) -> Result<Vec<u8>> {
        let ss = self.layout.sector_size();
        let off = self.layout.offset_of(self.layout.data_sector(new_chunk));
        if off + ss > self.len {
            return Err(RevertError::bad_image(
                &self.path,
                format!("data chunk {} lies past the end of the image", new_chunk),
            )
            .into());
        }
        let mut buf = vec![0u8; ss as usize];
        self.file.seek(SeekFrom::Start(off))?;
        self.file
            .read_exact(&mut buf)
            .with_context(|| format!("read data chunk {} of {}", new_chunk, self.path.display()))?;
        Ok(buf)
    }
}
