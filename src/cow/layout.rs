use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};
use std::path::Path;

use crate::config::validate_sector_size;
use crate::consts::{
    BASE_SECTOR_SIZE, COW_FORMAT_VERSION, COW_HDR_FIELDS_LEN, COW_HDR_OFF_MAGIC,
    COW_HDR_OFF_MULTIPLIER, COW_HDR_OFF_VERSION, COW_MAGIC, EXCEPTION_ENTRY_SIZE,
};
use crate::error::RevertError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CowHeader {
    pub magic: u32,
    pub version: u32,
    pub sector_multiplier: u32,
}

impl CowHeader {
    pub fn new(sector_size: u32) -> Self {
        Self {
            magic: COW_MAGIC,
            version: COW_FORMAT_VERSION,
            sector_multiplier: sector_size / BASE_SECTOR_SIZE,
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_multiplier.saturating_mul(BASE_SECTOR_SIZE)
    }

    /// Write the full header sector (fields + zero padding).
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut sector = vec![0u8; self.sector_size() as usize];
        LittleEndian::write_u32(&mut sector[COW_HDR_OFF_MAGIC..COW_HDR_OFF_MAGIC + 4], self.magic);
        LittleEndian::write_u32(&mut sector[COW_HDR_OFF_VERSION..COW_HDR_OFF_VERSION + 4], self.version);
        LittleEndian::write_u32(
            &mut sector[COW_HDR_OFF_MULTIPLIER..COW_HDR_OFF_MULTIPLIER + 4],
            self.sector_multiplier,
        );
        w.write_all(&sector)?;
        Ok(())
    }

    /// Read and validate the header fields (padding is not read).
    pub fn read_from<R: Read>(r: &mut R, path: &Path) -> Result<Self> {
        let mut buf = [0u8; COW_HDR_FIELDS_LEN];
        r.read_exact(&mut buf)
            .map_err(|e| RevertError::bad_image(path, format!("short header: {e}")))?;

        let h = Self {
            magic: LittleEndian::read_u32(&buf[COW_HDR_OFF_MAGIC..COW_HDR_OFF_MAGIC + 4]),
            version: LittleEndian::read_u32(&buf[COW_HDR_OFF_VERSION..COW_HDR_OFF_VERSION + 4]),
            sector_multiplier: LittleEndian::read_u32(
                &buf[COW_HDR_OFF_MULTIPLIER..COW_HDR_OFF_MULTIPLIER + 4],
            ),
        };
        if h.magic != COW_MAGIC {
            return Err(RevertError::bad_image(
                path,
                format!("bad magic 0x{:08x} (expected 0x{:08x})", h.magic, COW_MAGIC),
            )
            .into());
        }
        if h.version != COW_FORMAT_VERSION {
            return Err(RevertError::bad_image(
                path,
                format!("unsupported format version {} (expected {})", h.version, COW_FORMAT_VERSION),
            )
            .into());
        }
        validate_sector_size(h.sector_size())
            .map_err(|e| RevertError::bad_image(path, format!("{e}")))?;
        Ok(h)
    }
}

/// Sector arithmetic of an image with a given sector size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CowLayout {
    sector_size: u64,
    capacity: u64,
}

impl CowLayout {
    pub fn new(sector_size: u32) -> Result<Self> {
        validate_sector_size(sector_size)?;
        let slots = sector_size as u64 / EXCEPTION_ENTRY_SIZE as u64;
        Ok(Self {
            sector_size: sector_size as u64,
            capacity: slots - 1,
        })
    }

    #[inline]
    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Usable entries per metadata chunk (continuation slot excluded).
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn meta_sector(&self, chunk_seq: u64) -> u64 {
        1 + chunk_seq * (self.capacity + 1)
    }

    #[inline]
    pub fn chunk_of(&self, new_chunk: u64) -> u64 {
        new_chunk / self.capacity
    }

    #[inline]
    pub fn data_sector(&self, new_chunk: u64) -> u64 {
        self.meta_sector(self.chunk_of(new_chunk)) + 1 + new_chunk % self.capacity
    }

    #[inline]
    pub fn offset_of(&self, sector: u64) -> u64 {
        sector * self.sector_size
    }
}
