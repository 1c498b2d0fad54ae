//! Extents and the sources that report them.
//!
//! An [`Extent`] is one allocated region of a file: `logical_offset` in file
//! coordinates, `physical_offset` on the backing device, `length` in bytes.
//! For snapshot files the logical offset is shifted by `snapshot_shift`
//! relative to device offsets; an extent "diverges" (was copied on write) when
//! the unshifted logical offset differs from its physical location.

use anyhow::Result;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Bound::Excluded;
use std::path::{Path, PathBuf};

use crate::consts::UNKNOWN_PHYSICAL;
use crate::error::RevertError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub logical_offset: u64,
    pub physical_offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(logical_offset: u64, physical_offset: u64, length: u64) -> Self {
        Self {
            logical_offset,
            physical_offset,
            length,
        }
    }

    /// Device byte offset of the extent start, or None when the extent lies in
    /// the snapshot-private area below `shift`.
    #[inline]
    pub fn device_offset(&self, shift: u64) -> Option<u64> {
        self.logical_offset.checked_sub(shift)
    }

    /// True when the region was copied on write, i.e. it no longer sits at the
    /// device location it describes.
    #[inline]
    pub fn diverges(&self, shift: u64) -> bool {
        match self.device_offset(shift) {
            Some(dev) => dev != self.physical_offset,
            None => false,
        }
    }

    /// Number of `sector_size` slices covering the extent (last one may be short).
    #[inline]
    pub fn slice_count(&self, sector_size: u64) -> u64 {
        self.length.div_ceil(sector_size)
    }
}

/// Reports the allocated extents of an open file, ordered by logical offset.
pub trait ExtentSource {
    fn query_extents(&self, file: &File, path: &Path) -> Result<Vec<Extent>>;
}

/// Fixed path -> extents map. Unknown paths fail like an unsupported file would.
#[derive(Clone, Debug, Default)]
pub struct StaticExtentSource {
    map: HashMap<PathBuf, Vec<Extent>>,
}

impl StaticExtentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, extents: Vec<Extent>) {
        self.map.insert(path.into(), extents);
    }

    pub fn with<P: Into<PathBuf>>(mut self, path: P, extents: Vec<Extent>) -> Self {
        self.insert(path, extents);
        self
    }
}

impl ExtentSource for StaticExtentSource {
    fn query_extents(&self, _file: &File, path: &Path) -> Result<Vec<Extent>> {
        match self.map.get(path) {
            Some(v) => {
                let mut v = v.clone();
                v.sort_by_key(|e| e.logical_offset);
                Ok(v)
            }
            None => Err(RevertError::extent_query(path, "no extent map registered").into()),
        }
    }
}

/// Reports every non-zero `granularity`-sized region as an extent with an
/// unknown physical offset (so it always diverges).
///
/// Fallback for scratch files on filesystems without a block-map query. Reads
/// the whole file; regions that were written with zeroes are not reported.
#[derive(Clone, Copy, Debug)]
pub struct DataScanExtentSource {
    pub granularity: u64,
}

impl DataScanExtentSource {
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity: granularity.max(1),
        }
    }
}

impl ExtentSource for DataScanExtentSource {
    fn query_extents(&self, file: &File, path: &Path) -> Result<Vec<Extent>> {
        let len = file
            .metadata()
            .map_err(|e| RevertError::extent_query(path, format!("stat: {e}")))?
            .len();
        let mut f = file;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| RevertError::extent_query(path, format!("seek: {e}")))?;

        let gran = self.granularity;
        let mut buf = vec![0u8; gran as usize];
        let mut out: Vec<Extent> = Vec::new();
        let mut off = 0u64;

        while off < len {
            let want = gran.min(len - off) as usize;
            f.read_exact(&mut buf[..want])
                .map_err(|e| RevertError::extent_query(path, format!("read at {off}: {e}")))?;

            if buf[..want].iter().any(|&b| b != 0) {
                match out.last_mut() {
                    Some(last) if last.logical_offset + last.length == off => {
                        last.length += want as u64;
                    }
                    _ => out.push(Extent::new(off, UNKNOWN_PHYSICAL, want as u64)),
                }
            }
            off += want as u64;
        }

        debug!(
            "data-scan: {} extent(s) in {} (len={}, granularity={})",
            out.len(),
            path.display(),
            len,
            gran
        );
        Ok(out)
    }
}

/// Set of byte ranges `[start, end)`, kept sorted by start. Overlapping and
/// touching ranges are merged on insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, start: u64, len: u64) {
        let mut lo = start;
        let mut hi = start.saturating_add(len);
        if hi <= lo {
            return;
        }

        if let Some((&s, &e)) = self.ranges.range(..=lo).next_back() {
            if e >= lo {
                lo = s;
                hi = hi.max(e);
            }
        }
        let swallowed: Vec<(u64, u64)> = self
            .ranges
            .range(lo..=hi)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in swallowed {
            hi = hi.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(lo, hi);
    }

    pub fn remove(&mut self, start: u64, len: u64) {
        let end = start.saturating_add(len);
        for (s, e) in self.overlapping(start, end) {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// Parts of `[start, start + len)` covered by the set, as `(offset, len)`.
    pub fn intersect(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        let end = start.saturating_add(len);
        self.overlapping(start, end)
            .into_iter()
            .map(|(s, e)| {
                let (s, e) = (s.max(start), e.min(end));
                (s, e - s)
            })
            .collect()
    }

    /// Ranges as `(offset, len)`, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e - s))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(|(&s, &e)| e - s).sum()
    }

    fn overlapping(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        if end <= start {
            return Vec::new();
        }
        let mut out: Vec<(u64, u64)> = self
            .ranges
            .range(..=start)
            .next_back()
            .filter(|(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .into_iter()
            .collect();
        out.extend(
            self.ranges
                .range((Excluded(start), Excluded(end)))
                .map(|(&s, &e)| (s, e)),
        );
        out
    }
}

/// Block-map source for snapshot files on this platform.
pub fn platform_extent_source() -> Result<Box<dyn ExtentSource>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(crate::fiemap::FiemapExtentSource::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(RevertError::Config("no block-map query (FIEMAP) on this platform".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[test]
    fn divergence_respects_shift() {
        let shift = 8192;
        // device offset 4096 stored at physical 4096 => in place
        assert!(!Extent::new(shift + 4096, 4096, 4096).diverges(shift));
        // copied elsewhere
        assert!(Extent::new(shift + 4096, 999_424, 4096).diverges(shift));
        // snapshot header area
        assert!(!Extent::new(4096, 0, 4096).diverges(shift));
        assert_eq!(Extent::new(4096, 0, 4096).device_offset(shift), None);
    }

    #[test]
    fn slice_count_rounds_up() {
        assert_eq!(Extent::new(0, 1, 4096).slice_count(512), 8);
        assert_eq!(Extent::new(0, 1, 4097).slice_count(512), 9);
        assert_eq!(Extent::new(0, 1, 0).slice_count(512), 0);
    }

    #[test]
    fn data_scan_coalesces_non_zero_granules() {
        let path = std::env::temp_dir().join(format!(
            "snaprevert-scan-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            let mut data = vec![0u8; 512 * 6];
            data[512..1024].fill(1);
            data[1024..1536].fill(2);
            data[2048 + 7] = 9;
            f.write_all(&data).unwrap();
        }
        let f = File::open(&path).unwrap();
        let got = DataScanExtentSource::new(512).query_extents(&f, &path).unwrap();
        assert_eq!(
            got,
            vec![
                Extent::new(512, UNKNOWN_PHYSICAL, 1024),
                Extent::new(2048, UNKNOWN_PHYSICAL, 512),
            ]
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn range_set_merges_overlapping_and_touching() {
        let mut rs = RangeSet::new();
        rs.insert(1024, 512);
        rs.insert(4096, 512);
        rs.insert(1536, 512); // касается [1024, 1536)
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec![(1024, 1024), (4096, 512)]);

        // перекрывает оба
        rs.insert(1500, 3000);
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec![(1024, 3584)]);
        assert_eq!(rs.total_bytes(), 3584);

        rs.insert(0, 0);
        assert_eq!(rs.len(), 1);
    }

    #[test]
    fn range_set_intersect_and_remove_split() {
        let mut rs = RangeSet::new();
        rs.insert(5120, 512);
        rs.insert(10240, 1024);

        // extent файловой системы 4 KiB вокруг сектора 10
        assert_eq!(rs.intersect(4096, 4096), vec![(5120, 512)]);
        assert_eq!(rs.intersect(0, 4096), vec![]);
        assert_eq!(rs.intersect(5000, 6000), vec![(5120, 512), (10240, 760)]);

        rs.remove(10496, 256);
        assert_eq!(
            rs.iter().collect::<Vec<_>>(),
            vec![(5120, 512), (10240, 256), (10752, 512)]
        );
        rs.remove(0, u64::MAX);
        assert!(rs.is_empty());
    }

    #[test]
    fn static_source_unknown_path_is_extent_failure() {
        let src = StaticExtentSource::new();
        let f = File::open(std::env::current_exe().unwrap()).unwrap();
        let err = src.query_extents(&f, Path::new("/nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RevertError>(),
            Some(RevertError::ExtentQueryFailed { .. })
        ));
    }
}
