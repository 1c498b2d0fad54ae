//! Linux FIEMAP extent source, backed by the `blkmap` crate.
//!
//! blkmap walks the whole file in batches and stops at the extent flagged
//! LAST. Filesystems without FIEMAP (tmpfs, some FUSE mounts) answer with
//! `ErrorKind::Unsupported`, surfaced here as `ExtentQueryFailed`.

use anyhow::Result;
use blkmap::{Fiemap, FiemapExtent};
use log::debug;
use std::fs::File;
use std::path::Path;

use crate::error::RevertError;
use crate::extent::{Extent, ExtentSource};

#[derive(Clone, Copy, Debug, Default)]
pub struct FiemapExtentSource;

impl FiemapExtentSource {
    pub fn new() -> Self {
        Self
    }
}

impl From<FiemapExtent> for Extent {
    fn from(fe: FiemapExtent) -> Self {
        Extent::new(fe.logical, fe.physical, fe.length)
    }
}

impl ExtentSource for FiemapExtentSource {
    fn query_extents(&self, file: &File, path: &Path) -> Result<Vec<Extent>> {
        let meta = file
            .metadata()
            .map_err(|e| RevertError::extent_query(path, format!("stat: {e}")))?;
        if !meta.is_file() {
            return Err(RevertError::extent_query(path, "not a regular file").into());
        }

        let raw = file
            .fiemap()
            .map_err(|e| RevertError::extent_query(path, format!("fiemap: {e}")))?;
        let out: Vec<Extent> = raw.into_iter().map(Extent::from).collect();

        debug!("fiemap: {} extent(s) in {}", out.len(), path.display());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    fn unique_root(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("snaprevert-fiemap-{prefix}-{pid}-{t}-{id}"))
    }

    /// The ioctl itself failed on a regular file: no FIEMAP in this temp dir.
    fn is_unsupported(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RevertError>(),
            Some(RevertError::ExtentQueryFailed { reason, .. }) if reason.starts_with("fiemap:")
        )
    }

    #[test]
    fn extents_cover_written_range() -> Result<()> {
        let root = unique_root("cover");
        fs::create_dir_all(&root)?;
        let path = root.join("data.bin");

        // 8 KiB данных со смещения 64 KiB, перед ними дыра
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        f.seek(SeekFrom::Start(64 * 1024))?;
        f.write_all(&vec![0x5Au8; 8 * 1024])?;
        f.sync_all()?;

        let list = match FiemapExtentSource::new().query_extents(&f, &path) {
            Ok(list) => list,
            // tmpfs и подобные: FIEMAP нет, проверять нечего
            Err(e) if is_unsupported(&e) => {
                let _ = fs::remove_dir_all(&root);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        assert!(!list.is_empty());
        let (start, end) = (64 * 1024u64, 72 * 1024u64);
        let mut covered = start;
        for e in &list {
            if e.logical_offset <= covered && e.logical_offset + e.length > covered {
                covered = e.logical_offset + e.length;
            }
        }
        assert!(covered >= end, "written range [{start}, {end}) not covered: {list:?}");
        // дыра в начале файла не отображается
        assert!(list.iter().all(|e| e.logical_offset + e.length > 32 * 1024));

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn empty_file_has_no_extents() -> Result<()> {
        let root = unique_root("empty");
        fs::create_dir_all(&root)?;
        let path = root.join("empty.bin");
        fs::write(&path, b"")?;

        let f = File::open(&path)?;
        match FiemapExtentSource::new().query_extents(&f, &path) {
            Ok(list) => assert!(list.is_empty()),
            Err(e) if is_unsupported(&e) => {}
            Err(e) => return Err(e),
        }

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn directory_is_rejected() -> Result<()> {
        let root = unique_root("dir");
        fs::create_dir_all(&root)?;

        let f = File::open(&root)?;
        let err = FiemapExtentSource::new()
            .query_extents(&f, &root)
            .unwrap_err();
        match err.downcast_ref::<RevertError>() {
            Some(RevertError::ExtentQueryFailed { reason, .. }) => {
                assert!(reason.contains("not a regular file"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }
}
