//! Revert a device to a snapshot through a scratch diff image.
//!
//! Phase 1 (diff accumulation): walk oldest -> target and copy every diverging
//! snapshot extent into the diff image at its device offset. Later snapshots
//! overwrite earlier ones, so the version closest to the target wins.
//!
//! Phase 2 (device replay): unmount the device, enumerate the diff image's own
//! extents and copy every diverging one onto the device at the same offset,
//! clipped to the byte ranges phase 1 wrote. Written ranges the extent source
//! does not report (a data scan skips zero-filled blocks) are copied as well.
//! Blocks that never changed are not touched, even when the diff image's
//! filesystem maps them in the same block as a changed sector.
//!
//! Not transactional: a failure in phase 2 leaves the device partially
//! rewritten.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::RevertConfig;
use crate::error::RevertError;
use crate::extent::{ExtentSource, RangeSet};
use crate::metrics::{
    record_device_replay, record_diff_write, record_extent_diverging, record_snapshot_walked,
};
use crate::snapshots::{DeviceControl, SnapshotController, SnapshotIndex, SnapshotVersion};

#[derive(Clone, Debug, Default, Serialize)]
pub struct DiffStats {
    pub snapshots_walked: u64,
    pub extents_diverging: u64,
    pub bytes_written: u64,
    /// Device ranges present in the diff image, coalesced.
    #[serde(skip)]
    pub written: RangeSet,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplayStats {
    pub extents_replayed: u64,
    pub bytes_replayed: u64,
    /// Bytes replayed from written ranges the diff extent source did not report.
    pub unmapped_bytes: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoreReport {
    pub target: PathBuf,
    pub device: PathBuf,
    pub diff_image: PathBuf,
    pub diff: DiffStats,
    pub replay: ReplayStats,
    pub checked: bool,
    pub diff_image_kept: bool,
}

pub struct RestoreEngine<'a> {
    cfg: &'a RevertConfig,
    extents: &'a dyn ExtentSource,
    diff_extents: &'a dyn ExtentSource,
    snapshots: &'a dyn SnapshotController,
    device: &'a dyn DeviceControl,
    buf: Vec<u8>,
}

impl<'a> RestoreEngine<'a> {
    /// `extents` is used for snapshot files and, unless overridden with
    /// [`with_diff_extents`](Self::with_diff_extents), for the diff image too.
    pub fn new(
        cfg: &'a RevertConfig,
        extents: &'a dyn ExtentSource,
        snapshots: &'a dyn SnapshotController,
        device: &'a dyn DeviceControl,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            extents,
            diff_extents: extents,
            snapshots,
            device,
            buf: vec![0u8; cfg.copy_buffer_bytes],
        })
    }

    pub fn with_diff_extents(mut self, diff_extents: &'a dyn ExtentSource) -> Self {
        self.diff_extents = diff_extents;
        self
    }

    /// Phase 1: build the diff image from the oldest snapshot up to `target`.
    pub fn accumulate_diff(
        &mut self,
        index: &SnapshotIndex,
        target: &SnapshotVersion,
        diff_path: &Path,
    ) -> Result<DiffStats> {
        let mut diff = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(diff_path)
            .map_err(|e| RevertError::io(format!("create diff image {}", diff_path.display()), e))?;

        let shift = self.cfg.snapshot_shift;
        let mut stats = DiffStats::default();

        for version in index.iterate_oldest_to_target(target) {
            let path = version.path();
            self.snapshots
                .enable(path)
                .with_context(|| format!("enable snapshot {}", path.display()))?;
            let mut snap = File::open(path)
                .with_context(|| format!("open snapshot {}", path.display()))?;
            let list = self.extents.query_extents(&snap, path)?;

            stats.snapshots_walked += 1;
            record_snapshot_walked();
            let mut copied = 0u64;

            for ext in &list {
                if !ext.diverges(shift) {
                    continue;
                }
                let Some(dev_off) = ext.device_offset(shift) else {
                    continue;
                };
                stats.extents_diverging += 1;
                record_extent_diverging();

                copy_range(
                    &mut snap,
                    ext.logical_offset,
                    &mut diff,
                    dev_off,
                    ext.length,
                    &mut self.buf,
                )
                .with_context(|| {
                    format!(
                        "copy {} bytes of {} at {} into diff image at {}",
                        ext.length,
                        path.display(),
                        ext.logical_offset,
                        dev_off
                    )
                })?;
                copied += ext.length;
                stats.written.insert(dev_off, ext.length);
            }

            stats.bytes_written += copied;
            record_diff_write(copied);
            info!(
                "revert: diff <- snapshot {} (version {}): {} extent(s), {} byte(s)",
                path.display(),
                version.version_id(),
                list.len(),
                copied
            );
        }

        diff.sync_all()
            .with_context(|| format!("sync diff image {}", diff_path.display()))?;
        Ok(stats)
    }

    /// Phase 2: copy the `written` ranges of the diff image onto the device,
    /// walking them in the order of the diff image's diverging extents.
    pub fn replay_diff(
        &mut self,
        diff_path: &Path,
        device_path: &Path,
        written: &RangeSet,
    ) -> Result<ReplayStats> {
        let mut diff = File::open(diff_path)
            .with_context(|| format!("open diff image {}", diff_path.display()))?;
        let diff_len = diff.metadata()?.len();
        let list = self.diff_extents.query_extents(&diff, diff_path)?;

        let mut device = OpenOptions::new()
            .write(true)
            .open(device_path)
            .map_err(|e| RevertError::io(format!("open device {}", device_path.display()), e))?;

        let mut pending = written.clone();
        pending.remove(diff_len, u64::MAX - diff_len);

        let mut stats = ReplayStats::default();
        for ext in &list {
            // The diff image is a plain file in device coordinates: no shift.
            if !ext.diverges(0) {
                continue;
            }
            for (off, len) in pending.intersect(ext.logical_offset, ext.length) {
                self.replay_range(&mut diff, &mut device, device_path, off, len)?;
                stats.extents_replayed += 1;
                stats.bytes_replayed += len;
            }
            pending.remove(ext.logical_offset, ext.length);
        }

        if !pending.is_empty() {
            debug!(
                "revert: {} written range(s), {} byte(s) not reported by the diff extent source",
                pending.len(),
                pending.total_bytes()
            );
        }
        for (off, len) in pending.iter() {
            self.replay_range(&mut diff, &mut device, device_path, off, len)?;
            stats.extents_replayed += 1;
            stats.bytes_replayed += len;
            stats.unmapped_bytes += len;
        }

        device
            .sync_all()
            .with_context(|| format!("sync device {}", device_path.display()))?;
        Ok(stats)
    }

    fn replay_range(
        &mut self,
        diff: &mut File,
        device: &mut File,
        device_path: &Path,
        off: u64,
        len: u64,
    ) -> Result<()> {
        copy_range(diff, off, device, off, len, &mut self.buf).with_context(|| {
            format!("replay {} bytes at {} onto {}", len, off, device_path.display())
        })?;
        debug!("revert: replayed [{}..{})", off, off + len);
        record_device_replay(len);
        Ok(())
    }

    /// Full revert of `device_path` to `target`.
    pub fn restore(
        &mut self,
        index: &SnapshotIndex,
        target: &Path,
        device_path: &Path,
    ) -> Result<RestoreReport> {
        let target_version = index.resolve_target(target)?;
        let diff_path = self.cfg.diff_image.clone();
        info!(
            "revert: start, target={} (version {}), device={}, diff={}",
            target.display(),
            target_version.version_id(),
            device_path.display(),
            diff_path.display()
        );

        let diff = self.accumulate_diff(index, target_version, &diff_path)?;

        self.device
            .unmount(device_path)
            .with_context(|| format!("unmount {}", device_path.display()))?;

        let replay = self.replay_diff(&diff_path, device_path, &diff.written)?;

        let checked = if self.cfg.check_after_revert {
            self.device
                .check(device_path)
                .with_context(|| format!("consistency check of {}", device_path.display()))?;
            true
        } else {
            false
        };

        let kept = self.cfg.keep_diff_image;
        if !kept {
            if let Err(e) = fs::remove_file(&diff_path) {
                warn!("revert: cannot remove diff image {}: {}", diff_path.display(), e);
            }
        }

        info!(
            "revert: done, extents={}, bytes={}, device={}",
            replay.extents_replayed,
            replay.bytes_replayed,
            device_path.display()
        );

        Ok(RestoreReport {
            target: target.to_path_buf(),
            device: device_path.to_path_buf(),
            diff_image: diff_path,
            diff,
            replay,
            checked,
            diff_image_kept: kept,
        })
    }
}

/// Copy `len` bytes from `src@src_off` to `dst@dst_off` through `buf`.
/// A source that ends early is treated as zeroes.
fn copy_range(
    src: &mut File,
    src_off: u64,
    dst: &mut File,
    dst_off: u64,
    len: u64,
    buf: &mut [u8],
) -> Result<()> {
    src.seek(SeekFrom::Start(src_off))?;
    dst.seek(SeekFrom::Start(dst_off))?;
    let mut left = len;
    while left > 0 {
        let want = (buf.len() as u64).min(left) as usize;
        let mut filled = 0;
        while filled < want {
            let n = src.read(&mut buf[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..want].fill(0);
        dst.write_all(&buf[..want])?;
        left -= want as u64;
    }
    Ok(())
}
