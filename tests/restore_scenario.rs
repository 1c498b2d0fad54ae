use anyhow::{anyhow, Result};
use oorandom::Rand64;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use snaprevert::config::RevertConfig;
use snaprevert::error::RevertError;
use snaprevert::extent::{DataScanExtentSource, Extent, StaticExtentSource};
use snaprevert::restore::RestoreEngine;
use snaprevert::snapshots::{DeviceControl, NoopController, SnapshotIndex};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("snaprevert-restore-{prefix}-{pid}-{t}-{id}"))
}

const SS: u64 = 512;
const SHIFT: u64 = 4 * SS;
const COW_AREA: u64 = 1 << 30;
const DEVICE_BLOCKS: u64 = 64;

fn fill_byte(snap: u64, block: u64) -> u8 {
    ((snap * 31 + block) % 250) as u8 + 1
}

/// Исходное содержимое устройства: 0xD0 ^ номер блока.
fn device_byte(block: u64) -> u8 {
    0xD0 ^ (block as u8)
}

fn write_device(path: &Path, blocks: u64) -> Result<()> {
    let mut data = Vec::with_capacity((blocks * SS) as usize);
    for b in 0..blocks {
        data.extend(std::iter::repeat(device_byte(b)).take(SS as usize));
    }
    fs::write(path, data)?;
    Ok(())
}

fn read_block(path: &Path, block: u64) -> Result<Vec<u8>> {
    let all = fs::read(path)?;
    let off = (block * SS) as usize;
    Ok(all[off..off + SS as usize].to_vec())
}

fn write_snapshot(path: &Path, snap: u64, blocks: &[u64]) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    for &b in blocks {
        f.seek(SeekFrom::Start(SHIFT + b * SS))?;
        f.write_all(&vec![fill_byte(snap, b); SS as usize])?;
    }
    Ok(())
}

fn build_chain(root: &Path, chain: &[(u64, Vec<u64>)]) -> Result<(SnapshotIndex, StaticExtentSource)> {
    let mut idx = SnapshotIndex::new();
    let mut src = StaticExtentSource::new();
    for (v, blocks) in chain {
        let p = root.join(format!("snap.{v}"));
        write_snapshot(&p, *v, blocks)?;
        let exts = blocks
            .iter()
            .map(|&b| Extent::new(SHIFT + b * SS, COW_AREA + b * SS, SS))
            .collect();
        src.insert(p.clone(), exts);
        idx.insert(p, *v);
    }
    Ok((idx, src))
}

/// v1 {10,20}, v2 {20,30}, v3 {30,40}.
fn scenario(root: &Path) -> Result<(SnapshotIndex, StaticExtentSource)> {
    build_chain(
        root,
        &[(1, vec![10, 20]), (2, vec![20, 30]), (3, vec![30, 40])],
    )
}

fn cfg(root: &Path) -> RevertConfig {
    RevertConfig::default()
        .with_sector_size(SS as u32)
        .with_snapshot_shift(SHIFT)
        .with_diff_image(root.join("diff.img"))
        .with_copy_buffer_bytes(1000)
}

/// Журнал вызовов unmount/check; unmount может падать.
#[derive(Default)]
struct DeviceLog {
    calls: RefCell<Vec<String>>,
    fail_unmount: bool,
}

impl DeviceControl for DeviceLog {
    fn unmount(&self, device: &Path) -> Result<()> {
        self.calls.borrow_mut().push(format!("unmount {}", device.display()));
        if self.fail_unmount {
            return Err(anyhow!("device busy"));
        }
        Ok(())
    }

    fn check(&self, device: &Path) -> Result<()> {
        self.calls.borrow_mut().push(format!("check {}", device.display()));
        Ok(())
    }
}

#[test]
fn scenario_restores_target_blocks_only() -> Result<()> {
    let root = unique_root("scenario");
    fs::create_dir_all(&root)?;
    let (idx, src) = scenario(&root)?;
    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;

    let c = cfg(&root);
    let scan = DataScanExtentSource::new(SS);
    let log = DeviceLog::default();
    let mut engine = RestoreEngine::new(&c, &src, &NoopController, &log)?.with_diff_extents(&scan);
    let r = engine.restore(&idx, &root.join("snap.3"), &dev)?;

    assert_eq!(r.diff.snapshots_walked, 3);
    assert_eq!(r.diff.extents_diverging, 6);
    // 10, 20, 30, 40: отдельные extents в diff-образе
    assert_eq!(r.replay.extents_replayed, 4);
    assert_eq!(r.replay.bytes_replayed, 4 * SS);
    assert_eq!(r.replay.unmapped_bytes, 0);
    assert!(r.checked);
    assert!(!r.diff_image_kept);
    assert!(!c.diff_image.exists(), "diff image must be removed");

    assert_eq!(
        *log.calls.borrow(),
        vec![format!("unmount {}", dev.display()), format!("check {}", dev.display())]
    );

    let want = [(10u64, 1u64), (20, 2), (30, 3), (40, 3)];
    for (block, snap) in want {
        assert_eq!(read_block(&dev, block)?, vec![fill_byte(snap, block); SS as usize], "block {block}");
    }
    for block in (0..DEVICE_BLOCKS).filter(|b| ![10, 20, 30, 40].contains(b)) {
        assert_eq!(read_block(&dev, block)?, vec![device_byte(block); SS as usize], "block {block}");
    }
    assert_eq!(fs::metadata(&dev)?.len(), DEVICE_BLOCKS * SS);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn restore_to_middle_snapshot_keeps_diff_when_asked() -> Result<()> {
    let root = unique_root("middle");
    fs::create_dir_all(&root)?;
    let (idx, src) = scenario(&root)?;
    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;

    let c = cfg(&root).with_keep_diff_image(true).with_check_after_revert(false);
    let scan = DataScanExtentSource::new(SS);
    let log = DeviceLog::default();
    let mut engine = RestoreEngine::new(&c, &src, &NoopController, &log)?.with_diff_extents(&scan);
    let r = engine.restore(&idx, &root.join("snap.2"), &dev)?;

    assert_eq!(r.diff.snapshots_walked, 2);
    assert!(!r.checked);
    assert!(r.diff_image_kept);
    assert_eq!(log.calls.borrow().len(), 1);

    // diff-образ в координатах устройства, без сдвига
    let diff = fs::read(&c.diff_image)?;
    assert_eq!(diff.len() as u64, 31 * SS);
    assert_eq!(diff[(20 * SS) as usize], fill_byte(2, 20));
    assert_eq!(diff[(10 * SS) as usize], fill_byte(1, 10));
    assert_eq!(diff[0], 0);

    assert_eq!(read_block(&dev, 10)?[0], fill_byte(1, 10));
    assert_eq!(read_block(&dev, 20)?[0], fill_byte(2, 20));
    assert_eq!(read_block(&dev, 30)?[0], fill_byte(2, 30));
    assert_eq!(read_block(&dev, 40)?[0], device_byte(40));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn failed_unmount_leaves_device_untouched() -> Result<()> {
    let root = unique_root("unmount");
    fs::create_dir_all(&root)?;
    let (idx, src) = scenario(&root)?;
    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;
    let before = fs::read(&dev)?;

    let c = cfg(&root);
    let scan = DataScanExtentSource::new(SS);
    let log = DeviceLog {
        fail_unmount: true,
        ..DeviceLog::default()
    };
    let mut engine = RestoreEngine::new(&c, &src, &NoopController, &log)?.with_diff_extents(&scan);
    let err = engine.restore(&idx, &root.join("snap.3"), &dev).unwrap_err();
    assert!(format!("{err:#}").contains("device busy"));

    assert_eq!(fs::read(&dev)?, before);
    assert_eq!(log.calls.borrow().len(), 1);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn unknown_target_is_rejected_before_any_write() -> Result<()> {
    let root = unique_root("not-found");
    fs::create_dir_all(&root)?;
    let (idx, src) = scenario(&root)?;
    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;

    let c = cfg(&root);
    let log = DeviceLog::default();
    let mut engine = RestoreEngine::new(&c, &src, &NoopController, &log)?;
    let err = engine.restore(&idx, &root.join("snap.7"), &dev).unwrap_err();
    assert!(matches!(err.downcast_ref::<RevertError>(), Some(RevertError::NotFound(_))));
    assert!(!c.diff_image.exists());
    assert!(log.calls.borrow().is_empty());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn random_chains_restore_to_target_content() -> Result<()> {
    let mut rng = Rand64::new(0xB10C_5EED);
    for round in 0..6 {
        let root = unique_root(&format!("random-{round}"));
        fs::create_dir_all(&root)?;

        let snaps = 1 + rng.rand_range(0..5);
        let mut chain = Vec::new();
        for v in 1..=snaps {
            let mut blocks: Vec<u64> = (0..rng.rand_range(1..20))
                .map(|_| rng.rand_range(0..DEVICE_BLOCKS))
                .collect();
            blocks.sort_unstable();
            blocks.dedup();
            chain.push((v, blocks));
        }
        let (idx, src) = build_chain(&root, &chain)?;
        let target = 1 + rng.rand_range(0..snaps);

        // ожидание: последняя запись (от старого к цели) побеждает
        let mut expect: BTreeMap<u64, u64> = BTreeMap::new();
        for (v, blocks) in chain.iter().filter(|(v, _)| *v <= target) {
            for &b in blocks {
                expect.insert(b, *v);
            }
        }

        let dev = root.join("device.img");
        write_device(&dev, DEVICE_BLOCKS)?;

        let c = cfg(&root).with_check_after_revert(false);
        let scan = DataScanExtentSource::new(SS);
        let mut engine =
            RestoreEngine::new(&c, &src, &NoopController, &NoopController)?.with_diff_extents(&scan);
        engine.restore(&idx, &root.join(format!("snap.{target}")), &dev)?;

        for b in 0..DEVICE_BLOCKS {
            let want = match expect.get(&b) {
                Some(&v) => fill_byte(v, b),
                None => device_byte(b),
            };
            assert_eq!(read_block(&dev, b)?, vec![want; SS as usize], "round {round} block {b}");
        }

        let _ = fs::remove_dir_all(&root);
    }
    Ok(())
}

#[test]
fn zero_filled_target_block_is_replayed() -> Result<()> {
    let root = unique_root("zero-block");
    fs::create_dir_all(&root)?;

    // snap.1: блок 10 записан нулями, блок 20 обычными данными
    let snap = root.join("snap.1");
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&snap)?;
    f.seek(SeekFrom::Start(SHIFT + 10 * SS))?;
    f.write_all(&vec![0u8; SS as usize])?;
    f.seek(SeekFrom::Start(SHIFT + 20 * SS))?;
    f.write_all(&vec![fill_byte(1, 20); SS as usize])?;
    drop(f);

    let src = StaticExtentSource::new().with(
        snap.clone(),
        vec![
            Extent::new(SHIFT + 10 * SS, COW_AREA + 10 * SS, SS),
            Extent::new(SHIFT + 20 * SS, COW_AREA + 20 * SS, SS),
        ],
    );
    let mut idx = SnapshotIndex::new();
    idx.insert(snap.clone(), 1);

    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;

    let c = cfg(&root).with_check_after_revert(false);
    let scan = DataScanExtentSource::new(SS);
    let mut engine =
        RestoreEngine::new(&c, &src, &NoopController, &NoopController)?.with_diff_extents(&scan);
    let r = engine.restore(&idx, &snap, &dev)?;

    // сканер видит только блок 20; блок 10 берётся из записанных диапазонов
    assert_eq!(r.replay.bytes_replayed, 2 * SS);
    assert_eq!(r.replay.unmapped_bytes, SS);
    assert_eq!(read_block(&dev, 10)?, vec![0u8; SS as usize]);
    assert_eq!(read_block(&dev, 20)?, vec![fill_byte(1, 20); SS as usize]);
    for block in (0..DEVICE_BLOCKS).filter(|b| ![10, 20].contains(b)) {
        assert_eq!(read_block(&dev, block)?, vec![device_byte(block); SS as usize], "block {block}");
    }

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn fiemap_diff_source_leaves_neighbour_sectors_alone() -> Result<()> {
    use snaprevert::extent::ExtentSource;
    use snaprevert::fiemap::FiemapExtentSource;

    let root = unique_root("fiemap-diff");
    fs::create_dir_all(&root)?;

    // временный каталог без FIEMAP (tmpfs): проверять нечего
    let scratch = root.join("scratch.bin");
    fs::write(&scratch, vec![1u8; 4096])?;
    if FiemapExtentSource::new()
        .query_extents(&fs::File::open(&scratch)?, &scratch)
        .is_err()
    {
        let _ = fs::remove_dir_all(&root);
        return Ok(());
    }

    // сектор 512 меньше блока файловой системы: extent diff-образа
    // накрывает соседние незаписанные секторы
    let (idx, src) = build_chain(&root, &[(1, vec![10])])?;
    let dev = root.join("device.img");
    write_device(&dev, DEVICE_BLOCKS)?;

    let c = cfg(&root).with_check_after_revert(false);
    let fiemap = FiemapExtentSource::new();
    let mut engine =
        RestoreEngine::new(&c, &src, &NoopController, &NoopController)?.with_diff_extents(&fiemap);
    let r = engine.restore(&idx, &root.join("snap.1"), &dev)?;

    assert_eq!(r.replay.bytes_replayed, SS);
    assert_eq!(read_block(&dev, 10)?, vec![fill_byte(1, 10); SS as usize]);
    for block in (0..DEVICE_BLOCKS).filter(|&b| b != 10) {
        assert_eq!(read_block(&dev, block)?, vec![device_byte(block); SS as usize], "block {block}");
    }

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn missing_device_is_io_error() -> Result<()> {
    let root = unique_root("no-device");
    fs::create_dir_all(&root)?;
    let (idx, src) = scenario(&root)?;
    let dev = root.join("absent.img");

    let c = cfg(&root).with_check_after_revert(false);
    let scan = DataScanExtentSource::new(SS);
    let mut engine =
        RestoreEngine::new(&c, &src, &NoopController, &NoopController)?.with_diff_extents(&scan);
    let err = engine.restore(&idx, &root.join("snap.3"), &dev).unwrap_err();
    assert!(matches!(err.downcast_ref::<RevertError>(), Some(RevertError::Io { .. })));
    // устройство не создаётся
    assert!(!dev.exists());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
