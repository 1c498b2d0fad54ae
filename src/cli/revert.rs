use anyhow::Result;
use log::warn;
use serde_json::json;
use std::path::PathBuf;

use crate::config::RevertConfig;
use crate::extent::{platform_extent_source, DataScanExtentSource, ExtentSource};
use crate::metrics;
use crate::restore::RestoreEngine;
use crate::snapshots::{discover, CommandHooks};

use super::target_path;

pub fn cmd_revert(
    cfg: RevertConfig,
    snapshots: PathBuf,
    target: String,
    device: PathBuf,
    scan_diff: bool,
    json: bool,
) -> Result<()> {
    cfg.validate()?;
    let hooks = CommandHooks::from_config(&cfg);
    if hooks.unmount.is_none() {
        warn!(
            "revert: no unmount hook configured (SNAPREVERT_UNMOUNT_CMD); {} must not be mounted",
            device.display()
        );
    }
    let extents = platform_extent_source()?;
    let scan = DataScanExtentSource::new(cfg.sector_size as u64);

    let index = discover(&snapshots, &hooks)?;
    let target = target_path(&snapshots, &target);

    metrics::reset();
    let mut engine = RestoreEngine::new(&cfg, extents.as_ref(), &hooks, &hooks)?;
    if scan_diff {
        engine = engine.with_diff_extents(&scan as &dyn ExtentSource);
    }
    let r = engine.restore(&index, &target, &device)?;

    if json {
        let doc = json!({
            "report": r,
            "metrics": metrics::snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Reverted {} to {}", r.device.display(), r.target.display());
    println!("  snapshots_walked  = {}", r.diff.snapshots_walked);
    println!("  extents_diverging = {}", r.diff.extents_diverging);
    println!("  diff_bytes        = {}", r.diff.bytes_written);
    println!("  extents_replayed  = {}", r.replay.extents_replayed);
    println!("  bytes_replayed    = {}", r.replay.bytes_replayed);
    println!("  unmapped_bytes    = {}", r.replay.unmapped_bytes);
    println!("  checked           = {}", r.checked);
    if r.diff_image_kept {
        println!("  diff_image        = {} (kept)", r.diff_image.display());
    }
    Ok(())
}
