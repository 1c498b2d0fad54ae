use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use crate::config::RevertConfig;
use crate::cow::export;
use crate::extent::platform_extent_source;
use crate::metrics;
use crate::snapshots::{discover, CommandHooks};

use super::target_path;

pub fn cmd_export(
    cfg: RevertConfig,
    snapshots: PathBuf,
    target: String,
    out: PathBuf,
    json: bool,
) -> Result<()> {
    cfg.validate()?;
    let hooks = CommandHooks::from_config(&cfg);
    let extents = platform_extent_source()?;

    let index = discover(&snapshots, &hooks)?;
    let target = target_path(&snapshots, &target);

    metrics::reset();
    let done = export(&index, &target, &out, &cfg, extents.as_ref(), &hooks)?;
    let r = &done.report;
    let m = metrics::snapshot();

    if json {
        let doc = json!({
            "report": r,
            "state": done.state,
            "dedup_ratio": m.dedup_ratio(),
            "metrics": m,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Exported {} -> {}", target.display(), out.display());
    println!("  sector_size       = {} bytes", r.sector_size);
    println!("  snapshots_walked  = {}", r.snapshots_walked);
    println!("  extents_seen      = {}", r.extents_seen);
    println!("  extents_diverging = {}", r.extents_diverging);
    println!("  exceptions        = {}", r.exceptions);
    println!("  dedup_hits        = {}", r.dedup_hits);
    println!("  dedup_ratio       = {:.3}", m.dedup_ratio());
    println!("  chunks_flushed    = {}", r.chunks_flushed);
    println!("  chunk_rereads     = {}", r.chunk_rereads);
    println!("  image_bytes       = {}", r.image_bytes);
    Ok(())
}
