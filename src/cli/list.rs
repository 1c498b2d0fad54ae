use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use crate::config::RevertConfig;
use crate::snapshots::{discover, CommandHooks};

pub fn cmd_list(snapshots: PathBuf, json: bool) -> Result<()> {
    let cfg = RevertConfig::from_env();
    let hooks = CommandHooks::from_config(&cfg);
    let index = discover(&snapshots, &hooks)?;

    if json {
        let items: Vec<_> = index
            .iter_newest_first()
            .map(|v| json!({ "version_id": v.version_id(), "path": v.path() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if index.is_empty() {
        println!("No snapshots in {}", snapshots.display());
        return Ok(());
    }
    println!("Snapshots in {} (newest first):", snapshots.display());
    for v in index.iter_newest_first() {
        println!("  {:>8}  {}", v.version_id(), v.path().display());
    }
    Ok(())
}
