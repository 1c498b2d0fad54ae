//! Snapshot discovery: every regular file in the snapshot directory whose
//! name ends in decimal digits is a version; the trailing number is its id
//! (`snap.12` -> 12, `snapshot-0007` -> 7).

use anyhow::Result;
use log::{debug, info};
use std::fs;
use std::path::Path;

use super::controller::SnapshotController;
use super::SnapshotIndex;
use crate::error::RevertError;

/// Parse the trailing decimal number of a file name.
pub fn parse_version_id(name: &str) -> Option<u64> {
    let digits = name
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse::<u64>().ok()
}

/// Build the index from `dir`. Snapshots the controller reports as deleted are
/// left out. Directory walk failures abort with `RevertError::Discovery`.
pub fn discover(dir: &Path, controller: &dyn SnapshotController) -> Result<SnapshotIndex> {
    let discovery_err = |e: std::io::Error| RevertError::Discovery {
        dir: dir.to_path_buf(),
        source: e,
    };

    let mut index = SnapshotIndex::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(discovery_err)?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(discovery_err)?;
    // read_dir order is filesystem-dependent; keep equal ids deterministic.
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let ft = entry.file_type().map_err(discovery_err)?;
        let path = entry.path();
        if !ft.is_file() {
            debug!("discover: skip non-file {}", path.display());
            continue;
        }
        let name = entry.file_name();
        let Some(version_id) = name.to_str().and_then(parse_version_id) else {
            debug!("discover: skip {} (no version number)", path.display());
            continue;
        };

        let deleted = controller.is_deleted(&path)?;
        index.insert_entry(path, version_id, deleted);
    }

    info!(
        "discover: {} snapshot(s) in {}",
        index.len(),
        dir.display()
    );
    Ok(index)
}
