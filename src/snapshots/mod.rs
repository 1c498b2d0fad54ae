//! Snapshots module split into submodules:
//! - mod.rs: SnapshotIndex, an arena of versions chained newest -> oldest by index links.
//! - discovery.rs: building an index from a snapshot directory.
//! - controller.rs: SnapshotController / DeviceControl traits and their adapters.
//!
//! Walk directions:
//! - target -> oldest (`next` links) is used by the exception store export;
//! - oldest -> target (`prev` links) is used by the diff accumulation of revert.

use anyhow::Result;
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::error::RevertError;

pub mod controller;
mod discovery;

pub use controller::{CommandHooks, DeviceControl, NoopController, SnapshotController};
pub use discovery::{discover, parse_version_id};

/// One discovered snapshot. Links are arena slots of the neighbours:
/// `prev` is the next newer version, `next` the next older one.
#[derive(Clone, Debug)]
pub struct SnapshotVersion {
    path: PathBuf,
    version_id: u64,
    slot: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl SnapshotVersion {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Slot of the next newer version.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    /// Slot of the next older version.
    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

#[derive(Clone, Debug, Default)]
pub struct SnapshotIndex {
    arena: Vec<SnapshotVersion>,
    head: Option<usize>, // newest
    tail: Option<usize>, // oldest
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&SnapshotVersion> {
        self.arena.get(slot)
    }

    pub fn newest(&self) -> Option<&SnapshotVersion> {
        self.head.map(|s| &self.arena[s])
    }

    pub fn oldest(&self) -> Option<&SnapshotVersion> {
        self.tail.map(|s| &self.arena[s])
    }

    /// Insert a version keeping descending `version_id` order. Versions with
    /// an equal id keep their insertion order. Returns the arena slot.
    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, version_id: u64) -> usize {
        let slot = self.arena.len();

        // Search from the head for the first strictly older version.
        let mut before: Option<usize> = None; // newer neighbour
        let mut cur = self.head;
        while let Some(c) = cur {
            if self.arena[c].version_id < version_id {
                break;
            }
            before = Some(c);
            cur = self.arena[c].next;
        }
        let after = cur; // older neighbour

        self.arena.push(SnapshotVersion {
            path: path.into(),
            version_id,
            slot,
            prev: before,
            next: after,
        });

        match before {
            Some(b) => self.arena[b].next = Some(slot),
            None => self.head = Some(slot),
        }
        match after {
            Some(a) => self.arena[a].prev = Some(slot),
            None => self.tail = Some(slot),
        }

        debug!(
            "snapshot index: inserted {} (version {}) at slot {}",
            self.arena[slot].path.display(),
            version_id,
            slot
        );
        slot
    }

    /// Insert unless the snapshot controller flagged it as deleted.
    pub fn insert_entry<P: Into<PathBuf>>(
        &mut self,
        path: P,
        version_id: u64,
        deleted: bool,
    ) -> Option<usize> {
        let path = path.into();
        if deleted {
            info!(
                "snapshot index: skip deleted snapshot {} (version {})",
                path.display(),
                version_id
            );
            return None;
        }
        Some(self.insert(path, version_id))
    }

    /// Find the version whose path equals `path`.
    pub fn resolve_target(&self, path: &Path) -> Result<&SnapshotVersion> {
        self.iter_newest_first()
            .find(|v| v.path == path)
            .ok_or_else(|| RevertError::NotFound(path.to_path_buf()).into())
    }

    /// All versions, newest first.
    pub fn iter_newest_first(&self) -> Chain<'_> {
        Chain {
            index: self,
            cur: self.head,
            stop: None,
            dir: Direction::Older,
        }
    }

    /// Target, then every older version down to the oldest.
    pub fn iterate_from_target_to_oldest(&self, target: &SnapshotVersion) -> Chain<'_> {
        Chain {
            index: self,
            cur: Some(target.slot),
            stop: None,
            dir: Direction::Older,
        }
    }

    /// Oldest version up to and including the target.
    pub fn iterate_oldest_to_target(&self, target: &SnapshotVersion) -> Chain<'_> {
        Chain {
            index: self,
            cur: self.tail,
            stop: Some(target.slot),
            dir: Direction::Newer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Older,
    Newer,
}

/// Lazy walk over the version chain. Cloning restarts from the clone point.
#[derive(Clone, Debug)]
pub struct Chain<'a> {
    index: &'a SnapshotIndex,
    cur: Option<usize>,
    stop: Option<usize>,
    dir: Direction,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a SnapshotVersion;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cur?;
        let v = &self.index.arena[slot];
        self.cur = if self.stop == Some(slot) {
            None
        } else {
            match self.dir {
                Direction::Older => v.next,
                Direction::Newer => v.prev,
            }
        };
        Some(v)
    }
}
