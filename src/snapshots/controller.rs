//! Seams to the outside world: the snapshot controller (enable / deleted
//! query) and the device controller (unmount / consistency check).
//!
//! `CommandHooks` runs configured argv vectors directly (no shell); the
//! snapshot or device path is appended as the last argument.

use anyhow::Result;
use log::{debug, info};
use std::path::Path;
use std::process::Command;

use crate::config::RevertConfig;
use crate::error::RevertError;

pub trait SnapshotController {
    /// Make a snapshot readable as a file. Called right before it is opened.
    fn enable(&self, snapshot: &Path) -> Result<()>;

    /// True when the snapshot is tombstoned and must not be indexed.
    fn is_deleted(&self, snapshot: &Path) -> Result<bool>;
}

pub trait DeviceControl {
    /// Detach the filesystem before its device is rewritten.
    fn unmount(&self, device: &Path) -> Result<()>;

    /// Run the external consistency checker on the device.
    fn check(&self, device: &Path) -> Result<()>;
}

/// Everything enabled, nothing deleted, devices left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopController;

impl SnapshotController for NoopController {
    fn enable(&self, _snapshot: &Path) -> Result<()> {
        Ok(())
    }

    fn is_deleted(&self, _snapshot: &Path) -> Result<bool> {
        Ok(false)
    }
}

impl DeviceControl for NoopController {
    fn unmount(&self, _device: &Path) -> Result<()> {
        Ok(())
    }

    fn check(&self, _device: &Path) -> Result<()> {
        Ok(())
    }
}

/// Controller backed by external commands. Unset hooks are no-ops.
#[derive(Clone, Debug, Default)]
pub struct CommandHooks {
    pub enable: Option<Vec<String>>,
    pub deleted: Option<Vec<String>>,
    pub unmount: Option<Vec<String>>,
    pub fsck: Option<Vec<String>>,
}

impl CommandHooks {
    pub fn from_config(cfg: &RevertConfig) -> Self {
        Self {
            enable: cfg.enable_cmd.clone(),
            deleted: cfg.deleted_cmd.clone(),
            unmount: cfg.unmount_cmd.clone(),
            fsck: cfg.fsck_cmd.clone(),
        }
    }
}

fn describe(argv: &[String], target: &Path) -> String {
    format!("{} {}", argv.join(" "), target.display())
}

/// Run `argv + [target]`, returning whether it exited with status 0.
fn run_hook(argv: &[String], target: &Path) -> Result<bool> {
    let (prog, args) = argv.split_first().ok_or_else(|| RevertError::Hook {
        command: String::new(),
        reason: "empty command".into(),
    })?;
    debug!("hook: {}", describe(argv, target));
    let status = Command::new(prog)
        .args(args)
        .arg(target)
        .status()
        .map_err(|e| RevertError::Hook {
            command: describe(argv, target),
            reason: format!("spawn: {e}"),
        })?;
    Ok(status.success())
}

fn run_required(argv: &[String], target: &Path) -> Result<()> {
    if run_hook(argv, target)? {
        Ok(())
    } else {
        Err(RevertError::Hook {
            command: describe(argv, target),
            reason: "non-zero exit status".into(),
        }
        .into())
    }
}

impl SnapshotController for CommandHooks {
    fn enable(&self, snapshot: &Path) -> Result<()> {
        match &self.enable {
            Some(argv) => run_required(argv, snapshot),
            None => Ok(()),
        }
    }

    fn is_deleted(&self, snapshot: &Path) -> Result<bool> {
        match &self.deleted {
            Some(argv) => run_hook(argv, snapshot),
            None => Ok(false),
        }
    }
}

impl DeviceControl for CommandHooks {
    fn unmount(&self, device: &Path) -> Result<()> {
        match &self.unmount {
            Some(argv) => {
                info!("unmount: {}", describe(argv, device));
                run_required(argv, device)
            }
            None => Ok(()),
        }
    }

    fn check(&self, device: &Path) -> Result<()> {
        match &self.fsck {
            Some(argv) => {
                info!("consistency check: {}", describe(argv, device));
                run_required(argv, device)
            }
            None => Ok(()),
        }
    }
}
