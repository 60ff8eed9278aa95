//! Filesystem Formatting and Mounting
//!
//! Shell-out plumbing for putting a filesystem on a DRBD device and mounting
//! it. Formatting is guarded: a device that already carries a different
//! filesystem is never overwritten.

use crate::drbd::parse;
use crate::drbd::resource::{DrbdManage, Resource};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, info};

/// How many volume-list polls to spend waiting for the device before a
/// mount gives up.
const MOUNT_DEVICE_RETRIES: u32 = 3;

/// Filesystem utility for one resource.
pub struct FsUtil<'a> {
    dm: &'a DrbdManage,
    resource: Resource,
    fs_type: String,
}

impl<'a> FsUtil<'a> {
    pub fn new(dm: &'a DrbdManage, resource: Resource, fs_type: impl Into<String>) -> Self {
        Self {
            dm,
            resource,
            fs_type: fs_type.into(),
        }
    }

    /// Mount the resource's device at `target`, formatting it first if it is
    /// blank.
    pub fn mount(&self, target: &Path) -> Result<()> {
        let device = self
            .dm
            .wait_for_device_path(&self.resource, MOUNT_DEVICE_RETRIES)?;
        let device = device.to_string_lossy();

        self.safe_format(&device)?;

        let target_str = target.to_string_lossy();
        self.dm.run_checked("mkdir", &["-p", &target_str])?;
        self.dm.run_checked("mount", &[&device, &target_str])?;

        info!(resource = %self.resource.name, device = %device, target = %target_str,
              "mounted resource");
        Ok(())
    }

    /// Unmount `target`. Not a directory or not mounted both mean there is
    /// nothing to do.
    pub fn unmount(&self, target: &Path) -> Result<()> {
        if !target.is_dir() {
            return Ok(());
        }

        let target_str = target.to_string_lossy();
        match self.dm.run_lenient("findmnt", &["-f", &target_str]) {
            Ok(out) if out.success => {}
            _ => return Ok(()),
        }

        self.dm.run_checked("umount", &[&target_str])?;
        info!(resource = %self.resource.name, target = %target_str, "unmounted resource");
        Ok(())
    }

    /// Format `device` with the configured filesystem unless it already
    /// carries one. A matching filesystem is a no-op; a different one is
    /// refused.
    fn safe_format(&self, device: &str) -> Result<()> {
        let existing = self.probe_fs(device)?;

        if existing == self.fs_type {
            debug!(device, fs = %self.fs_type, "device already formatted");
            return Ok(());
        }

        if !existing.is_empty() {
            return Err(Error::FilesystemMismatch {
                device: device.to_string(),
                found: existing,
                wanted: self.fs_type.clone(),
            });
        }

        info!(device, fs = %self.fs_type, "formatting blank device");
        self.dm.run_checked("mkfs", &["-t", &self.fs_type, device])?;
        Ok(())
    }

    /// Probe the filesystem currently on `device`.
    ///
    /// blkid exits non-zero on a blank device while printing nothing, so the
    /// exit status is ignored and the output parsed regardless; an empty
    /// result means "unformatted".
    fn probe_fs(&self, device: &str) -> Result<String> {
        let out = self
            .dm
            .run_lenient("blkid", &["-o", "udev", device])
            .map(|o| o.text)
            .unwrap_or_default();
        parse::fs_type(&out)
    }
}
