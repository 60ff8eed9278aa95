//! DRBD Device Path Resolution
//!
//! A deployed volume surfaces locally as `/dev/drbd<minor>`. The minor
//! number is protocol truth from `list-volumes`; the path is derived, never
//! stored, and only trusted once it actually exists on the local filesystem.

use crate::drbd::parse;
use crate::drbd::poller::poll_until_ready;
use crate::drbd::resource::{DrbdManage, Resource};
use crate::error::{Error, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

impl DrbdManage {
    /// Find the resource (if any) behind an already-known device path.
    ///
    /// The path must look like a DRBD device before the minor is extracted
    /// and matched against the cluster-wide volume list.
    pub fn resource_name_from_device(&self, device: &str) -> Result<Option<String>> {
        let minor = parse::minor_from_device(device)?;
        let out = self.dm(&["list-volumes", "--machine-readable"])?;
        Ok(parse::resource_by_minor(&out, minor))
    }

    /// Resolve the live device path for a resource.
    ///
    /// One shot: look up the volume record, derive the path under the
    /// configured device root, and stat it. Any missing piece is an error so
    /// the wait below can keep trying.
    fn device_path(&self, res: &Resource) -> Result<PathBuf> {
        let out = self.dm(&[
            "list-volumes",
            "--resources",
            &res.name,
            "--machine-readable",
        ])?;

        let minor = parse::volume_minor_for_resource(&out, &res.name)?.ok_or_else(|| {
            Error::Protocol {
                output: out.clone(),
                expected: format!("a deployed volume record for resource {:?}", res.name),
            }
        })?;

        let path = self.config().dev_root.join(format!("drbd{minor}"));
        fs::symlink_metadata(&path).map_err(|e| Error::DeviceMissing {
            path: path.clone(),
            source: e,
        })?;

        debug!(resource = %res.name, path = %path.display(), "resolved device path");
        Ok(path)
    }

    /// Poll until the resource's device path appears on the local system.
    ///
    /// Absence after the full bounded wait is a hard failure carrying the
    /// path that never showed up, not an empty result.
    pub fn wait_for_device_path(&self, res: &Resource, max_retries: u32) -> Result<PathBuf> {
        let policy = self.config().device_policy.with_retries(max_retries);
        poll_until_ready(&policy, || self.device_path(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drbd::resource::tests::{instant_config, FakeRunner};
    use crate::drbd::resource::DrbdManage;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn client_with_dev_root(
        responses: Vec<crate::drbd::command::CmdOutput>,
        dev_root: PathBuf,
    ) -> DrbdManage {
        let mut config = instant_config();
        config.dev_root = dev_root;
        DrbdManage::with_runner(Box::new(Arc::new(FakeRunner::new(responses))), config)
    }

    #[test]
    fn test_resource_name_from_device() {
        let out = "res0,0,52428800,7,unknown,100,ok\nres1,0,52428800,7,unknown,101,ok";
        let dm = client_with_dev_root(vec![FakeRunner::ok(out)], PathBuf::from("/dev"));

        let name = dm.resource_name_from_device("/dev/drbd101").unwrap();
        assert_eq!(name.as_deref(), Some("res1"));
    }

    #[test]
    fn test_resource_name_from_non_drbd_device() {
        let dm = client_with_dev_root(vec![], PathBuf::from("/dev"));
        let err = dm.resource_name_from_device("/dev/sda1").unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[test]
    fn test_wait_for_device_path_present() {
        let dev_root = tempfile::tempdir().unwrap();
        std::fs::write(dev_root.path().join("drbd100"), b"").unwrap();

        let out = "res0,0,52428800,7,unknown,100,ok";
        let dm = client_with_dev_root(
            vec![FakeRunner::ok(out)],
            dev_root.path().to_path_buf(),
        );

        let path = dm
            .wait_for_device_path(&Resource::new("res0"), 3)
            .unwrap();
        assert_eq!(path, dev_root.path().join("drbd100"));
    }

    #[test]
    fn test_wait_for_device_path_absent_is_hard_failure() {
        let dev_root = tempfile::tempdir().unwrap();
        let out = FakeRunner::ok("res0,0,52428800,7,unknown,100,ok");
        // Budget of 2 plus the authoritative final fetch.
        let dm = client_with_dev_root(
            vec![out.clone(), out.clone(), out],
            dev_root.path().to_path_buf(),
        );

        let err = dm
            .wait_for_device_path(&Resource::new("res0"), 2)
            .unwrap_err();
        assert_matches!(err, Error::DeviceMissing { ref path, .. }
            if path.ends_with("drbd100"));
    }

    #[test]
    fn test_wait_for_device_path_without_volume_record() {
        let dev_root = tempfile::tempdir().unwrap();
        let empty = FakeRunner::ok("");
        let dm = client_with_dev_root(
            vec![empty.clone(), empty.clone(), empty],
            dev_root.path().to_path_buf(),
        );

        let err = dm
            .wait_for_device_path(&Resource::new("res0"), 2)
            .unwrap_err();
        assert_matches!(err, Error::Protocol { .. });
    }
}
