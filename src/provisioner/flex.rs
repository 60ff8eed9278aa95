//! Flexvolume Provisioner
//!
//! Creates DRBD-backed PersistentVolumes for pending claims and tears the
//! resources down again when their volumes are released. The blocking DRBD
//! client is bridged into the async world with `spawn_blocking`.

use crate::drbd::{DrbdManage, Resource};
use crate::error::{Error, Result};
use crate::provisioner::options::VolumeOptions;
use k8s_openapi::api::core::v1::{
    FlexPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Annotations
// =============================================================================

/// Marks volumes created by a dynamic provisioner.
pub const ANN_CREATED_BY: &str = "kubernetes.io/createdby";
/// Value written under [`ANN_CREATED_BY`].
pub const CREATED_BY: &str = "flex-dynamic-provisioner";
/// Records which provisioner instance owns a volume.
pub const ANN_PROVISIONER_ID: &str = "flexProvisionerIdentity";

// =============================================================================
// Configuration
// =============================================================================

/// Settings for the provisioner surface.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Provisioner name claims select via their StorageClass.
    pub name: String,
    /// Default flexvolume driver recorded on volumes.
    pub driver: String,
    /// Replica count used when the StorageClass does not set one.
    pub default_redundancy: String,
    /// Filesystem used when the StorageClass does not set one.
    pub default_fs: String,
    /// Identity written into [`ANN_PROVISIONER_ID`]; only volumes carrying
    /// this identity are deleted by this instance.
    pub identity: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            name: "external/drbd".to_string(),
            driver: "linbit/drbd-flexvolume".to_string(),
            default_redundancy: "2".to_string(),
            default_fs: "ext4".to_string(),
            identity: "drbd-flex-provisioner".to_string(),
        }
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Dynamic provisioner backed by a DRBD Manage cluster.
pub struct FlexProvisioner {
    config: ProvisionerConfig,
    drbd: Arc<DrbdManage>,
}

impl FlexProvisioner {
    pub fn new(config: ProvisionerConfig, drbd: Arc<DrbdManage>) -> Self {
        Self { config, drbd }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Provision a volume for `pvc` and return the PersistentVolume to
    /// create. `params` are the claim's StorageClass parameters.
    pub async fn provision(
        &self,
        pv_name: &str,
        pvc: &PersistentVolumeClaim,
        params: &BTreeMap<String, String>,
    ) -> Result<PersistentVolume> {
        let opts = VolumeOptions::from_claim(
            pvc,
            params,
            &self.config.default_redundancy,
            &self.config.default_fs,
            &self.config.driver,
        )?;

        info!(
            resource = %opts.resource_name,
            kib = opts.requested_kib,
            redundancy = %opts.redundancy,
            "provisioning volume"
        );

        let drbd = self.drbd.clone();
        let resource =
            Resource::new(opts.resource_name.as_str()).with_redundancy(opts.redundancy.as_str());
        let size_kib = opts.requested_kib;
        tokio::task::spawn_blocking(move || drbd.create(&resource, size_kib))
            .await
            .map_err(|e| Error::Configuration(format!("provision task failed: {e}")))??;

        Ok(self.build_pv(pv_name, pvc, &opts))
    }

    /// Tear down the DRBD resource behind a released volume.
    ///
    /// Volumes provisioned by a different instance are refused with an
    /// ignorable error so several provisioners can share a cluster.
    pub async fn delete(&self, pv: &PersistentVolume) -> Result<()> {
        let name = pv.metadata.name.as_deref().unwrap_or_default().to_string();

        let identity = pv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_PROVISIONER_ID))
            .cloned()
            .unwrap_or_default();
        if identity != self.config.identity {
            return Err(Error::ForeignVolume {
                volume: name,
                owner: identity,
            });
        }

        let resource_name = pv
            .spec
            .as_ref()
            .and_then(|s| s.flex_volume.as_ref())
            .and_then(|f| f.options.as_ref())
            .and_then(|o| o.get("resource"))
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!("volume {name} records no DRBD resource"))
            })?;

        info!(volume = %name, resource = %resource_name, "deleting volume");

        let drbd = self.drbd.clone();
        tokio::task::spawn_blocking(move || drbd.remove(&Resource::new(resource_name)))
            .await
            .map_err(|e| Error::Configuration(format!("delete task failed: {e}")))??;

        Ok(())
    }

    fn build_pv(
        &self,
        pv_name: &str,
        pvc: &PersistentVolumeClaim,
        opts: &VolumeOptions,
    ) -> PersistentVolume {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_CREATED_BY.to_string(), CREATED_BY.to_string());
        annotations.insert(
            ANN_PROVISIONER_ID.to_string(),
            self.config.identity.clone(),
        );

        let mut flex_options = BTreeMap::new();
        flex_options.insert("resource".to_string(), opts.resource_name.clone());
        if !opts.mount_opts.is_empty() {
            flex_options.insert("mountOpts".to_string(), opts.mount_opts.clone());
        }
        if !opts.fs_opts.is_empty() {
            flex_options.insert("fsOpts".to_string(), opts.fs_opts.clone());
        }

        let access_modes = pvc
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default();

        let claim_ref = ObjectReference {
            kind: Some("PersistentVolumeClaim".to_string()),
            namespace: pvc.metadata.namespace.clone(),
            name: pvc.metadata.name.clone(),
            uid: pvc.metadata.uid.clone(),
            api_version: Some("v1".to_string()),
            ..Default::default()
        };

        debug!(volume = pv_name, "built PersistentVolume object");

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(pv_name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(access_modes),
                capacity: Some(
                    [(
                        "storage".to_string(),
                        Quantity(format!("{}Ki", opts.requested_kib)),
                    )]
                    .into_iter()
                    .collect(),
                ),
                persistent_volume_reclaim_policy: Some("Delete".to_string()),
                claim_ref: Some(claim_ref),
                flex_volume: Some(FlexPersistentVolumeSource {
                    driver: opts.driver.clone(),
                    fs_type: Some(opts.fs_type.clone()),
                    options: Some(flex_options),
                    read_only: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drbd::resource::tests::{instant_config, FakeRunner};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};

    fn claim(namespace: &str, name: &str, storage: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: Some(name.into()),
                uid: Some("uid-1234".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity(storage.into()))]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn provisioner(responses: Vec<crate::drbd::CmdOutput>) -> (FlexProvisioner, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new(responses));
        let drbd = Arc::new(DrbdManage::with_runner(
            Box::new(runner.clone()),
            instant_config(),
        ));
        (
            FlexProvisioner::new(ProvisionerConfig::default(), drbd),
            runner,
        )
    }

    #[tokio::test]
    async fn test_provision_builds_volume() {
        let (p, runner) = provisioner(vec![
            FakeRunner::ok("1048576,"),                           // list-free-space
            FakeRunner::ok("Operation completed successfully"),   // add-volume
            FakeRunner::ok("res,node1,,connect,connect"),         // list-assignments
        ]);
        let pvc = claim("apps", "db-data", "1Mi");

        let pv = p
            .provision("pvc-abc", &pvc, &BTreeMap::new())
            .await
            .unwrap();

        let calls = runner.recorded();
        assert_eq!(calls[0], "drbdmanage list-free-space -m 2");
        assert_eq!(
            calls[1],
            "drbdmanage add-volume apps-db-data 1024KiB --deploy 2"
        );

        assert_eq!(pv.metadata.name.as_deref(), Some("pvc-abc"));
        let anns = pv.metadata.annotations.as_ref().unwrap();
        assert_eq!(anns.get(ANN_CREATED_BY).unwrap(), CREATED_BY);
        assert_eq!(anns.get(ANN_PROVISIONER_ID).unwrap(), "drbd-flex-provisioner");

        let spec = pv.spec.as_ref().unwrap();
        assert_eq!(
            spec.persistent_volume_reclaim_policy.as_deref(),
            Some("Delete")
        );
        assert_eq!(
            spec.capacity.as_ref().unwrap().get("storage").unwrap().0,
            "1024Ki"
        );
        let flex = spec.flex_volume.as_ref().unwrap();
        assert_eq!(flex.driver, "linbit/drbd-flexvolume");
        assert_eq!(
            flex.options.as_ref().unwrap().get("resource").unwrap(),
            "apps-db-data"
        );
        let claim_ref = spec.claim_ref.as_ref().unwrap();
        assert_eq!(claim_ref.namespace.as_deref(), Some("apps"));
        assert_eq!(claim_ref.uid.as_deref(), Some("uid-1234"));
    }

    #[test]
    fn test_built_volume_serializes_cleanly() {
        let (p, _) = provisioner(vec![]);
        let pvc = claim("apps", "db-data", "1Mi");
        let pv = p.build_pv("pvc-abc", &pvc, &VolumeOptions {
            resource_name: "apps-db-data".into(),
            requested_kib: 1024,
            redundancy: "2".into(),
            fs_type: "ext4".into(),
            driver: "linbit/drbd-flexvolume".into(),
            mount_opts: "noatime".into(),
            fs_opts: String::new(),
            node_list: String::new(),
        });

        let manifest = serde_json::to_value(&pv).unwrap();
        assert_eq!(manifest["spec"]["flexVolume"]["driver"], "linbit/drbd-flexvolume");
        assert_eq!(manifest["spec"]["flexVolume"]["options"]["mountOpts"], "noatime");
        assert_eq!(manifest["spec"]["capacity"]["storage"], "1024Ki");
    }

    #[tokio::test]
    async fn test_provision_aborts_when_space_is_short() {
        let (p, runner) = provisioner(vec![FakeRunner::ok("512,")]);
        let pvc = claim("apps", "db-data", "1Mi");

        let err = p
            .provision("pvc-abc", &pvc, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::InsufficientFreeSpace { requested_kib: 1024, free_kib: 512 });
        assert_eq!(runner.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_resource() {
        let (p, runner) = provisioner(vec![FakeRunner::ok("")]);
        let pvc = claim("apps", "db-data", "1Mi");
        let pv = p.build_pv("pvc-abc", &pvc, &VolumeOptions {
            resource_name: "apps-db-data".into(),
            requested_kib: 1024,
            redundancy: "2".into(),
            fs_type: "ext4".into(),
            driver: "linbit/drbd-flexvolume".into(),
            mount_opts: String::new(),
            fs_opts: String::new(),
            node_list: String::new(),
        });

        p.delete(&pv).await.unwrap();

        let calls = runner.recorded();
        assert_eq!(calls[0], "drbdmanage remove-resource --quiet apps-db-data");
    }

    #[tokio::test]
    async fn test_delete_refuses_foreign_volume() {
        let (p, runner) = provisioner(vec![]);
        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-other".into()),
                annotations: Some(
                    [(ANN_PROVISIONER_ID.to_string(), "someone-else".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = p.delete(&pv).await.unwrap_err();
        assert_matches!(err, Error::ForeignVolume { ref owner, .. } if owner == "someone-else");
        assert!(err.is_ignorable());
        assert!(runner.recorded().is_empty());
    }
}
