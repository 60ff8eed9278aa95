//! Provision Controller
//!
//! Watches the cluster for pending claims that select this provisioner and
//! for released volumes it created, and drives the [`FlexProvisioner`] to
//! satisfy them. Individual failures are logged and the watch continues; the
//! next event retries naturally.

use crate::error::{Error, Result};
use crate::provisioner::flex::FlexProvisioner;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Controller
// =============================================================================

/// Event loop that binds the provisioner to the Kubernetes API.
pub struct Controller {
    client: Client,
    provisioner: Arc<FlexProvisioner>,
}

impl Controller {
    pub fn new(client: Client, provisioner: Arc<FlexProvisioner>) -> Self {
        Self {
            client,
            provisioner,
        }
    }

    /// Run the claim and volume watches until one of them terminates.
    pub async fn run(self) -> Result<()> {
        info!(
            provisioner = %self.provisioner.config().name,
            "starting provision controller"
        );

        let controller = Arc::new(self);
        let claims = {
            let this = controller.clone();
            tokio::spawn(async move { this.watch_claims().await })
        };
        let volumes = {
            let this = controller.clone();
            tokio::spawn(async move { this.watch_volumes().await })
        };

        tokio::select! {
            res = claims => res.map_err(|e| Error::Configuration(format!("claim watch task failed: {e}")))?,
            res = volumes => res.map_err(|e| Error::Configuration(format!("volume watch task failed: {e}")))?,
        }
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Watch PersistentVolumeClaims and provision pending ones that select
    /// this provisioner through their StorageClass.
    async fn watch_claims(&self) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let mut stream = watcher(pvcs, watcher::Config::default())
            .default_backoff()
            .applied_objects()
            .boxed();

        while let Some(pvc) = stream.try_next().await? {
            if let Err(e) = self.reconcile_claim(&pvc).await {
                if e.is_ignorable() {
                    debug!(claim = %pvc.name_any(), error = %e, "skipping claim");
                } else {
                    error!(claim = %pvc.name_any(), error = %e, "failed to provision claim");
                }
            }
        }

        warn!("claim watch stream ended");
        Ok(())
    }

    async fn reconcile_claim(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let phase = pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        if phase != "Pending" {
            return Ok(());
        }

        let Some(params) = self.class_parameters(pvc).await? else {
            // Another provisioner's claim.
            return Ok(());
        };

        let uid = pvc
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::Validation("claim has no uid".into()))?;
        let pv_name = format!("pvc-{uid}");

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        if pvs.get_opt(&pv_name).await?.is_some() {
            debug!(volume = %pv_name, "volume already provisioned");
            return Ok(());
        }

        let pv = self.provisioner.provision(&pv_name, pvc, &params).await?;
        pvs.create(&PostParams::default(), &pv).await?;
        info!(claim = %pvc.name_any(), volume = %pv_name, "provisioned volume");
        Ok(())
    }

    /// The claim's StorageClass parameters, or `None` if the class names a
    /// different provisioner.
    async fn class_parameters(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let Some(class_name) = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
        else {
            return Ok(None);
        };

        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let Some(class) = classes.get_opt(&class_name).await? else {
            return Ok(None);
        };

        if class.provisioner != self.provisioner.config().name {
            return Ok(None);
        }
        Ok(Some(class.parameters.unwrap_or_default()))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Watch PersistentVolumes and tear down released ones this provisioner
    /// created.
    async fn watch_volumes(&self) -> Result<()> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let mut stream = watcher(pvs.clone(), watcher::Config::default())
            .default_backoff()
            .applied_objects()
            .boxed();

        while let Some(pv) = stream.try_next().await? {
            if let Err(e) = self.reconcile_volume(&pvs, &pv).await {
                if e.is_ignorable() {
                    debug!(volume = %pv.name_any(), error = %e, "skipping volume");
                } else {
                    error!(volume = %pv.name_any(), error = %e, "failed to reclaim volume");
                }
            }
        }

        warn!("volume watch stream ended");
        Ok(())
    }

    async fn reconcile_volume(
        &self,
        pvs: &Api<PersistentVolume>,
        pv: &PersistentVolume,
    ) -> Result<()> {
        let phase = pv
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        let reclaim = pv
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            .unwrap_or_default();
        if phase != "Released" || reclaim != "Delete" {
            return Ok(());
        }

        self.provisioner.delete(pv).await?;
        pvs.delete(&pv.name_any(), &Default::default()).await?;
        info!(volume = %pv.name_any(), "reclaimed volume");
        Ok(())
    }
}
