//! Volume Options
//!
//! Translates a PersistentVolumeClaim plus its StorageClass parameters into
//! the settings a DRBD resource is created with.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::collections::BTreeMap;
use tracing::warn;

// =============================================================================
// Volume Options
// =============================================================================

/// Resolved settings for one volume to be provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeOptions {
    /// DRBD resource name, derived from the claim's namespace and name.
    pub resource_name: String,
    /// Requested capacity in KiB, rounded up.
    pub requested_kib: u64,
    /// Replica count passed to `--deploy`.
    pub redundancy: String,
    /// Filesystem to put on the device.
    pub fs_type: String,
    /// Flexvolume driver name recorded on the PersistentVolume.
    pub driver: String,
    /// Extra mount options forwarded to the flexvolume driver.
    pub mount_opts: String,
    /// Extra mkfs options forwarded to the flexvolume driver.
    pub fs_opts: String,
    /// Optional comma-separated list of nodes to deploy on.
    pub node_list: String,
}

impl VolumeOptions {
    /// Resolve options from a claim and its StorageClass parameters.
    ///
    /// Parameter keys are matched case-insensitively; unknown keys are logged
    /// and skipped so a typo surfaces in the logs instead of failing the
    /// claim.
    pub fn from_claim(
        pvc: &PersistentVolumeClaim,
        params: &BTreeMap<String, String>,
        default_redundancy: &str,
        default_fs: &str,
        default_driver: &str,
    ) -> Result<Self> {
        let namespace = pvc
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::Validation("claim has no namespace".into()))?;
        let name = pvc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Validation("claim has no name".into()))?;

        let requested = pvc
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .ok_or_else(|| {
                Error::Validation(format!("claim {namespace}/{name} requests no storage"))
            })?;

        let mut opts = Self {
            resource_name: format!("{namespace}-{name}"),
            requested_kib: parse_quantity_kib(&requested.0)?,
            redundancy: default_redundancy.to_string(),
            fs_type: default_fs.to_string(),
            driver: default_driver.to_string(),
            mount_opts: String::new(),
            fs_opts: String::new(),
            node_list: String::new(),
        };

        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "nodelist" => opts.node_list = value.clone(),
                "redundancy" => opts.redundancy = value.clone(),
                "filesystem" => opts.fs_type = value.clone(),
                "driver" => opts.driver = value.clone(),
                "mountopts" => opts.mount_opts = value.clone(),
                "fsopts" => opts.fs_opts = value.clone(),
                other => {
                    warn!(parameter = other, "ignoring unknown StorageClass parameter");
                }
            }
        }

        Ok(opts)
    }
}

// =============================================================================
// Quantity Parsing
// =============================================================================

/// Parse a Kubernetes resource quantity into KiB, rounding up.
///
/// Handles plain byte counts and the binary (Ki..Pi) and decimal (k..P)
/// suffixes. Exotic forms (exponents, fractions) are rejected.
pub fn parse_quantity_kib(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);

    let value: u128 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("unparsable quantity {quantity:?}")))?;

    let bytes: u128 = match suffix {
        "" => value,
        "Ki" => value << 10,
        "Mi" => value << 20,
        "Gi" => value << 30,
        "Ti" => value << 40,
        "Pi" => value << 50,
        "k" => value * 1_000,
        "M" => value * 1_000_000,
        "G" => value * 1_000_000_000,
        "T" => value * 1_000_000_000_000,
        "P" => value * 1_000_000_000_000_000,
        _ => {
            return Err(Error::Validation(format!(
                "unsupported quantity suffix in {quantity:?}"
            )))
        }
    };

    let kib = (bytes + 1023) >> 10;
    u64::try_from(kib).map_err(|_| Error::Validation(format!("quantity {quantity:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn claim(namespace: &str, name: &str, storage: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
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

    #[test]
    fn test_parse_quantity_kib() {
        assert_eq!(parse_quantity_kib("1024").unwrap(), 1);
        assert_eq!(parse_quantity_kib("1025").unwrap(), 2);
        assert_eq!(parse_quantity_kib("1Ki").unwrap(), 1);
        assert_eq!(parse_quantity_kib("1Gi").unwrap(), 1024 * 1024);
        assert_eq!(parse_quantity_kib("5G").unwrap(), 4_882_813);
        assert_eq!(parse_quantity_kib("1k").unwrap(), 1);
        assert_eq!(parse_quantity_kib("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_quantity_rejects_exotic_forms() {
        assert_matches!(parse_quantity_kib("1.5Gi"), Err(Error::Validation(_)));
        assert_matches!(parse_quantity_kib("1e3"), Err(Error::Validation(_)));
        assert_matches!(parse_quantity_kib(""), Err(Error::Validation(_)));
        assert_matches!(parse_quantity_kib("-5Gi"), Err(Error::Validation(_)));
    }

    #[test]
    fn test_options_from_claim_defaults() {
        let pvc = claim("apps", "db-data", "1Gi");
        let opts =
            VolumeOptions::from_claim(&pvc, &BTreeMap::new(), "2", "ext4", "linbit/flexvolume")
                .unwrap();

        assert_eq!(opts.resource_name, "apps-db-data");
        assert_eq!(opts.requested_kib, 1024 * 1024);
        assert_eq!(opts.redundancy, "2");
        assert_eq!(opts.fs_type, "ext4");
        assert_eq!(opts.driver, "linbit/flexvolume");
        assert!(opts.node_list.is_empty());
    }

    #[test]
    fn test_options_parameters_case_insensitive() {
        let pvc = claim("apps", "db-data", "1Gi");
        let params: BTreeMap<String, String> = [
            ("Redundancy".to_string(), "3".to_string()),
            ("FILESYSTEM".to_string(), "xfs".to_string()),
            ("nodeList".to_string(), "node1,node2".to_string()),
            ("mountOpts".to_string(), "noatime".to_string()),
        ]
        .into_iter()
        .collect();

        let opts =
            VolumeOptions::from_claim(&pvc, &params, "2", "ext4", "linbit/flexvolume").unwrap();
        assert_eq!(opts.redundancy, "3");
        assert_eq!(opts.fs_type, "xfs");
        assert_eq!(opts.node_list, "node1,node2");
        assert_eq!(opts.mount_opts, "noatime");
    }

    #[test]
    fn test_options_unknown_parameter_is_skipped() {
        let pvc = claim("apps", "db-data", "1Gi");
        let params: BTreeMap<String, String> =
            [("reduncancy".to_string(), "3".to_string())].into_iter().collect();

        let opts =
            VolumeOptions::from_claim(&pvc, &params, "2", "ext4", "linbit/flexvolume").unwrap();
        assert_eq!(opts.redundancy, "2");
    }

    #[test]
    fn test_options_require_storage_request() {
        let mut pvc = claim("apps", "db-data", "1Gi");
        pvc.spec = None;
        let err = VolumeOptions::from_claim(&pvc, &BTreeMap::new(), "2", "ext4", "d").unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }
}
