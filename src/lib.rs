//! DRBD Flexvolume Provisioner
//!
//! Dynamic Kubernetes volume provisioning on top of a DRBD Manage cluster.
//! The cluster is driven entirely through the `drbdmanage` CLI: resources
//! are defined, deployed, and assigned by running commands, parsing their
//! machine-readable output, and polling until the cluster converges.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Provision Controller                    │
//! │   watches pending claims and released volumes (kube)     │
//! ├──────────────────────────────────────────────────────────┤
//! │                   Flex Provisioner                       │
//! │   claim options → DRBD resource → flexvolume PV          │
//! ├──────────────────────────────────────────────────────────┤
//! │                  DRBD Manage Client                      │
//! │   run drbdmanage → parse output → poll for convergence   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioner`]: Kubernetes-facing claim handling and watch loop
//! - [`drbd`]: blocking `drbdmanage` client, parsing, and convergence polling
//! - [`error`]: Error types and handling

pub mod drbd;
pub mod error;
pub mod provisioner;

// Re-export commonly used types
pub use drbd::{
    CmdOutput, CommandRunner, DrbdConfig, DrbdManage, FsUtil, PollPolicy, Resource, SystemRunner,
    DM_TOOL,
};

pub use error::{Error, Result};

pub use provisioner::{Controller, FlexProvisioner, ProvisionerConfig, VolumeOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
