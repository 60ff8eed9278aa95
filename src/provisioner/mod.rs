//! Dynamic Provisioning
//!
//! The Kubernetes-facing half of the crate: resolving claim options,
//! building PersistentVolumes backed by flexvolume, and the watch loop that
//! ties the two to the API server.

pub mod controller;
pub mod flex;
pub mod options;

pub use controller::Controller;
pub use flex::{FlexProvisioner, ProvisionerConfig};
pub use options::VolumeOptions;
