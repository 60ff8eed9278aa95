//! Error types for the DRBD flex provisioner
//!
//! Provides structured error types for the drbdmanage client, the
//! convergence poller, and the provisioner surface.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Local Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad input shape. Never retried, surfaced immediately.
    #[error("Validation error: {0}")]
    Validation(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// drbdmanage output did not match the expected machine-readable shape.
    #[error("Unexpected drbdmanage output {output:?}: expected {expected}")]
    Protocol { output: String, expected: String },

    /// An assignment exists but is in a transient or unhealthy state.
    #[error("Assignment target state {target:?} differs from current state {current:?}")]
    NotConverged { current: String, target: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource {resource:?} is not defined in drbdmanage")]
    ResourceNotDefined { resource: String },

    /// Unassignment exhausted its retry budget with the assignment intact.
    /// Distinct from a transport failure while checking.
    #[error("Resource {resource:?} is still assigned to node {node:?}")]
    StillAssigned { resource: String, node: String },

    #[error("Unable to assign resource {resource:?} on node {node:?}: {output}")]
    AssignFailed {
        resource: String,
        node: String,
        output: String,
    },

    #[error("Failed to unassign resource {resource:?} from node {node:?}: {source}")]
    UnassignFailed {
        resource: String,
        node: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error(
        "Not enough space available to provision a new resource: \
         want {requested_kib}KiB have {free_kib}KiB"
    )]
    InsufficientFreeSpace { requested_kib: u64, free_kib: u64 },

    /// drbdmanage reported an error in its free-space output. Surfaced verbatim.
    #[error("{0}")]
    FreeSpaceReport(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Device path {path} is not present: {source}")]
    DeviceMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Device {device:?} already formatted with {found:?} filesystem, \
         refusing to overwrite with {wanted:?} filesystem"
    )]
    FilesystemMismatch {
        device: String,
        found: String,
        wanted: String,
    },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error("Failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit from an external command, with its combined output.
    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// A PersistentVolume provisioned by somebody else. Skipped, not fatal.
    #[error("Volume {volume:?} was provisioned by {owner:?}, not by this provisioner")]
    ForeignVolume { volume: String, owner: String },
}

impl Error {
    /// Whether a convergence poller may retry the operation that produced
    /// this error. Validation and protocol-identity failures never qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotConverged { .. }
                | Error::StillAssigned { .. }
                | Error::DeviceMissing { .. }
                | Error::Spawn { .. }
                | Error::CommandFailed { .. }
                | Error::Kube(_)
                | Error::Watch(_)
        )
    }

    /// Errors the controller logs and moves past instead of requeueing.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::ForeignVolume { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
