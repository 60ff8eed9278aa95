//! DRBD Manage Resources and Intents
//!
//! [`Resource`] identifies a named storage resource and, for node-scoped
//! operations, a target node. [`DrbdManage`] is the client that carries the
//! intents: existence checks, assignment and unassignment with convergence
//! waits, the client-mode predicate, the pre-flight free-space gate, and
//! resource creation/removal.
//!
//! The truth about a resource lives entirely in the drbdmanage cluster;
//! facts are recomputed on every query and a `Resource` is a transient
//! handle constructed per call, never a cached record.

use crate::drbd::command::{CmdOutput, CommandRunner, SystemRunner};
use crate::drbd::parse;
use crate::drbd::poller::{poll_converged, PollPolicy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// The external storage manager CLI.
pub const DM_TOOL: &str = "drbdmanage";

// =============================================================================
// Resource
// =============================================================================

/// Handle for one drbdmanage resource.
///
/// `node_name` is required for node-scoped operations (assign, unassign,
/// client checks); empty means "any/unspecified". `redundancy` is the
/// replica count for deployment, carried as the numeric string the CLI
/// expects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub node_name: String,
    pub redundancy: String,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn on_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_redundancy(mut self, redundancy: impl Into<String>) -> Self {
        self.redundancy = redundancy.into();
        self
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the drbdmanage client.
#[derive(Debug, Clone)]
pub struct DrbdConfig {
    /// Pacing for assignment convergence waits.
    pub assign_policy: PollPolicy,
    /// Pacing for unassignment convergence waits.
    pub unassign_policy: PollPolicy,
    /// Pacing for the device-path wait.
    pub device_policy: PollPolicy,
    /// Where DRBD kernel devices appear (overridable for testing).
    pub dev_root: PathBuf,
}

impl Default for DrbdConfig {
    fn default() -> Self {
        Self {
            assign_policy: PollPolicy::new(5, Duration::from_secs(1), Duration::from_secs(2)),
            unassign_policy: PollPolicy::new(3, Duration::from_secs(1), Duration::from_secs(2)),
            device_policy: PollPolicy::new(3, Duration::from_secs(2), Duration::ZERO),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

// =============================================================================
// DrbdManage Client
// =============================================================================

/// Client for the drbdmanage CLI.
///
/// Every intent issues exactly one external invocation per check and blocks
/// until it exits; the convergence waits block for up to
/// `max_retries × (delay + settle)` on top of that.
pub struct DrbdManage {
    runner: Box<dyn CommandRunner>,
    config: DrbdConfig,
}

impl DrbdManage {
    /// Create a client that talks to the real drbdmanage binary.
    pub fn new(config: DrbdConfig) -> Self {
        Self::with_runner(Box::new(SystemRunner), config)
    }

    /// Create a client over a custom runner (the testing seam).
    pub fn with_runner(runner: Box<dyn CommandRunner>, config: DrbdConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &DrbdConfig {
        &self.config
    }

    /// Run drbdmanage, strip the informational banner, and treat a non-zero
    /// exit as a hard failure carrying the captured combined output.
    pub(crate) fn dm(&self, args: &[&str]) -> Result<String> {
        let out = self.runner.run(DM_TOOL, args)?;
        let text = parse::strip_banner(&out.text);
        if !out.success {
            return Err(Error::CommandFailed {
                command: format!("{DM_TOOL} {}", args.join(" ")),
                output: text,
            });
        }
        Ok(text)
    }

    /// Run an arbitrary external command, failing on non-zero exit.
    pub(crate) fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.runner.run(program, args)?;
        if !out.success {
            return Err(Error::CommandFailed {
                command: format!("{program} {}", args.join(" ")),
                output: out.text.trim().to_string(),
            });
        }
        Ok(out.text)
    }

    /// Run an arbitrary external command without judging its exit status.
    pub(crate) fn run_lenient(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        self.runner.run(program, args)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the resource is defined in drbdmanage. Pure query.
    pub fn exists(&self, res: &Resource) -> Result<bool> {
        let out = self.dm(&[
            "list-resources",
            "--resources",
            &res.name,
            "--machine-readable",
        ])?;
        parse::resource_exists(&res.name, &out)
    }

    /// Whether every assignment of the resource has converged.
    ///
    /// `Ok(false)` means no assignment; a divergent assignment is an error
    /// naming both states, which the pollers treat as "not yet".
    fn check_assigned(&self, res: &Resource) -> Result<bool> {
        let mut args = vec![
            "list-assignments",
            "--resources",
            res.name.as_str(),
            "--machine-readable",
        ];
        if !res.node_name.is_empty() {
            args.push("--nodes");
            args.push(res.node_name.as_str());
        }
        let out = self.dm(&args)?;
        parse::assignments_converged(&out)
    }

    /// Whether the resource runs as a locally diskless client on its node.
    ///
    /// Best-effort: any command failure collapses to `false`. Callers use
    /// this for advisory branching only and cannot distinguish "not a
    /// client" from "could not determine".
    pub fn is_client(&self, res: &Resource) -> bool {
        let out = match self.dm(&[
            "list-assignments",
            "--resources",
            &res.name,
            "--nodes",
            &res.node_name,
            "--machine-readable",
        ]) {
            Ok(out) => out,
            Err(e) => {
                debug!(resource = %res.name, node = %res.node_name, error = %e,
                       "client-mode check failed, treating as not a client");
                return false;
            }
        };
        parse::is_client(&out)
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Assign the resource to its node as a diskless client.
    ///
    /// The resource must already be defined. An assignment that is already
    /// in place short-circuits as success without issuing another mutating
    /// command; otherwise the assign command is issued and the convergence
    /// wait decides.
    pub fn assign(&self, res: &Resource) -> Result<bool> {
        if !self.exists(res)? {
            return Err(Error::ResourceNotDefined {
                resource: res.name.clone(),
            });
        }

        match self.check_assigned(res) {
            Ok(true) => {
                debug!(resource = %res.name, node = %res.node_name, "already assigned");
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => return Err(e),
        }

        info!(resource = %res.name, node = %res.node_name, "assigning resource as client");
        self.dm(&["assign-resource", &res.name, &res.node_name, "--client"])
            .map_err(|e| match e {
                Error::CommandFailed { output, .. } => Error::AssignFailed {
                    resource: res.name.clone(),
                    node: res.node_name.clone(),
                    output,
                },
                other => other,
            })?;

        self.wait_for_assignment(res, self.config.assign_policy.max_retries)
    }

    /// Unassign the resource from its node and wait for the assignment to
    /// disappear.
    ///
    /// Exhausting the wait with the assignment intact is a policy failure
    /// (still assigned), reported distinctly from a transport failure while
    /// checking.
    pub fn unassign(&self, res: &Resource) -> Result<()> {
        info!(resource = %res.name, node = %res.node_name, "unassigning resource");
        self.dm(&["unassign-resource", &res.name, &res.node_name, "--quiet"])
            .map_err(|e| Error::UnassignFailed {
                resource: res.name.clone(),
                node: res.node_name.clone(),
                source: Box::new(e),
            })?;

        match self.wait_for_unassignment(res, self.config.unassign_policy.max_retries) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::StillAssigned {
                resource: res.name.clone(),
                node: res.node_name.clone(),
            }),
            Err(e) => Err(Error::UnassignFailed {
                resource: res.name.clone(),
                node: res.node_name.clone(),
                source: Box::new(e),
            }),
        }
    }

    /// Poll until every assignment of the resource has converged.
    pub fn wait_for_assignment(&self, res: &Resource, max_retries: u32) -> Result<bool> {
        let policy = self.config.assign_policy.with_retries(max_retries);
        poll_converged(
            &policy,
            || self.check_assigned(res),
            || self.resume_and_settle(policy.settle),
        )
    }

    /// Poll until the resource has no assignment left.
    pub fn wait_for_unassignment(&self, res: &Resource, max_retries: u32) -> Result<bool> {
        let policy = self.config.unassign_policy.with_retries(max_retries);
        poll_converged(
            &policy,
            || Ok(!self.check_assigned(res)?),
            || self.resume_and_settle(policy.settle),
        )
    }

    /// Recovery action between poll attempts: ask the cluster to resume all
    /// pending operations, ignoring the outcome, then let it settle.
    fn resume_and_settle(&self, settle: Duration) {
        if let Err(e) = self.runner.run(DM_TOOL, &["resume-all"]) {
            debug!(error = %e, "resume-all nudge failed");
        }
        thread::sleep(settle);
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Pre-flight gate: does a placement of `requested_kib` at `redundancy`
    /// replicas fit in the currently reported free space?
    ///
    /// Runs before resource creation is attempted; its failure is an abort,
    /// not a rollback. The request is validated before the cluster is asked,
    /// and unparseable cluster output fails closed.
    pub fn enough_free_space(&self, requested_kib: &str, redundancy: &str) -> Result<()> {
        parse::parse_requested_kib(requested_kib)?;
        let out = self.dm(&["list-free-space", "-m", redundancy])?;
        parse::enough_free_space(requested_kib, &out)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Define and deploy a new resource of `size_kib`, then wait for the
    /// deployment to converge.
    pub fn create(&self, res: &Resource, size_kib: u64) -> Result<()> {
        self.enough_free_space(&size_kib.to_string(), &res.redundancy)?;

        info!(resource = %res.name, size_kib, redundancy = %res.redundancy,
              "creating resource");
        let size = format!("{size_kib}KiB");
        self.dm(&["add-volume", &res.name, &size, "--deploy", &res.redundancy])?;

        // Deployment is converged once every node's assignment settles.
        let deployed = Resource::new(res.name.clone());
        match self.wait_for_assignment(&deployed, self.config.assign_policy.max_retries)? {
            true => Ok(()),
            false => Err(Error::NotConverged {
                current: "unassigned".to_string(),
                target: "deployed".to_string(),
            }),
        }
    }

    /// Remove the resource and all its volumes from the cluster.
    pub fn remove(&self, res: &Resource) -> Result<()> {
        info!(resource = %res.name, "removing resource");
        if let Err(e) = self.dm(&["remove-resource", "--quiet", &res.name]) {
            warn!(resource = %res.name, error = %e, "remove-resource failed");
            return Err(e);
        }
        Ok(())
    }
}
