//! drbdmanage Output Parsing
//!
//! Turns the machine-readable output of drbdmanage (comma-separated fields,
//! one record per line) into structured facts. Everything in this module is
//! pure: command invocation lives in [`super::command`], intent plumbing in
//! [`super::resource`].
//!
//! Field counts are protocol contracts: assignment records carry exactly 5
//! fields, volume records exactly 7. A malformed assignment record is fatal
//! for the operation that observed it; a malformed volume record is skipped
//! so one garbled row cannot invalidate the others.

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Informational wrapper drbdmanage prints around its payload after talking
/// to D-Bus. It can land in front of or behind the output we care about.
const DM_BANNER: &str = "Operation completed successfully";

/// Target state of a locally diskless client assignment.
const CLIENT_TARGET_STATE: &str = "connect|deploy|diskless";

/// Field count of one `list-assignments` record.
const ASSIGNMENT_FIELDS: usize = 5;

/// Field count of one `list-volumes` record.
const VOLUME_FIELDS: usize = 7;

/// Index of the device minor number within a volume record.
const VOLUME_MINOR_FIELD: usize = 5;

/// blkid udev key that names the filesystem on a block device.
const FS_TYPE_KEY: &str = "ID_FS_TYPE";

// =============================================================================
// Wrapper Stripping
// =============================================================================

/// Strip the drbdmanage informational banner from either end of `raw`.
///
/// Whichever side the banner appears on, the payload in between is returned
/// with surrounding whitespace removed.
pub fn strip_banner(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_suffix(DM_BANNER).unwrap_or(s);
    let s = s.strip_prefix(DM_BANNER).unwrap_or(s);
    s.trim().to_string()
}

// =============================================================================
// Resource Existence
// =============================================================================

/// Interpret `list-resources` output scoped to `resource`.
///
/// Empty output means the resource is not defined (not an error). Non-empty
/// output must lead with the requested name; anything else is a protocol
/// violation rather than a negative result.
pub fn resource_exists(resource: &str, out: &str) -> Result<bool> {
    if out.is_empty() {
        return Ok(false);
    }
    let first = out.split(',').next().unwrap_or("");
    if first != resource {
        return Err(Error::Protocol {
            output: out.to_string(),
            expected: format!("resource record leading with {resource:?}"),
        });
    }
    Ok(true)
}

// =============================================================================
// Assignment Convergence
// =============================================================================

/// Interpret `list-assignments` output for one resource.
///
/// The resource may be assigned on several nodes, one record per line. Every
/// record must have converged (current state equals target state) for the
/// whole check to pass; the first divergent record short-circuits with an
/// error naming both states. An empty record means there is no assignment:
/// `Ok(false)` without an error.
pub fn assignments_converged(out: &str) -> Result<bool> {
    for line in out.trim().split('\n') {
        if !assignment_converged(line)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn assignment_converged(line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(false);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != ASSIGNMENT_FIELDS {
        return Err(Error::Protocol {
            output: line.to_string(),
            expected: format!("{ASSIGNMENT_FIELDS} comma-separated assignment fields"),
        });
    }

    // The assignment exists, but is in a transient state or unhealthy.
    let current = fields[3].trim();
    let target = fields[4].trim();
    if current != target {
        return Err(Error::NotConverged {
            current: current.to_string(),
            target: target.to_string(),
        });
    }

    Ok(true)
}

/// Whether `list-assignments` output describes a locally diskless client.
///
/// Best-effort predicate: any irregularity (no assignment, wrong field
/// count) collapses to `false` instead of an error.
pub fn is_client(out: &str) -> bool {
    let fields: Vec<&str> = out.split(',').collect();
    if fields.len() != ASSIGNMENT_FIELDS {
        return false;
    }
    fields[4].trim() == CLIENT_TARGET_STATE
}

// =============================================================================
// Volume Records
// =============================================================================

/// Split one `list-volumes` record, skipping records with the wrong shape.
fn volume_fields(line: &str) -> Option<Vec<&str>> {
    let fields: Vec<&str> = line.split(',').collect();
    (fields.len() == VOLUME_FIELDS).then_some(fields)
}

/// Find the resource that owns device minor `minor` in `list-volumes`
/// output. Garbled records are skipped: the next one might be fine.
pub fn resource_by_minor(out: &str, minor: &str) -> Option<String> {
    out.split('\n')
        .filter_map(volume_fields)
        .find(|fields| fields[VOLUME_MINOR_FIELD] == minor)
        .map(|fields| fields[0].to_string())
}

/// Find the device minor number for `resource` in `list-volumes` output.
///
/// Returns `Ok(None)` when no record matches. A matching record whose minor
/// number is not numeric cannot be turned into a device path and is a
/// protocol error.
pub fn volume_minor_for_resource(out: &str, resource: &str) -> Result<Option<String>> {
    for fields in out.split('\n').filter_map(volume_fields) {
        if fields[0] != resource {
            continue;
        }
        let minor = fields[VOLUME_MINOR_FIELD];
        if minor.is_empty() || !minor.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol {
                output: fields.join(","),
                expected: "numeric device minor in volume record".to_string(),
            });
        }
        return Ok(Some(minor.to_string()));
    }
    Ok(None)
}

/// Extract the minor number from a DRBD device path.
///
/// Only `/dev/drbd<digits>` is trusted; anything else is rejected before the
/// minor is used for lookups.
pub fn minor_from_device(device: &str) -> Result<&str> {
    let minor = device.strip_prefix("/dev/drbd").ok_or_else(|| {
        Error::Validation(format!("tried to get minor from non-DRBD device: {device:?}"))
    })?;
    if minor.is_empty() || !minor.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "tried to get minor from non-DRBD device: {device:?}"
        )));
    }
    Ok(minor)
}

// =============================================================================
// Free Space
// =============================================================================

/// Parse a requested size in KiB. Must be a strictly positive integer;
/// anything else is a validation error independent of what the cluster
/// reports.
pub fn parse_requested_kib(requested: &str) -> Result<u64> {
    match requested.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Validation(format!(
            "requested storage must be a positive integer, got {requested:?}"
        ))),
    }
}

/// Check a placement request against `list-free-space` output.
///
/// Requests that would exactly exhaust the reported free space are rejected:
/// the request must be strictly below it. An `Error:` report from the tool
/// is surfaced verbatim, and unparseable output fails closed.
pub fn enough_free_space(requested_kib: &str, out: &str) -> Result<()> {
    let requested = parse_requested_kib(requested_kib)?;

    if out.starts_with("Error:") {
        return Err(Error::FreeSpaceReport(out.trim().to_string()));
    }

    let first = out.split(',').next().unwrap_or("").trim();
    let free: u64 = first.parse().map_err(|_| Error::Protocol {
        output: out.to_string(),
        expected: "free-space report leading with a KiB integer".to_string(),
    })?;

    if requested < free {
        Ok(())
    } else {
        Err(Error::InsufficientFreeSpace {
            requested_kib: requested,
            free_kib: free,
        })
    }
}

// =============================================================================
// Filesystem Probe
// =============================================================================

/// Parse the filesystem type from `blkid -o udev` output.
///
/// The output is whitespace-separated `KEY=VALUE` pairs. No pairs at all
/// means the device carries no filesystem: `Ok("")`, a meaningful outcome
/// rather than a failure. A pair without `=` is a hard parse error, as is
/// non-empty output that never names a filesystem type.
pub fn fs_type(out: &str) -> Result<String> {
    let pairs: Vec<&str> = out.split_whitespace().collect();
    if pairs.is_empty() {
        return Ok(String::new());
    }

    let mut attrs = std::collections::HashMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| Error::Protocol {
            output: out.to_string(),
            expected: "whitespace-separated KEY=VALUE pairs".to_string(),
        })?;
        attrs.insert(key, value);
    }

    match attrs.get(FS_TYPE_KEY) {
        Some(fs) => Ok((*fs).to_string()),
        None => Err(Error::Protocol {
            output: out.to_string(),
            expected: format!("a {FS_TYPE_KEY} pair in block device attributes"),
        }),
    }
}
