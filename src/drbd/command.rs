//! External Command Invocation
//!
//! The drbdmanage client and the filesystem utility shell out to external
//! tools. `CommandRunner` is the seam between them and the real processes:
//! production code uses [`SystemRunner`], tests substitute a scripted fake.

use crate::error::{Error, Result};
use std::process::Command;

/// Combined stdout+stderr of a finished process, plus its verdict.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Combined stdout and stderr, lossily decoded.
    pub text: String,
    /// Whether the process exited zero.
    pub success: bool,
}

/// Seam for running external commands.
///
/// `run` only fails when the process cannot be launched at all; a non-zero
/// exit is reported through [`CmdOutput::success`] so callers that tolerate
/// failure (blkid on a blank device, resume-all nudges) can ignore it.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;
}

/// Real implementation over `std::process::Command`.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Spawn {
                command: program.to_string(),
                source: e,
            })?;

        // Interleaving is lost, but every caller treats the streams as one
        // blob of tool output anyway.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CmdOutput {
            text,
            success: output.status.success(),
        })
    }
}
