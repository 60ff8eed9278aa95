//! Convergence Polling
//!
//! drbdmanage mutates cluster state asynchronously: after an administrative
//! command the externally visible state catches up to the requested state on
//! its own schedule. The pollers here re-check a condition under a bounded
//! retry budget, nudging the cluster between attempts through a recovery
//! action that is deliberately decoupled from the condition check.
//!
//! There is no in-loop cancellation: the only ways out are convergence and
//! budget exhaustion. Callers that need a wall-clock bound wrap the call.

use crate::error::Result;
use std::thread;
use std::time::Duration;

// =============================================================================
// Poll Policy
// =============================================================================

/// Retry budget and pacing for one convergence wait.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Attempts before the authoritative final re-check.
    pub max_retries: u32,
    /// Fixed sleep between attempts.
    pub delay: Duration,
    /// Extra sleep after the recovery action, letting the cluster settle.
    pub settle: Duration,
}

impl PollPolicy {
    pub const fn new(max_retries: u32, delay: Duration, settle: Duration) -> Self {
        Self {
            max_retries,
            delay,
            settle,
        }
    }

    /// Same pacing, different retry budget.
    pub fn with_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }
}

// =============================================================================
// Pollers
// =============================================================================

/// Poll `check` until it reports convergence or the budget runs out.
///
/// `Ok(true)` from the check ends the wait immediately without consuming the
/// remaining budget. Any other outcome sleeps the fixed delay and runs
/// `recover` before the next attempt. On exhaustion a final unconditional
/// check decides: a convergence that lands on the very last tick still
/// succeeds, and its error is the one the caller sees.
pub fn poll_converged<C, R>(policy: &PollPolicy, mut check: C, mut recover: R) -> Result<bool>
where
    C: FnMut() -> Result<bool>,
    R: FnMut(),
{
    for _ in 0..policy.max_retries {
        if let Ok(true) = check() {
            return Ok(true);
        }
        thread::sleep(policy.delay);
        recover();
    }
    check()
}

/// Poll `fetch` until it produces a value or the budget runs out.
///
/// For waits whose success is a value rather than a state comparison (the
/// device path appearing on the local filesystem). A fetch error means "not
/// ready yet"; the final fetch after exhaustion is authoritative. No
/// recovery action runs between attempts.
pub fn poll_until_ready<T, F>(policy: &PollPolicy, mut fetch: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    for _ in 0..policy.max_retries {
        if let Ok(value) = fetch() {
            return Ok(value);
        }
        thread::sleep(policy.delay);
    }
    fetch()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::cell::Cell;

    fn instant() -> PollPolicy {
        PollPolicy::new(3, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_early_exit_consumes_no_budget() {
        let checks = Cell::new(0u32);
        let recoveries = Cell::new(0u32);

        let ok = poll_converged(
            &instant(),
            || {
                checks.set(checks.get() + 1);
                Ok(true)
            },
            || recoveries.set(recoveries.get() + 1),
        )
        .unwrap();

        assert!(ok);
        assert_eq!(checks.get(), 1);
        assert_eq!(recoveries.get(), 0);
    }

    #[test]
    fn test_recovery_runs_between_attempts() {
        let checks = Cell::new(0u32);
        let recoveries = Cell::new(0u32);

        let result = poll_converged(
            &instant(),
            || {
                checks.set(checks.get() + 1);
                Err(Error::NotConverged {
                    current: "pending".into(),
                    target: "connected".into(),
                })
            },
            || recoveries.set(recoveries.get() + 1),
        );

        // Budget attempts plus the authoritative final re-check.
        assert_eq!(checks.get(), 4);
        assert_eq!(recoveries.get(), 3);
        assert_matches!(result, Err(Error::NotConverged { .. }));
    }

    #[test]
    fn test_convergence_on_last_tick_still_succeeds() {
        let checks = Cell::new(0u32);

        let ok = poll_converged(
            &instant(),
            || {
                checks.set(checks.get() + 1);
                // Converges only on the final unconditional re-check.
                if checks.get() > 3 {
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
            || {},
        )
        .unwrap();

        assert!(ok);
        assert_eq!(checks.get(), 4);
    }

    #[test]
    fn test_not_converged_without_error_returns_false() {
        let result = poll_converged(&instant(), || Ok(false), || {}).unwrap();
        assert!(!result);
    }

    #[test]
    fn test_mid_loop_error_does_not_abort_the_wait() {
        let checks = Cell::new(0u32);

        let ok = poll_converged(
            &instant(),
            || {
                checks.set(checks.get() + 1);
                if checks.get() == 1 {
                    Err(Error::CommandFailed {
                        command: "drbdmanage".into(),
                        output: "dbus hiccup".into(),
                    })
                } else {
                    Ok(true)
                }
            },
            || {},
        )
        .unwrap();

        assert!(ok);
        assert_eq!(checks.get(), 2);
    }

    #[test]
    fn test_poll_until_ready_returns_value() {
        let fetches = Cell::new(0u32);

        let value = poll_until_ready(&instant(), || {
            fetches.set(fetches.get() + 1);
            if fetches.get() < 3 {
                Err(Error::DeviceMissing {
                    path: "/dev/drbd100".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            } else {
                Ok("/dev/drbd100".to_string())
            }
        })
        .unwrap();

        assert_eq!(value, "/dev/drbd100");
        assert_eq!(fetches.get(), 3);
    }

    #[test]
    fn test_poll_until_ready_final_fetch_is_authoritative() {
        let fetches = Cell::new(0u32);

        let result: Result<String> = poll_until_ready(&instant(), || {
            fetches.set(fetches.get() + 1);
            Err(Error::DeviceMissing {
                path: "/dev/drbd100".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });

        assert_eq!(fetches.get(), 4);
        assert_matches!(result, Err(Error::DeviceMissing { .. }));
    }

    #[test]
    fn test_with_retries_overrides_budget() {
        let policy = PollPolicy::new(5, Duration::ZERO, Duration::ZERO).with_retries(1);
        let checks = Cell::new(0u32);
        let _ = poll_converged(
            &policy,
            || {
                checks.set(checks.get() + 1);
                Ok(false)
            },
            || {},
        );
        assert_eq!(checks.get(), 2);
    }
}
