//! Readiness polling with exponential backoff.
//!
//! A role counts as ready once its probe succeeds. Probes are retried with
//! exponential backoff until the role's startup budget is spent:
//! - Initial delay: 250ms
//! - Exponential multiplier: 2x
//! - Delay cap: 5s, and never more than the remaining budget

use crate::descriptor::ReadinessProbe;
use crate::runtime::{InstanceRef, RuntimeError, ServiceRuntime};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Delay before the second probe.
pub const INITIAL_POLL_DELAY: Duration = Duration::from_millis(250);

/// Upper bound of the delay between two probes.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(5);

/// Poll `probe` until it succeeds or `budget` is spent.
///
/// Probe errors count as "not ready yet", except `UnknownInstance` and
/// `InstanceExited`: such an instance will never become ready.
///
/// # Errors
///
/// `RuntimeError::ReadinessTimeout` when the budget is spent, or the
/// terminal error reported by the runtime.
pub async fn wait_until_ready(
    runtime: &dyn ServiceRuntime,
    instance: &InstanceRef,
    probe: &ReadinessProbe,
    budget: Duration,
) -> Result<(), RuntimeError> {
    let start = Instant::now();
    let mut delay = INITIAL_POLL_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match runtime.is_ready(instance, probe).await {
            Ok(true) => {
                debug!(
                    target: "crucible.readiness",
                    instance = %instance,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Instance ready"
                );
                return Ok(());
            }
            Ok(false) => {
                trace!(
                    target: "crucible.readiness",
                    instance = %instance,
                    attempts,
                    "Not ready yet"
                );
            }
            Err(err @ (RuntimeError::UnknownInstance(_) | RuntimeError::InstanceExited(_))) => {
                return Err(err)
            }
            Err(err) => {
                trace!(
                    target: "crucible.readiness",
                    instance = %instance,
                    error = %err,
                    "Probe failed"
                );
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= budget {
            return Err(RuntimeError::ReadinessTimeout { timeout: budget });
        }

        let remaining = budget.saturating_sub(elapsed);
        sleep(delay.min(remaining)).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
}
