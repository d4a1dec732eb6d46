//! Outer retry and runtime budget
//!
//! The cycle gets one wall-clock budget for the whole run and up to three
//! attempts when it fails with something transient. Anything else surfaces
//! immediately and the process exits non-zero.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cycle::{CycleReport, HeartbeatCycle};
use crate::error::HeartbeatError;

/// Wall-clock budget for one run (5.5 hours)
pub const RUNTIME_BUDGET: Duration = Duration::from_secs(19_800);
/// Pauses between cycle attempts
const CYCLE_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(15), Duration::from_secs(45)];
/// Total attempts, including the first
pub const MAX_CYCLE_ATTEMPTS: usize = CYCLE_RETRY_DELAYS.len() + 1;

/// Runs the cycle under the retry/budget policy
pub struct Supervisor {
    cycle: HeartbeatCycle,
    cancel: CancellationToken,
    budget: Duration,
}

impl Supervisor {
    /// Creates the supervisor with the production budget
    #[must_use]
    pub fn new(cycle: HeartbeatCycle, cancel: CancellationToken) -> Self {
        Self {
            cycle,
            cancel,
            budget: RUNTIME_BUDGET,
        }
    }

    /// Runs to completion, retrying transient failures
    ///
    /// # Errors
    ///
    /// The final error once retries are exhausted, or immediately for a
    /// non-transient failure
    pub async fn run(&self) -> Result<CycleReport, HeartbeatError> {
        let deadline = Instant::now() + self.budget;
        let mut attempt = 1;

        loop {
            match self.cycle.run(Utc::now(), Some(deadline)).await {
                Ok(report) => {
                    info!(attempt, "heartbeat cycle finished");
                    return Ok(report);
                }
                Err(e)
                    if e.is_transient()
                        && attempt < MAX_CYCLE_ATTEMPTS
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = CYCLE_RETRY_DELAYS[attempt - 1];
                    warn!(
                        error = %e,
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        "transient cycle failure; retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
