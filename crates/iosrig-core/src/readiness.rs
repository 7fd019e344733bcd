//! Bounded-retry polling.
//!
//! [`ReadinessGate`] invokes a probe until it reports success or a wall-clock
//! budget runs out. The probe always runs at least once, even with a zero
//! timeout. Between failed attempts the gate sleeps for a fixed interval.
//!
//! The gate does not distinguish "timed out" from "the probe will never
//! succeed". Callers decide whether a `false` result is fatal.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use iosrig_core::readiness::ReadinessGate;
//!
//! let mut remaining = 2;
//! let gate = ReadinessGate::new(Duration::from_secs(1), Duration::from_millis(1));
//! let ready = gate.poll(|| {
//!     remaining -= 1;
//!     remaining == 0
//! });
//! assert!(ready);
//! ```

use std::convert::Infallible;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// Library default budget for generic callers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Library default pause between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Budget used by the service orchestrators.
pub const SERVICE_TIMEOUT: Duration = Duration::from_secs(120);
/// Pause between attempts used by the service orchestrators.
pub const SERVICE_INTERVAL: Duration = Duration::from_secs(1);

/// Bookkeeping for one polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Result of the last probe invocation.
    pub succeeded: bool,
    /// Number of probe invocations.
    pub attempts: u32,
    /// Wall-clock time from the first invocation to the end of the loop.
    pub elapsed: Duration,
}

/// Bounded-retry polling loop over a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessGate {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl ReadinessGate {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// The 2 minute / 1 second gate both orchestrators use.
    pub fn for_services() -> Self {
        Self::new(SERVICE_TIMEOUT, SERVICE_INTERVAL)
    }

    /// Poll until `probe` returns `true` or the timeout elapses.
    pub fn poll<P>(&self, probe: P) -> bool
    where
        P: FnMut() -> bool,
    {
        self.poll_outcome(probe).succeeded
    }

    /// Like [`poll`](Self::poll), but reports attempts and elapsed time.
    pub fn poll_outcome<P>(&self, mut probe: P) -> PollOutcome
    where
        P: FnMut() -> bool,
    {
        match self.try_poll(|| Ok::<_, Infallible>(probe())) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Poll a fallible probe. The first `Err` aborts the loop and is returned
    /// as-is; `Ok(false)` means "not yet".
    pub fn try_poll<P, E>(&self, mut probe: P) -> Result<PollOutcome, E>
    where
        P: FnMut() -> Result<bool, E>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let succeeded = probe()?;
            trace!(attempt = attempts, succeeded, "Readiness probe");

            if succeeded || started.elapsed() >= self.timeout {
                return Ok(PollOutcome {
                    succeeded,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }

            thread::sleep(self.interval);

            if started.elapsed() >= self.timeout {
                return Ok(PollOutcome {
                    succeeded: false,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
        }
    }
}
