//! HTTP health probe.
//!
//! A [`HealthProbe`] issues one GET against a status URL. It reports ready
//! only for a 2xx response. Connection refused, resets, timeouts and non-2xx
//! statuses all mean "not ready yet". A service that has not opened its
//! socket is an expected transient state, so the probe never returns an error.

use std::time::Duration;

use tracing::debug;

/// Per-request timeout used unless overridden.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-shot HTTP GET health check.
#[derive(Clone)]
pub struct HealthProbe {
    url: String,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe").field("url", &self.url).finish()
    }
}

impl HealthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    /// Probe `http://{host}:{port}{path}`.
    pub fn for_endpoint(host: &str, port: u16, path: &str) -> Self {
        Self::new(format!("http://{host}:{port}{path}"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `true` iff the endpoint answered with a 2xx status.
    pub fn check(&self) -> bool {
        match self.agent.get(&self.url).call() {
            Ok(response) => {
                let status = response.status();
                let ready = (200..=299).contains(&status);
                if !ready {
                    debug!(url = %self.url, status, "Service not ready yet");
                }
                ready
            }
            Err(ureq::Error::Status(status, _)) => {
                debug!(url = %self.url, status, "Service not ready yet");
                false
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Service not reachable yet");
                false
            }
        }
    }
}
