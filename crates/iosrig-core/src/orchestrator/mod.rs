//! Service orchestration: bring a service up, gate on health, tear it down.
//!
//! Both orchestrators share one small state machine:
//!
//! ```text
//! Stopped ──start()──▶ Starting ──▶ Ready
//!                          │
//!                          └──────▶ Failed
//! {Starting, Ready, Failed} ──stop()──▶ Stopping ──▶ Stopped
//! ```
//!
//! `start()` is only valid from `Stopped`. `stop()` is valid from any state
//! and is a no-op when already `Stopped`.
//!
//! # Failure contract
//!
//! Both orchestrators fail the same way:
//!
//! - **Spawn failures** are returned to the caller of `start()`, and the
//!   state becomes `Failed`.
//! - **Readiness failures** are logged and leave the orchestrator in
//!   `Failed`; `start()` returns `Ok(ServiceState::Failed)`. This covers a
//!   gate timeout and also a managed process that exits while the gate is
//!   polling, which aborts the gate immediately. A device that never becomes
//!   healthy is a skipped target, not an error.
//! - **Stopping** goes through each supervisor's graceful-then-forceful path.
//!   A process that survives both phases is returned as
//!   [`SupervisorError::ForcefulStopFailure`].

mod automation;
mod bridge;

pub use automation::{AutomationServer, AutomationServerConfig};
pub use bridge::{BridgeServer, BridgeServerConfig};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::health::HealthProbe;
use crate::ports::PortPlanError;
use crate::process::ProcessControl;
use crate::readiness::{PollOutcome, ReadinessGate, SERVICE_INTERVAL, SERVICE_TIMEOUT};
use crate::supervisor::{ProcessSupervisor, SupervisorError, DEFAULT_STOP_TIMEOUT};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Ready,
    Failed,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by orchestrator `start()` / `stop()`.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// `start()` was called while not `Stopped`.
    #[error("{name} already started (state: {state})")]
    AlreadyStarted { name: String, state: ServiceState },

    /// A configured command line is empty.
    #[error("{name}: command for {role} is empty")]
    EmptyCommand { name: String, role: &'static str },

    /// A managed process could not be spawned or could not be stopped.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The base port cannot host all derived role ports.
    #[error(transparent)]
    Ports(#[from] PortPlanError),

    /// A required directory could not be prepared.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raised by a composite probe when a managed process has exited; aborts the
/// readiness gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{role} exited before becoming ready (exit code: {})", exit_code_text(.exit_code))]
pub struct ProcessExited {
    pub role: String,
    pub exit_code: Option<i32>,
}

fn exit_code_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Readiness and stop bounds for one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTimeouts {
    #[serde(rename = "readiness_timeout_ms", with = "crate::config::duration_ms")]
    pub readiness_timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    #[serde(rename = "graceful_stop_ms", with = "crate::config::duration_ms")]
    pub graceful_stop: Duration,
    #[serde(rename = "forceful_stop_ms", with = "crate::config::duration_ms")]
    pub forceful_stop: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            readiness_timeout: SERVICE_TIMEOUT,
            poll_interval: SERVICE_INTERVAL,
            graceful_stop: DEFAULT_STOP_TIMEOUT,
            forceful_stop: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl ServiceTimeouts {
    pub fn gate(&self) -> ReadinessGate {
        ReadinessGate::new(self.readiness_timeout, self.poll_interval)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator trait
// ---------------------------------------------------------------------------

/// A service with a start/stop lifecycle gated on health.
pub trait ServiceOrchestrator: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Spawn the service and block until it is ready or the gate gives up.
    ///
    /// Returns the resulting state: `Ready` or `Failed`.
    fn start(&mut self) -> Result<ServiceState, OrchestratorError>;

    /// Tear the service down. Idempotent.
    fn stop(&mut self) -> Result<(), OrchestratorError>;

    fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }
}

// ---------------------------------------------------------------------------
// Shared lifecycle helpers
// ---------------------------------------------------------------------------

/// Enforces the state transitions shared by every orchestrator.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    name: String,
    state: ServiceState,
}

impl Lifecycle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::Stopped,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.state
    }

    fn set(&mut self, state: ServiceState) -> ServiceState {
        debug!(name = %self.name, from = %self.state, to = %state, "State transition");
        self.state = state;
        state
    }

    /// `Stopped → Starting`, or `AlreadyStarted`.
    pub(crate) fn begin_start(&mut self) -> Result<(), OrchestratorError> {
        if self.state != ServiceState::Stopped {
            return Err(OrchestratorError::AlreadyStarted {
                name: self.name.clone(),
                state: self.state,
            });
        }
        self.set(ServiceState::Starting);
        Ok(())
    }

    /// `Starting → Ready | Failed` depending on the gate outcome.
    pub(crate) fn finish_start(&mut self, ready: bool) -> ServiceState {
        self.set(if ready {
            ServiceState::Ready
        } else {
            ServiceState::Failed
        })
    }

    pub(crate) fn fail(&mut self) -> ServiceState {
        self.set(ServiceState::Failed)
    }

    /// Enter `Stopping`. Returns `false` if already `Stopped`.
    pub(crate) fn begin_stop(&mut self) -> bool {
        if self.state == ServiceState::Stopped {
            return false;
        }
        self.set(ServiceState::Stopping);
        true
    }

    /// Leave `Stopping`: `Stopped` on success, `Failed` if something survived.
    pub(crate) fn finish_stop(&mut self, clean: bool) -> ServiceState {
        self.set(if clean {
            ServiceState::Stopped
        } else {
            ServiceState::Failed
        })
    }
}

/// Fail the probe if the supervised process has exited.
pub(crate) fn require_alive<C: ProcessControl>(
    supervisor: &mut ProcessSupervisor<C>,
) -> Result<(), ProcessExited> {
    if supervisor.is_alive() {
        Ok(())
    } else {
        Err(ProcessExited {
            role: supervisor.name().to_string(),
            exit_code: supervisor.exit_code(),
        })
    }
}

/// Run the gate and log its verdict. Returns whether the service is ready.
pub(crate) fn await_ready<P>(name: &str, probe: &HealthProbe, gate: ReadinessGate, check: P) -> bool
where
    P: FnMut() -> Result<bool, ProcessExited>,
{
    match gate.try_poll(check) {
        Ok(PollOutcome {
            succeeded: true,
            attempts,
            elapsed,
        }) => {
            tracing::info!(
                name,
                url = probe.url(),
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "Service is running and ready to accept requests"
            );
            true
        }
        Ok(PollOutcome {
            attempts, elapsed, ..
        }) => {
            warn!(
                name,
                url = probe.url(),
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "Service did not become ready before timeout"
            );
            false
        }
        Err(exited) => {
            warn!(name, error = %exited, "Service process died while waiting for readiness");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_from_stopped() {
        let mut lifecycle = Lifecycle::new("svc");
        lifecycle.begin_start().unwrap();
        assert_eq!(lifecycle.state(), ServiceState::Starting);

        let err = lifecycle.begin_start().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AlreadyStarted {
                state: ServiceState::Starting,
                ..
            }
        ));

        assert_eq!(lifecycle.finish_start(true), ServiceState::Ready);
        assert!(lifecycle.begin_start().is_err());
    }

    #[test]
    fn failed_start_requires_stop() {
        let mut lifecycle = Lifecycle::new("svc");
        lifecycle.begin_start().unwrap();
        assert_eq!(lifecycle.finish_start(false), ServiceState::Failed);
        assert!(lifecycle.begin_start().is_err());

        assert!(lifecycle.begin_stop());
        assert_eq!(lifecycle.state(), ServiceState::Stopping);
        assert_eq!(lifecycle.finish_stop(true), ServiceState::Stopped);
        lifecycle.begin_start().unwrap();
    }

    #[test]
    fn stop_from_stopped_is_noop() {
        let mut lifecycle = Lifecycle::new("svc");
        assert!(!lifecycle.begin_stop());
        assert_eq!(lifecycle.state(), ServiceState::Stopped);
    }

    #[test]
    fn unclean_stop_lands_in_failed() {
        let mut lifecycle = Lifecycle::new("svc");
        lifecycle.begin_start().unwrap();
        lifecycle.finish_start(true);
        assert!(lifecycle.begin_stop());
        assert_eq!(lifecycle.finish_stop(false), ServiceState::Failed);
        // stop() may be retried from Failed.
        assert!(lifecycle.begin_stop());
    }

    #[test]
    fn default_timeouts() {
        let t = ServiceTimeouts::default();
        assert_eq!(t.readiness_timeout, Duration::from_secs(120));
        assert_eq!(t.poll_interval, Duration::from_secs(1));
        assert_eq!(t.graceful_stop, Duration::from_secs(30));
        assert_eq!(t.forceful_stop, Duration::from_secs(30));
        assert_eq!(t.gate(), ReadinessGate::for_services());
    }

    #[test]
    fn timeouts_serialize_as_millis() {
        let t = ServiceTimeouts {
            readiness_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let json = serde_json::to_value(t).unwrap();
        assert_eq!(json["readiness_timeout_ms"], 2000);
        assert_eq!(json["poll_interval_ms"], 50);

        let partial: ServiceTimeouts =
            serde_json::from_str(r#"{"poll_interval_ms": 250}"#).unwrap();
        assert_eq!(partial.poll_interval, Duration::from_millis(250));
        assert_eq!(partial.readiness_timeout, Duration::from_secs(120));
    }

    #[test]
    fn error_display() {
        let err = OrchestratorError::AlreadyStarted {
            name: "appium:4723".into(),
            state: ServiceState::Ready,
        };
        assert_eq!(err.to_string(), "appium:4723 already started (state: ready)");

        let exited = ProcessExited {
            role: "iproxy".into(),
            exit_code: Some(1),
        };
        assert_eq!(
            exited.to_string(),
            "iproxy exited before becoming ready (exit code: 1)"
        );
        let unknown = ProcessExited {
            role: "xcodebuild".into(),
            exit_code: None,
        };
        assert!(unknown.to_string().contains("unknown"));
    }
}
