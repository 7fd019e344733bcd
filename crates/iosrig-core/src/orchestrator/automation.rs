//! The Appium automation server.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use super::{
    await_ready, require_alive, Lifecycle, OrchestratorError, ServiceOrchestrator, ServiceState,
    ServiceTimeouts,
};
use crate::health::HealthProbe;
use crate::ports::{PortAssignment, PortPlan};
use crate::process::{ProcessSpec, Redirect};
use crate::supervisor::ProcessSupervisor;

/// PATH handed to the server so it finds node and friends regardless of the
/// caller's environment.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Configuration for [`AutomationServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationServerConfig {
    /// Executable and leading arguments; role flags are appended.
    pub command: Vec<String>,
    /// Host the health probe connects to.
    pub host: String,
    /// Directory for `appium.txt`, `appiumOutput.txt` and `appiumError.txt`.
    pub log_dir: PathBuf,
    /// Replaces `PATH` in the server's environment when set.
    pub path_override: Option<String>,
    pub status_path: String,
    pub timeouts: ServiceTimeouts,
}

impl Default for AutomationServerConfig {
    fn default() -> Self {
        Self {
            command: vec!["appium".to_string()],
            host: "localhost".to_string(),
            log_dir: PathBuf::from("appium"),
            path_override: Some(DEFAULT_PATH.to_string()),
            status_path: "/wd/hub/status".to_string(),
            timeouts: ServiceTimeouts::default(),
        }
    }
}

/// One Appium server bound to a base port and its derived role ports.
pub struct AutomationServer {
    config: AutomationServerConfig,
    ports: PortAssignment,
    supervisor: ProcessSupervisor,
    lifecycle: Lifecycle,
}

impl AutomationServer {
    /// # Errors
    ///
    /// [`OrchestratorError::Ports`] if the derived ports overflow.
    pub fn new(base_port: u16, config: AutomationServerConfig) -> Result<Self, OrchestratorError> {
        let ports = PortPlan::derive(base_port)?;
        Ok(Self {
            config,
            ports,
            supervisor: ProcessSupervisor::new("appium"),
            lifecycle: Lifecycle::new(format!("appium:{base_port}")),
        })
    }

    pub fn ports(&self) -> &PortAssignment {
        &self.ports
    }

    /// WebDriver endpoint for clients, e.g. `http://localhost:4723/wd/hub`.
    pub fn hub_url(&self) -> String {
        format!("http://{}:{}/wd/hub", self.config.host, self.ports.base)
    }

    pub fn status_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.config.host, self.ports.base, self.config.status_path
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Launch description for the server process, logging into `log_dir`.
    pub fn process_spec(&self, log_dir: &Path) -> Result<ProcessSpec, OrchestratorError> {
        let ports = &self.ports;
        let spec = ProcessSpec::from_command(&self.config.command).ok_or_else(|| {
            OrchestratorError::EmptyCommand {
                name: self.lifecycle.name().to_string(),
                role: "appium",
            }
        })?;

        let mut spec = spec
            .args(["--log-timestamp", "--log-level", "debug", "--log"])
            .arg(log_dir.join("appium.txt").display().to_string())
            .args(["-p".to_string(), ports.base.to_string()])
            .args(["-bp".to_string(), ports.bootstrap.to_string()])
            .args(["--selendroid-port".to_string(), ports.secondary.to_string()])
            .args(["--chromedriver-port".to_string(), ports.tertiary.to_string()])
            .arg("--tmp")
            .arg(log_dir.join("tmp-instruments.txt").display().to_string())
            .stdout(Redirect::File(log_dir.join("appiumOutput.txt")))
            .stderr(Redirect::File(log_dir.join("appiumError.txt")));

        if let Some(path) = &self.config.path_override {
            spec = spec.env("PATH", path.clone());
        }
        Ok(spec)
    }

    fn launch(&mut self) -> Result<(), OrchestratorError> {
        let log_dir = &self.config.log_dir;
        let io_err = |source| OrchestratorError::Io {
            path: log_dir.clone(),
            source,
        };
        fs::create_dir_all(log_dir).map_err(io_err)?;
        let log_dir = fs::canonicalize(log_dir).map_err(io_err)?;
        info!(path = %log_dir.display(), "Folder for logs");

        let spec = self.process_spec(&log_dir)?;
        self.supervisor.start(spec)?;
        Ok(())
    }
}

impl ServiceOrchestrator for AutomationServer {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    fn start(&mut self) -> Result<ServiceState, OrchestratorError> {
        let span = info_span!("appium", port = self.ports.base);
        let _enter = span.enter();

        self.lifecycle.begin_start()?;
        info!(ports = %self.ports, "Starting Appium server");

        if let Err(e) = self.launch() {
            self.lifecycle.fail();
            return Err(e);
        }

        let probe = HealthProbe::new(self.status_url());
        let gate = self.config.timeouts.gate();
        let supervisor = &mut self.supervisor;
        let ready = await_ready(self.lifecycle.name(), &probe, gate, || {
            require_alive(&mut *supervisor)?;
            Ok(probe.check())
        });

        Ok(self.lifecycle.finish_start(ready))
    }

    fn stop(&mut self) -> Result<(), OrchestratorError> {
        let span = info_span!("appium", port = self.ports.base);
        let _enter = span.enter();

        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        info!("Stopping Appium server");

        let timeouts = self.config.timeouts;
        match self
            .supervisor
            .stop_with(timeouts.graceful_stop, timeouts.forceful_stop)
        {
            Ok(()) => {
                self.lifecycle.finish_stop(true);
                info!("Appium server stopped");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.finish_stop(false);
                Err(e.into())
            }
        }
    }
}
