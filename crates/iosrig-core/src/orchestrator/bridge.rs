//! The on-device WebDriverAgent bridge: an `xcodebuild` test runner plus an
//! `iproxy` port forwarder.
//!
//! Construction performs the one-time signing setup (identity import and the
//! bundle id patch). Both steps are best-effort; a host that was prepared
//! earlier still yields a usable bridge.
//!
//! # Example
//!
//! ```no_run
//! use iosrig_core::orchestrator::{
//!     BridgeServer, BridgeServerConfig, ServiceOrchestrator, ServiceState,
//! };
//!
//! let uuid = "656d6ef9da2ccb39d34b00fe7e0c23fe7ec91278";
//! let mut bridge = BridgeServer::new(uuid, 8100, BridgeServerConfig::default());
//! if bridge.start()? == ServiceState::Ready {
//!     println!("agent at {}", bridge.server_url());
//! }
//! bridge.stop()?;
//! # Ok::<(), iosrig_core::orchestrator::OrchestratorError>(())
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::{
    await_ready, require_alive, Lifecycle, OrchestratorError, ServiceOrchestrator, ServiceState,
    ServiceTimeouts,
};
use crate::health::HealthProbe;
use crate::process::{ProcessSpec, Redirect};
use crate::signing::{self, BundleIdPatch, PatchOutcome, SigningConfig};
use crate::supervisor::ProcessSupervisor;

/// WebDriverAgent as shipped inside the XCUITest driver of a global Appium
/// install.
pub const DEFAULT_PROJECT_DIR: &str =
    "/usr/local/lib/node_modules/appium/node_modules/appium-xcuitest-driver/WebDriverAgent";

/// Port the agent listens on inside the device.
pub const DEFAULT_REMOTE_PORT: u16 = 8100;

/// Configuration for [`BridgeServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeServerConfig {
    pub project_dir: PathBuf,
    /// Project bundle name, relative to `project_dir`.
    pub project_name: String,
    pub scheme: String,
    pub deployment_target: String,
    /// Passed as `-xcconfig` when set.
    pub xcconfig: Option<PathBuf>,
    /// Rewrite applied once to `project.pbxproj`; `None` skips it.
    pub bundle_id_patch: Option<BundleIdPatch>,
    /// Keychain setup; `None` skips identity import and unlocking.
    pub signing: Option<SigningConfig>,
    pub remote_port: u16,
    pub build_command: Vec<String>,
    pub forward_command: Vec<String>,
    /// Run `Scripts/bootstrap.sh -d` before building.
    pub bootstrap: bool,
    pub status_path: String,
    pub timeouts: ServiceTimeouts,
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from(DEFAULT_PROJECT_DIR),
            project_name: "WebDriverAgent.xcodeproj".to_string(),
            scheme: "WebDriverAgentRunner".to_string(),
            deployment_target: "11.2".to_string(),
            xcconfig: None,
            bundle_id_patch: Some(BundleIdPatch::default()),
            signing: None,
            remote_port: DEFAULT_REMOTE_PORT,
            build_command: vec!["xcodebuild".to_string()],
            forward_command: vec!["iproxy".to_string()],
            bootstrap: true,
            status_path: "/status".to_string(),
            timeouts: ServiceTimeouts::default(),
        }
    }
}

impl BridgeServerConfig {
    /// `<project_dir>/<project_name>/project.pbxproj`
    pub fn project_file(&self) -> PathBuf {
        self.project_dir
            .join(&self.project_name)
            .join("project.pbxproj")
    }

    pub fn resource_dir(&self) -> PathBuf {
        self.project_dir
            .join("Resources")
            .join("WebDriverAgent.bundle")
    }

    pub fn bootstrap_script(&self) -> PathBuf {
        self.project_dir.join("Scripts").join("bootstrap.sh")
    }
}

/// Test runner and forwarder for one physical device.
pub struct BridgeServer {
    uuid: String,
    local_port: u16,
    config: BridgeServerConfig,
    build: ProcessSupervisor,
    forwarder: ProcessSupervisor,
    lifecycle: Lifecycle,
}

impl BridgeServer {
    pub fn new(uuid: impl Into<String>, local_port: u16, config: BridgeServerConfig) -> Self {
        let uuid = uuid.into();
        let name = format!("wda:{uuid}");

        if let Some(keychain) = &config.signing {
            if let Err(e) = signing::import_identities(keychain) {
                warn!(name = %name, error = %e, "Identity import failed, continuing");
            }
        }
        if let Some(patch) = &config.bundle_id_patch {
            match signing::patch_bundle_id(&config.project_file(), patch) {
                Ok(PatchOutcome::Applied { replacements }) => {
                    info!(name = %name, replacements, to = %patch.to, "Bundle identifier patched");
                }
                Ok(PatchOutcome::AlreadyApplied) => {}
                Err(e) => warn!(
                    name = %name,
                    error = %e,
                    "Bundle identifier patch failed, continuing"
                ),
            }
        }

        Self {
            uuid,
            local_port,
            config,
            build: ProcessSupervisor::new("xcodebuild"),
            forwarder: ProcessSupervisor::new("iproxy"),
            lifecycle: Lifecycle::new(name),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Agent endpoint on the host, e.g. `http://127.0.0.1:8100`.
    pub fn server_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    pub fn status_url(&self) -> String {
        format!("{}{}", self.server_url(), self.config.status_path)
    }

    fn empty_command(&self, role: &'static str) -> OrchestratorError {
        OrchestratorError::EmptyCommand {
            name: self.lifecycle.name().to_string(),
            role,
        }
    }

    /// Launch description for the test runner.
    pub fn build_spec(&self) -> Result<ProcessSpec, OrchestratorError> {
        let config = &self.config;
        let spec = ProcessSpec::from_command(&config.build_command)
            .ok_or_else(|| self.empty_command("xcodebuild"))?;

        let mut spec = spec
            .args(["build-for-testing", "test-without-building", "-project"])
            .arg(config.project_name.as_str())
            .arg("-scheme")
            .arg(config.scheme.as_str())
            .arg("-destination")
            .arg(format!("id={}", self.uuid))
            .arg(format!("IPHONEOS_DEPLOYMENT_TARGET={}", config.deployment_target))
            .arg("-allowProvisioningUpdates");
        if let Some(xcconfig) = &config.xcconfig {
            spec = spec.arg("-xcconfig").arg(xcconfig.display().to_string());
        }

        Ok(spec
            .current_dir(&config.project_dir)
            .stdout(Redirect::Log(format!("xcodebuild:{}", self.uuid)))
            .stderr(Redirect::Log(format!("xcodebuild:{}", self.uuid))))
    }

    /// Launch description for the forwarder: `<local> <remote> <uuid>`.
    pub fn forward_spec(&self) -> Result<ProcessSpec, OrchestratorError> {
        let spec = ProcessSpec::from_command(&self.config.forward_command)
            .ok_or_else(|| self.empty_command("iproxy"))?;
        Ok(spec
            .arg(self.local_port.to_string())
            .arg(self.config.remote_port.to_string())
            .arg(self.uuid.as_str())
            .stdout(Redirect::Log(format!("iproxy:{}", self.uuid)))
            .stderr(Redirect::Log(format!("iproxy:{}", self.uuid))))
    }

    fn unlock_keychain(&self) {
        if let Some(keychain) = &self.config.signing {
            if let Err(e) = signing::unlock_keychain(keychain) {
                warn!(error = %e, "Keychain unlock failed, continuing");
            }
        }
    }

    fn run_bootstrap(&self) {
        if !self.config.bootstrap {
            return;
        }
        let script = self.config.bootstrap_script();
        if !script.is_file() {
            debug!(script = %script.display(), "No bootstrap script, skipping");
            return;
        }
        let output = Command::new(&script)
            .arg("-d")
            .current_dir(&self.config.project_dir)
            .output();
        match output {
            Ok(output) if output.status.success() => {
                info!(script = %script.display(), "Bootstrap finished");
            }
            Ok(output) => warn!(
                script = %script.display(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Bootstrap failed, continuing"
            ),
            Err(e) => warn!(
                script = %script.display(),
                error = %e,
                "Bootstrap could not run, continuing"
            ),
        }
    }

    fn launch(&mut self) -> Result<(), OrchestratorError> {
        self.unlock_keychain();

        let resources = self.config.resource_dir();
        fs::create_dir_all(&resources).map_err(|source| OrchestratorError::Io {
            path: resources.clone(),
            source,
        })?;

        self.run_bootstrap();

        let build = self.build_spec()?;
        let forward = self.forward_spec()?;

        let pid = self.build.start(build)?.pid();
        info!(pid, "Test runner started");
        let pid = self.forwarder.start(forward)?.pid();
        info!(
            pid,
            local = self.local_port,
            remote = self.config.remote_port,
            "Port forwarder started"
        );
        Ok(())
    }
}

impl ServiceOrchestrator for BridgeServer {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    fn start(&mut self) -> Result<ServiceState, OrchestratorError> {
        let span = info_span!("wda", device = %self.uuid, port = self.local_port);
        let _enter = span.enter();

        self.lifecycle.begin_start()?;
        info!("Starting WebDriverAgent");

        if let Err(e) = self.launch() {
            self.lifecycle.fail();
            return Err(e);
        }

        let probe = HealthProbe::new(self.status_url());
        let gate = self.config.timeouts.gate();
        let build = &mut self.build;
        let forwarder = &mut self.forwarder;
        let ready = await_ready(self.lifecycle.name(), &probe, gate, || {
            require_alive(&mut *build)?;
            require_alive(&mut *forwarder)?;
            Ok(probe.check())
        });

        Ok(self.lifecycle.finish_start(ready))
    }

    fn stop(&mut self) -> Result<(), OrchestratorError> {
        let span = info_span!("wda", device = %self.uuid, port = self.local_port);
        let _enter = span.enter();

        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        info!("Stopping WebDriverAgent");

        let timeouts = self.config.timeouts;
        // Both are always attempted; the first failure is reported.
        let forwarder = self
            .forwarder
            .stop_with(timeouts.graceful_stop, timeouts.forceful_stop);
        let build = self
            .build
            .stop_with(timeouts.graceful_stop, timeouts.forceful_stop);

        match forwarder.and(build) {
            Ok(()) => {
                self.lifecycle.finish_stop(true);
                info!("WebDriverAgent stopped");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.finish_stop(false);
                Err(e.into())
            }
        }
    }
}
