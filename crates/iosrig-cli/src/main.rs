//! CLI for bringing up Appium and WebDriverAgent against attached iOS devices.
//!
//! # Usage
//!
//! ```bash
//! # List attached hardware devices
//! iosrig devices
//! iosrig devices --json
//!
//! # Show the ports an Appium server on 7500 would use
//! iosrig ports 7500
//!
//! # Run one Appium server until Ctrl-C
//! iosrig appium --port 4723
//!
//! # Appium + WebDriverAgent for every attached device until Ctrl-C
//! iosrig run --base-port 7500 --bridge-port 8100
//!
//! # Use another config file and log to a file instead of stderr
//! iosrig --config ./rig.json --log-file /tmp/iosrig.log run
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use iosrig_core::config::{ConfigError, HarnessConfig};
use iosrig_core::discovery::{DeviceRecord, DiscoveryError};
use iosrig_core::orchestrator::{
    AutomationServer, BridgeServer, OrchestratorError, ServiceOrchestrator, ServiceState,
};
use iosrig_core::ports::{PortPlan, PortPlanError, BASE_PORT_STRIDE};
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

/// Appium + WebDriverAgent rigs for physical iOS devices.
#[derive(Parser)]
#[command(name = "iosrig")]
#[command(about = "Discover iOS devices and run Appium/WebDriverAgent against them")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.iosrig/config.json)
    #[arg(short, long, global = true, env = "IOSRIG_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "IOSRIG_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached hardware devices
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the ports derived from a base port
    Ports {
        /// Base port of the Appium server
        base: u16,
    },

    /// Start one Appium server and keep it up until interrupted
    Appium {
        /// Base port
        #[arg(short, long, default_value_t = 4723)]
        port: u16,
    },

    /// Start Appium and WebDriverAgent for every device until interrupted
    Run {
        /// Appium base port of the first device
        #[arg(long, default_value_t = 7500)]
        base_port: u16,
        /// Local WebDriverAgent port of the first device
        #[arg(long, default_value_t = 8100)]
        bridge_port: u16,
        /// Distance between the Appium base ports of consecutive devices
        #[arg(long, default_value_t = BASE_PORT_STRIDE)]
        stride: u16,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Discovery(DiscoveryError),
    Orchestrator(OrchestratorError),
    Ports(PortPlanError),
    NoDevices,
    Runtime(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::NoDevices => ExitCode::from(2),
            CliError::Config(_) => ExitCode::from(3),
            _ => ExitCode::from(1),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "Config error: {}", e),
            CliError::Discovery(e) => write!(f, "Device discovery failed: {}", e),
            CliError::Orchestrator(e) => write!(f, "{}", e),
            CliError::Ports(e) => write!(f, "{}", e),
            CliError::NoDevices => write!(f, "No devices found"),
            CliError::Runtime(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<DiscoveryError> for CliError {
    fn from(e: DiscoveryError) -> Self {
        CliError::Discovery(e)
    }
}

impl From<OrchestratorError> for CliError {
    fn from(e: OrchestratorError) -> Self {
        CliError::Orchestrator(e)
    }
}

impl From<PortPlanError> for CliError {
    fn from(e: PortPlanError) -> Self {
        CliError::Ports(e)
    }
}

impl From<tokio::task::JoinError> for CliError {
    fn from(e: tokio::task::JoinError) -> Self {
        CliError::Runtime(format!("worker task failed: {}", e))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = log_file.and_then(|path| Some((path.parent()?, path.file_name()?)));
    match file {
        Some((dir, name)) => {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Command::Ports { base } => {
            let plan = PortPlan::derive(base)?;
            for (role, port) in plan.roles() {
                println!("{:<10} {}", role, port);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Devices { json } => {
            let config = load_config(cli.config.as_deref())?;
            let devices = list_devices(&config).await?;
            if json {
                let out = serde_json::to_string_pretty(&devices)
                    .map_err(|e| CliError::Runtime(e.to_string()))?;
                println!("{}", out);
            } else if devices.is_empty() {
                eprintln!("No devices found");
            } else {
                for device in &devices {
                    println!("{:<42} {:<24} {}", device.uuid, device.name, device.os_version);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Appium { port } => {
            let config = load_config(cli.config.as_deref())?;
            run_appium(port, config).await
        }
        Command::Run {
            base_port,
            bridge_port,
            stride,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_rigs(config, base_port, bridge_port, stride).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig, CliError> {
    let config = match path {
        Some(path) => HarnessConfig::load_from(path)?,
        None => HarnessConfig::load()?,
    };
    Ok(config)
}

async fn list_devices(config: &HarnessConfig) -> Result<Vec<DeviceRecord>, CliError> {
    let discovery = config.discovery.discovery();
    let devices = tokio::task::spawn_blocking(move || discovery.list_devices()).await??;
    info!(count = devices.len(), "Devices discovered");
    Ok(devices)
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
    }
}

// ---------------------------------------------------------------------------
// appium
// ---------------------------------------------------------------------------

async fn run_appium(port: u16, config: HarnessConfig) -> Result<ExitCode, CliError> {
    let server = AutomationServer::new(port, config.automation)?;

    let (mut server, started) = tokio::task::spawn_blocking(move || {
        let mut server = server;
        let started = server.start();
        (server, started)
    })
    .await?;

    let ready = match started {
        Ok(state) => state == ServiceState::Ready,
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    };

    if ready {
        println!("{}", server.hub_url());
        shutdown_signal().await;
    }

    let stopped = tokio::task::spawn_blocking(move || server.stop()).await?;
    stopped?;
    Ok(if ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Both services for one device.
struct DeviceRig {
    device: DeviceRecord,
    appium: AutomationServer,
    bridge: BridgeServer,
}

impl DeviceRig {
    /// Start both services. Errors are logged; the returned states are what
    /// the caller reports.
    fn start(&mut self) -> (ServiceState, ServiceState) {
        let span = info_span!("device", device = %self.device.uuid);
        let _enter = span.enter();

        let appium = start_logged(&mut self.appium);
        let bridge = start_logged(&mut self.bridge);
        (appium, bridge)
    }

    /// Stop both services. Returns whether everything stopped cleanly.
    fn stop(&mut self) -> bool {
        let span = info_span!("device", device = %self.device.uuid);
        let _enter = span.enter();

        let appium = stop_logged(&mut self.appium);
        let bridge = stop_logged(&mut self.bridge);
        appium && bridge
    }
}

fn start_logged(service: &mut dyn ServiceOrchestrator) -> ServiceState {
    match service.start() {
        Ok(state) => state,
        Err(e) => {
            error!(name = service.name(), error = %e, "Start failed");
            service.state()
        }
    }
}

fn stop_logged(service: &mut dyn ServiceOrchestrator) -> bool {
    match service.stop() {
        Ok(()) => true,
        Err(e) => {
            error!(name = service.name(), error = %e, "Stop failed");
            false
        }
    }
}

/// Ports assigned to one device before anything is launched.
#[derive(Debug)]
struct RigPlan {
    device: DeviceRecord,
    base: u16,
    local: u16,
}

/// Assign an Appium base port and a local bridge port to every device.
///
/// Fails without side effects if any device cannot be given both ports.
fn plan_rigs(
    devices: Vec<DeviceRecord>,
    base_port: u16,
    bridge_port: u16,
    stride: u16,
) -> Result<Vec<RigPlan>, CliError> {
    let bases = PortPlan::base_ports(base_port, stride, devices.len());
    if bases.len() < devices.len() {
        let last = bases.last().copied().unwrap_or(base_port);
        return Err(PortPlanError::Overflow {
            base: last.saturating_add(stride),
            max: PortPlan::MAX_BASE,
        }
        .into());
    }

    devices
        .into_iter()
        .zip(bases)
        .enumerate()
        .map(|(i, (device, base))| {
            let local = u16::try_from(i)
                .ok()
                .and_then(|i| bridge_port.checked_add(i))
                .ok_or_else(|| {
                    CliError::Runtime(format!("no bridge port left for {}", device.uuid))
                })?;
            Ok(RigPlan {
                device,
                base,
                local,
            })
        })
        .collect()
}

/// Stop every rig, waiting for all of them even if one task fails.
async fn stop_rigs(rigs: Vec<DeviceRig>) -> Result<bool, CliError> {
    let stops: Vec<_> = rigs
        .into_iter()
        .map(|mut rig| tokio::task::spawn_blocking(move || rig.stop()))
        .collect();

    let mut clean = true;
    let mut failure = None;
    for stop in stops {
        match stop.await {
            Ok(stopped) => clean &= stopped,
            Err(e) => {
                error!(error = %e, "Stop task failed");
                failure = failure.or(Some(e));
            }
        }
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(clean),
    }
}

async fn run_rigs(
    config: HarnessConfig,
    base_port: u16,
    bridge_port: u16,
    stride: u16,
) -> Result<ExitCode, CliError> {
    let devices = list_devices(&config).await?;
    if devices.is_empty() {
        return Err(CliError::NoDevices);
    }

    // Every fallible setup step runs before the first process is spawned.
    let plans = plan_rigs(devices, base_port, bridge_port, stride)?;
    let prepared = plans
        .into_iter()
        .map(|plan| {
            let appium = AutomationServer::new(plan.base, config.automation.clone())?;
            Ok((plan, appium))
        })
        .collect::<Result<Vec<_>, CliError>>()?;

    let tasks: Vec<_> = prepared
        .into_iter()
        .map(|(plan, appium)| {
            let bridge_config = config.bridge.clone();
            tokio::task::spawn_blocking(move || {
                let bridge = BridgeServer::new(plan.device.uuid.clone(), plan.local, bridge_config);
                let mut rig = DeviceRig {
                    device: plan.device,
                    appium,
                    bridge,
                };
                let states = rig.start();
                (rig, states)
            })
        })
        .collect();

    let mut rigs = Vec::with_capacity(tasks.len());
    let mut failure = None;
    for task in tasks {
        match task.await {
            Ok(started) => rigs.push(started),
            Err(e) => {
                error!(error = %e, "Start task failed");
                failure = failure.or(Some(e));
            }
        }
    }
    if let Some(e) = failure {
        stop_rigs(rigs.into_iter().map(|(rig, _)| rig).collect()).await?;
        return Err(e.into());
    }

    println!(
        "{:<42} {:<20} {:<36} {}",
        "DEVICE", "NAME", "APPIUM", "WEBDRIVERAGENT"
    );
    for (rig, (appium, bridge)) in &rigs {
        println!(
            "{:<42} {:<20} {:<36} {}",
            rig.device.uuid,
            rig.device.name,
            format!("{} {}", appium, rig.appium.hub_url()),
            format!("{} {}", bridge, rig.bridge.server_url()),
        );
    }

    let all_ready = rigs
        .iter()
        .all(|(_, states)| *states == (ServiceState::Ready, ServiceState::Ready));
    if all_ready {
        info!(devices = rigs.len(), "All devices ready");
    } else {
        warn!("Some devices are not ready and will be skipped");
    }

    shutdown_signal().await;

    let clean = stop_rigs(rigs.into_iter().map(|(rig, _)| rig).collect()).await?;
    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
