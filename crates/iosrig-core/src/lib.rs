//! # iosrig-core
//!
//! Process supervision and readiness gating for iOS device test runs.
//!
//! For every attached device a run brings up an Appium server and a
//! WebDriverAgent bridge, waits until both answer their status endpoints, and
//! tears them down again afterwards. The crate provides the building blocks
//! for that and the two orchestrators that combine them.
//!
//! ## Modules
//!
//! - [`ports`] - Derive the role ports of one server from its base port
//! - [`process`] - Launch descriptions and the OS process interface
//! - [`supervisor`] - Own one process, stop it gracefully then forcefully
//! - [`readiness`] - Bounded polling until a probe succeeds
//! - [`health`] - HTTP status probe
//! - [`discovery`] - Enumerate attached hardware devices
//! - [`signing`] - Keychain and bundle id setup for the bridge
//! - [`orchestrator`] - Appium and WebDriverAgent lifecycles
//! - [`config`] - `~/.iosrig/config.json`
//!
//! ## External Dependencies
//!
//! The default configuration expects these tools on the host:
//!
//! - **Appium** (`appium`) with the XCUITest driver
//! - **Xcode** (`xcodebuild`, `instruments`)
//! - **libimobiledevice** (`iproxy`)
//!
//! ## Example
//!
//! ```no_run
//! use iosrig_core::config::HarnessConfig;
//! use iosrig_core::orchestrator::{AutomationServer, ServiceOrchestrator, ServiceState};
//!
//! let config = HarnessConfig::load()?;
//! for (i, device) in config.discovery.discovery().list_devices()?.iter().enumerate() {
//!     let base = 7500 + 4000 * i as u16;
//!     let mut appium = AutomationServer::new(base, config.automation.clone())?;
//!     if appium.start()? == ServiceState::Ready {
//!         println!("{} -> {}", device.name, appium.hub_url());
//!     }
//!     appium.stop()?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod discovery;
pub mod health;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod signing;
pub mod supervisor;
