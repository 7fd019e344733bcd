//! Discovery of attached iOS hardware devices.
//!
//! The enumeration tool (`instruments -s devices` by default) prints one
//! free-text line per known device, simulators included:
//!
//! ```text
//! Known Devices:
//! builder-mac [5C2A8A4E-0D5B-5E8B-9F2B-1234567890AB]
//! Test iPhone (11.2.5) [656d6ef9da2ccb39d34b00fe7e0c23fe7ec91278]
//! iPhone 8 (11.2) [8A3D2B58-1C50-4C6A-9C1B-2E5B7F7D6F11] (Simulator)
//! ```
//!
//! Each line is tried against an ordered list of named matchers, and the
//! first one that matches wins. A line becomes a [`DeviceRecord`] only if
//! all three of these hold:
//!
//! - it matched some form;
//! - it does not mention "simulator" (case-insensitive);
//! - its extracted identifier is present and hyphen-free.
//!
//! Only the bracketed form carries an identifier. Simulator and host UDIDs
//! are hyphenated, while hardware UDIDs are plain hex. Everything else is
//! skipped silently.
//!
//! # Example
//!
//! ```
//! use iosrig_core::discovery::parse_device_list;
//!
//! let devices = parse_device_list("Test iPhone (11.2.5) [656d6ef9da2c]\n");
//! assert_eq!(devices[0].name, "Test iPhone");
//! assert_eq!(devices[0].os_version, "11.2.5");
//! ```

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during device discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The enumeration command is empty.
    #[error("device enumeration command is empty")]
    EmptyCommand,

    /// The enumeration tool could not be launched at all.
    #[error("failed to run {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// An attached hardware device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Hardware UDID (non-empty, no hyphens).
    pub uuid: String,
    /// Human-readable device name (e.g., "Test iPhone").
    pub name: String,
    /// OS version as printed by the tool (e.g., "11.2.5").
    pub os_version: String,
}

// ---------------------------------------------------------------------------
// Line matchers
// ---------------------------------------------------------------------------

/// The structural forms an enumeration line can take, in match priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineForm {
    /// `name (version) [uuid]`
    BracketedId,
    /// `name (version) - freeform`
    VersionDash,
    /// `word word - freeform`
    TwoWordDash,
    /// `word - freeform`
    WordDash,
}

/// Structured result of one matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub form: LineForm,
    pub name: Option<String>,
    pub version: Option<String>,
    pub identifier: Option<String>,
}

struct LineMatcher {
    form: LineForm,
    pattern: Regex,
}

impl LineMatcher {
    fn new(form: LineForm, pattern: &str) -> Self {
        Self {
            form,
            pattern: Regex::new(pattern).expect("device line pattern is valid"),
        }
    }

    fn try_match(&self, line: &str) -> Option<LineMatch> {
        let caps = self.pattern.captures(line)?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str().trim().to_string());
        Some(LineMatch {
            form: self.form,
            name: group("name"),
            version: group("version"),
            identifier: group("id"),
        })
    }
}

/// Matchers in priority order. Searches are unanchored, and the greedy
/// `name` group means the *last* parenthesised group before the bracket is
/// taken as the version.
static MATCHERS: LazyLock<[LineMatcher; 4]> = LazyLock::new(|| {
    [
        LineMatcher::new(
            LineForm::BracketedId,
            r"(?P<name>.*)\((?P<version>.*)\)\s*\s\[(?P<id>.*)\]",
        ),
        LineMatcher::new(
            LineForm::VersionDash,
            r"(?P<name>.*)\((?P<version>.*)\)\s-*\s*.*",
        ),
        LineMatcher::new(LineForm::TwoWordDash, r"(?P<name>\w+ \w+) -\s-*\s*.*"),
        LineMatcher::new(LineForm::WordDash, r"(?P<name>\w*)\s-.*"),
    ]
});

/// Try every matcher in order; the first structural form to match wins.
pub fn match_line(line: &str) -> Option<LineMatch> {
    MATCHERS.iter().find_map(|m| m.try_match(line))
}

/// Turn one line into a record, or `None` if it should be skipped.
pub fn parse_device_line(line: &str) -> Option<DeviceRecord> {
    let Some(matched) = match_line(line) else {
        debug!(line, "Skipping line: no known device form");
        return None;
    };

    if line.to_lowercase().contains("simulator") {
        debug!(line, "Skipping simulator");
        return None;
    }

    let uuid = match matched.identifier {
        Some(id) if !id.is_empty() && !id.contains('-') => id,
        Some(id) if id.contains('-') => {
            debug!(line, "Skipping hyphenated identifier");
            return None;
        }
        _ => {
            debug!(line, form = ?matched.form, "Skipping line without identifier");
            return None;
        }
    };

    Some(DeviceRecord {
        uuid,
        name: matched.name.unwrap_or_default(),
        os_version: matched.version.unwrap_or_default(),
    })
}

/// Parse the full output of the enumeration tool, preserving order.
pub fn parse_device_list(output: &str) -> Vec<DeviceRecord> {
    output.lines().filter_map(parse_device_line).collect()
}

// ---------------------------------------------------------------------------
// DeviceDiscovery
// ---------------------------------------------------------------------------

/// Runs the enumeration tool and parses its output.
#[derive(Debug, Clone)]
pub struct DeviceDiscovery {
    command: Vec<String>,
}

impl Default for DeviceDiscovery {
    fn default() -> Self {
        Self::new(default_enumeration_command())
    }
}

/// `instruments -s devices`
pub fn default_enumeration_command() -> Vec<String> {
    vec!["instruments".into(), "-s".into(), "devices".into()]
}

impl DeviceDiscovery {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Enumerate attached hardware devices.
    ///
    /// Every call runs the tool afresh. stdout and stderr are merged in the
    /// order the tool wrote them. A non-zero exit is logged and whatever
    /// output was captured is still parsed.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::EmptyCommand`] if no command is configured
    /// - [`DiscoveryError::Launch`] if the tool cannot be executed
    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>, DiscoveryError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(DiscoveryError::EmptyCommand)?;
        let command_line = self.command.join(" ");
        let launch_error = |source: io::Error| DiscoveryError::Launch {
            command: command_line.clone(),
            source,
        };

        // Both streams share one pipe so interleaved lines keep their order.
        let (mut reader, writer) = io::pipe().map_err(launch_error)?;
        let stderr_writer = writer.try_clone().map_err(launch_error)?;
        let mut child = {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr_writer);
            command.spawn().map_err(launch_error)?
        };

        let mut raw = Vec::new();
        let read = reader.read_to_end(&mut raw);
        let status = child.wait().map_err(launch_error)?;
        read.map_err(launch_error)?;
        let text = String::from_utf8_lossy(&raw).into_owned();

        if !status.success() {
            warn!(
                command = %command_line,
                status = %status,
                output = %text.trim(),
                "Device enumeration exited with an error, parsing partial output"
            );
        }

        let devices = parse_device_list(&text);
        info!(count = devices.len(), "Discovered hardware devices");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_OUTPUT: &str = "\
Known Devices:
builder-mac [5C2A8A4E-0D5B-5E8B-9F2B-1234567890AB]
Test iPhone (11.2.5) [656d6ef9da2ccb39d34b00fe7e0c23fe7ec91278]
iPhone 8 (11.2) [8A3D2B58-1C50-4C6A-9C1B-2E5B7F7D6F11] (Simulator)
Apple TV 4K (11.2) [0B8E6C4A-2F6E-4C55-8F61-5C7D7D9B1A22] (simulator)
Lab iPad (10.3.3) [a1b2c3d4e5f60718293a4b5c6d7e8f9012345678]
";

    #[test]
    fn parses_hardware_devices_in_order() {
        let devices = parse_device_list(SAMPLE_OUTPUT);
        assert_eq!(
            devices,
            vec![
                DeviceRecord {
                    uuid: "656d6ef9da2ccb39d34b00fe7e0c23fe7ec91278".into(),
                    name: "Test iPhone".into(),
                    os_version: "11.2.5".into(),
                },
                DeviceRecord {
                    uuid: "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678".into(),
                    name: "Lab iPad".into(),
                    os_version: "10.3.3".into(),
                },
            ]
        );
    }

    #[test]
    fn simulator_excluded_even_with_clean_identifier() {
        assert!(parse_device_line("iPhone X (11.2) [abcdef0123] (SIMULATOR)").is_none());
        assert!(parse_device_line("Simulator Phone (11.2) [abcdef0123]").is_none());
    }

    #[test]
    fn hyphenated_identifier_rejected() {
        assert!(parse_device_line("Odd Phone (11.2) [abc-def]").is_none());
    }

    #[test]
    fn unmatched_line_skipped() {
        assert!(match_line("Known Devices:").is_none());
        assert!(parse_device_line("Known Devices:").is_none());
        assert!(parse_device_line("").is_none());
    }

    #[test]
    fn host_line_without_version_is_skipped() {
        let host = "builder-mac [5C2A8A4E-0D5B-5E8B-9F2B-1234567890AB]";
        assert!(parse_device_line(host).is_none());
    }

    #[test]
    fn bracketed_form_wins_first() {
        let m = match_line("Test iPhone (11.2.5) [656d6ef9]").unwrap();
        assert_eq!(m.form, LineForm::BracketedId);
        assert_eq!(m.name.as_deref(), Some("Test iPhone"));
        assert_eq!(m.version.as_deref(), Some("11.2.5"));
        assert_eq!(m.identifier.as_deref(), Some("656d6ef9"));
    }

    #[test]
    fn version_dash_form_has_no_identifier() {
        let m = match_line("Test iPhone (11.2.5) - unavailable").unwrap();
        assert_eq!(m.form, LineForm::VersionDash);
        assert_eq!(m.version.as_deref(), Some("11.2.5"));
        assert!(m.identifier.is_none());
        assert!(parse_device_line("Test iPhone (11.2.5) - unavailable").is_none());
    }

    #[test]
    fn two_word_dash_form() {
        let m = match_line("Paired Watch - not connected").unwrap();
        assert_eq!(m.form, LineForm::TwoWordDash);
        assert_eq!(m.name.as_deref(), Some("Paired Watch"));
        assert!(m.identifier.is_none());
    }

    #[test]
    fn word_dash_form() {
        let m = match_line("Watch - not connected").unwrap();
        assert_eq!(m.form, LineForm::WordDash);
        assert_eq!(m.name.as_deref(), Some("Watch"));
    }

    #[test]
    fn crlf_output_is_handled() {
        let devices =
            parse_device_list("Test iPhone (11.2.5) [656d6ef9]\r\nLab iPad (10.3) [abc123]\r\n");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "656d6ef9");
        assert_eq!(devices[1].uuid, "abc123");
    }

    #[test]
    fn default_command_is_instruments() {
        let discovery = DeviceDiscovery::default();
        assert_eq!(discovery.command(), ["instruments", "-s", "devices"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = DeviceDiscovery::new(vec![]).list_devices().unwrap_err();
        assert!(matches!(err, DiscoveryError::EmptyCommand));
    }

    #[test]
    fn missing_tool_is_launch_error() {
        let discovery = DeviceDiscovery::new(vec!["/nonexistent/iosrig-instruments".into()]);
        match discovery.list_devices() {
            Err(DiscoveryError::Launch { command, .. }) => {
                assert_eq!(command, "/nonexistent/iosrig-instruments");
            }
            other => panic!("expected Launch error, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_still_parses_output() {
        let script = "echo 'Test iPhone (11.2.5) [656d6ef9]'; \
                      echo 'Lab iPad (10.3) [abc123]' >&2; exit 1";
        let discovery = DeviceDiscovery::new(vec!["sh".into(), "-c".into(), script.into()]);
        let devices = discovery.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Test iPhone");
        assert_eq!(devices[1].name, "Lab iPad");
    }

    #[cfg(unix)]
    #[test]
    fn interleaved_streams_keep_write_order() {
        let script = "echo 'Alpha (1.0) [aaa111]'; sleep 0.1; \
                      echo 'Bravo (2.0) [bbb222]' >&2; sleep 0.1; \
                      echo 'Charlie (3.0) [ccc333]'";
        let discovery = DeviceDiscovery::new(vec!["sh".into(), "-c".into(), script.into()]);
        let names: Vec<String> = discovery
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["Alpha", "Bravo", "Charlie"]);
    }
}
