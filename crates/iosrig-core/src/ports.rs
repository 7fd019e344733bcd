//! Deterministic port derivation for orchestrators.
//!
//! Every orchestrator is handed a single base port and derives the ports for
//! its secondary roles from it. Each role lives in its own band
//! (`base + 1000`, `base + 2000`, `base + 3000`) so the roles of one
//! orchestrator never collide with each other.
//!
//! Keeping different orchestrators apart is up to the caller: pick base ports
//! at least [`BASE_PORT_STRIDE`] apart. No collision detection is performed.
//!
//! # Example
//!
//! ```
//! use iosrig_core::ports::PortPlan;
//!
//! let plan = PortPlan::derive(7500).unwrap();
//! assert_eq!(plan.bootstrap, 8500);
//! assert_eq!(plan.secondary, 9500);
//! assert_eq!(plan.tertiary, 10500);
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Offset of the bootstrap role from the base port.
pub const BOOTSTRAP_OFFSET: u16 = 1000;
/// Offset of the secondary role from the base port.
pub const SECONDARY_OFFSET: u16 = 2000;
/// Offset of the tertiary role from the base port.
pub const TERTIARY_OFFSET: u16 = 3000;

/// Minimum distance between the base ports of two orchestrators that run
/// side by side.
pub const BASE_PORT_STRIDE: u16 = 4000;

/// Errors produced while deriving a port plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortPlanError {
    /// A derived port does not fit into the 16-bit port space.
    #[error("base port {base} leaves no room for role offsets (max base is {max})")]
    Overflow { base: u16, max: u16 },
}

/// The set of ports derived from one base port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortAssignment {
    /// The primary port the service listens on.
    pub base: u16,
    /// Bootstrap role, `base + 1000`.
    pub bootstrap: u16,
    /// Secondary role, `base + 2000`.
    pub secondary: u16,
    /// Tertiary role, `base + 3000`.
    pub tertiary: u16,
}

impl PortAssignment {
    /// Role name to port, in ascending port order.
    pub fn roles(&self) -> [(&'static str, u16); 4] {
        [
            ("base", self.base),
            ("bootstrap", self.bootstrap),
            ("secondary", self.secondary),
            ("tertiary", self.tertiary),
        ]
    }
}

impl fmt::Display for PortAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base={} bootstrap={} secondary={} tertiary={}",
            self.base, self.bootstrap, self.secondary, self.tertiary
        )
    }
}

/// Pure port derivation.
pub struct PortPlan;

impl PortPlan {
    /// Largest base port whose derived ports all fit into `u16`.
    pub const MAX_BASE: u16 = u16::MAX - TERTIARY_OFFSET;

    /// Derive the role ports for `base`.
    ///
    /// # Errors
    ///
    /// [`PortPlanError::Overflow`] if `base + 3000` exceeds 65535.
    pub fn derive(base: u16) -> Result<PortAssignment, PortPlanError> {
        let offset = |delta: u16| {
            base.checked_add(delta).ok_or(PortPlanError::Overflow {
                base,
                max: Self::MAX_BASE,
            })
        };

        Ok(PortAssignment {
            base,
            bootstrap: offset(BOOTSTRAP_OFFSET)?,
            secondary: offset(SECONDARY_OFFSET)?,
            tertiary: offset(TERTIARY_OFFSET)?,
        })
    }

    /// Base ports for `count` orchestrators, starting at `first` and spaced
    /// `stride` apart.
    ///
    /// Stops early instead of producing a base port that cannot be derived.
    pub fn base_ports(first: u16, stride: u16, count: usize) -> Vec<u16> {
        let mut ports = Vec::with_capacity(count);
        let mut next = Some(first);
        while let Some(port) = next {
            if ports.len() == count || port > Self::MAX_BASE {
                break;
            }
            ports.push(port);
            next = port.checked_add(stride);
        }
        ports
    }
}
