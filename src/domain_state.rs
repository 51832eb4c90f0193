//! Shared vocabulary for the live state of a VM domain on one host.
//!
//! Parsed from what `virsh domstate` reports; the lifecycle tracker only
//! cares whether a tracked action has reached its terminal state.

use std::fmt;
use std::str::FromStr;

use crate::error::HamcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    Running,

    /// Defined but not running (`shut off`, `crashed`, or not present).
    ShutOff,

    Paused,

    /// Transitional or unrecognised states (`in shutdown`, `blocked`, ...).
    /// Never settles a tracked action.
    #[default]
    Unknown,
}

impl DomainState {
    pub fn is_running(self) -> bool {
        matches!(self, DomainState::Running)
    }
}

impl FromStr for DomainState {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "running" | "idle" => DomainState::Running,
            "shut off" | "shutoff" | "shut-off" | "crashed" | "undefined" => DomainState::ShutOff,
            "paused" | "suspended" | "pmsuspended" => DomainState::Paused,
            "" | "unknown" | "in shutdown" | "blocked" | "dying" | "no state" => {
                DomainState::Unknown
            }
            other => {
                return Err(HamcError::Validation {
                    message: format!("unrecognised domain state '{other}'"),
                });
            }
        })
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainState::Running => "running",
            DomainState::ShutOff => "shut off",
            DomainState::Paused => "paused",
            DomainState::Unknown => "unknown",
        })
    }
}
