//! Shared types used across FactorGrid crates.

use serde::{Deserialize, Serialize};

/// Globally unique, monotonically increasing job identifier.
pub type JobId = u64;

/// Opaque identifier of a worker instance, as assigned by the provider.
pub type InstanceId = String;

/// Synthetic load/complexity unit. Signed: remaining-work estimates
/// can go negative once a job outruns its historical complexity.
pub type Complexity = i64;

/// Instance state as reported by the provisioning provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    /// A state string this crate does not know about.
    Unknown(String),
}

impl InstanceState {
    /// Parse a provider state name (`"running"`, `"shutting-down"`, ...).
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            other => InstanceState::Unknown(other.to_string()),
        }
    }

    /// Provider state name.
    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown(s) => s,
        }
    }

    /// States from which an instance never comes back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::ShuttingDown
                | InstanceState::Terminated
                | InstanceState::Stopping
                | InstanceState::Stopped
        )
    }

    pub fn is_running(&self) -> bool {
        *self == InstanceState::Running
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_states() {
        assert_eq!(InstanceState::parse("running"), InstanceState::Running);
        assert_eq!(InstanceState::parse("Shutting-Down"), InstanceState::ShuttingDown);
        assert_eq!(InstanceState::parse(" stopped "), InstanceState::Stopped);
        assert_eq!(
            InstanceState::parse("rebooting"),
            InstanceState::Unknown("rebooting".to_string())
        );
    }

    #[test]
    fn terminal_states() {
        for s in ["shutting-down", "terminated", "stopping", "stopped"] {
            assert!(InstanceState::parse(s).is_terminal(), "{s} should be terminal");
        }
        for s in ["pending", "running", "rebooting"] {
            assert!(!InstanceState::parse(s).is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn display_round_trips_name() {
        assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(InstanceState::Unknown("x".into()).to_string(), "x");
    }
}
