//! Domain runtime state types.

use super::DomainId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hypervisor name stored in domain records.
pub const RECORD_HYPERVISOR: &str = "xen";

/// Why a guest shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Guest powered off.
    Poweroff,
    /// Guest asked to be rebooted.
    Reboot,
    /// Guest suspended itself.
    Suspend,
    /// Guest crashed.
    Crash,
    /// Guest watchdog fired.
    Watchdog,
    /// Guest requested a soft reset.
    SoftReset,
    /// Reason not reported.
    Unknown,
}

impl ShutdownReason {
    /// Check if the reason ends the domain's life.
    ///
    /// A suspending domain is not dead.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ShutdownReason::Suspend)
    }

    /// Get the reason name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ShutdownReason::Poweroff => "poweroff",
            ShutdownReason::Reboot => "reboot",
            ShutdownReason::Suspend => "suspend",
            ShutdownReason::Crash => "crash",
            ShutdownReason::Watchdog => "watchdog",
            ShutdownReason::SoftReset => "soft_reset",
            ShutdownReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Coarse domain state derived from [`DomainInfo`] flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DomainState {
    /// Running on a physical CPU.
    Running,
    /// Blocked waiting for an event.
    Blocked,
    /// Paused by the toolstack.
    Paused,
    /// Shut down, not yet destroyed.
    Shutdown {
        /// Reason for shutdown.
        reason: ShutdownReason,
    },
    /// Being torn down by the hypervisor.
    Dying,
}

impl DomainState {
    /// Check if the domain is gone or going.
    pub fn is_terminal(&self) -> bool {
        match self {
            DomainState::Shutdown { reason } => reason.is_terminal(),
            DomainState::Dying => true,
            _ => false,
        }
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown { .. } => "shutdown",
            DomainState::Dying => "dying",
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainState::Shutdown { reason } => write!(f, "shutdown: {}", reason),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Result of inspecting a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Domain identifier.
    pub domid: DomainId,
    /// Domain UUID.
    pub uuid: Uuid,
    /// Currently running.
    pub running: bool,
    /// Blocked on an event channel.
    pub blocked: bool,
    /// Paused.
    pub paused: bool,
    /// Shut down.
    pub shutdown: bool,
    /// Being destroyed.
    pub dying: bool,
    /// Shutdown reason, when shut down.
    pub shutdown_reason: Option<ShutdownReason>,
    /// Current memory in KiB.
    pub current_memkb: u64,
    /// Maximum memory in KiB.
    pub max_memkb: u64,
    /// Online vCPUs.
    pub vcpu_online: u32,
}

impl DomainInfo {
    /// Derive the coarse state. Dying wins over shutdown, shutdown over paused.
    pub fn state(&self) -> DomainState {
        if self.dying {
            DomainState::Dying
        } else if self.shutdown {
            DomainState::Shutdown {
                reason: self.shutdown_reason.unwrap_or(ShutdownReason::Unknown),
            }
        } else if self.paused {
            DomainState::Paused
        } else if self.blocked && !self.running {
            DomainState::Blocked
        } else {
            DomainState::Running
        }
    }
}

/// Persisted reference to a managed domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Hypervisor that owns the domain.
    pub hypervisor: String,
    /// Domain identifier as persisted.
    pub domid: i64,
}

impl DomainRecord {
    /// Create a record for a domain.
    pub fn new(domid: DomainId) -> Self {
        Self {
            hypervisor: RECORD_HYPERVISOR.to_string(),
            domid: i64::from(domid.0),
        }
    }

    /// Serialize the record for persistence.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    /// Parse a persisted record.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    /// Validate the record and return the domain id it names.
    ///
    /// Domain 0 is the control domain and is never a valid guest record.
    pub fn domain_id(&self) -> Result<DomainId> {
        if self.hypervisor != RECORD_HYPERVISOR {
            return Err(Error::InvalidRecord(format!(
                "wrong hypervisor type: {}",
                self.hypervisor
            )));
        }
        if self.domid <= 0 {
            return Err(Error::InvalidRecord(format!(
                "loaded wrong domid {}",
                self.domid
            )));
        }
        u32::try_from(self.domid)
            .map(DomainId)
            .map_err(|_| Error::InvalidRecord(format!("domid {} out of range", self.domid)))
    }
}
