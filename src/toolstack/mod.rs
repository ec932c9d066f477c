//! Boundary to the privileged hypervisor toolstack.
//!
//! The toolstack (libxl and the hypervisor behind it) performs every
//! privileged operation. This module defines the interface xlctl drives it
//! through:
//! - [`Connector`]: opens a connection given the crate's log aggregator
//! - [`Toolstack`]: the operations available on an open connection
//! - [`EventHooks`]: callback the toolstack invokes for every event
//!
//! Closing a connection is dropping it.

#[cfg(test)]
pub(crate) mod fake;

use crate::device::{DiskDevice, MacAddr, NicDevice};
use crate::domain::{DomainConfig, DomainId, DomainInfo, ShutdownReason};
use crate::logger::LogAggregator;
use std::fmt;
use std::sync::Arc;

/// Event mask selecting every event class.
pub const EVENT_MASK_ALL: u64 = u64::MAX;

/// Broad classification of a toolstack failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolstackErrorKind {
    /// The referenced domain or device does not exist.
    NotFound,
    /// The request was rejected as invalid.
    Invalid,
    /// The toolstack ran out of memory.
    NoMemory,
    /// Any other failure.
    Failed,
}

/// Failure reported by a toolstack call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolstackError {
    /// Name of the toolstack operation that failed.
    pub op: &'static str,
    /// Failure classification.
    pub kind: ToolstackErrorKind,
    /// Raw return code.
    pub code: i32,
}

impl ToolstackError {
    /// Create a toolstack error.
    pub fn new(op: &'static str, kind: ToolstackErrorKind, code: i32) -> Self {
        Self { op, kind, code }
    }

    /// Check if the failure means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == ToolstackErrorKind::NotFound
    }
}

impl fmt::Display for ToolstackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with code {}", self.op, self.code)
    }
}

impl std::error::Error for ToolstackError {}

/// Version and capability record queried once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Hypervisor major version.
    pub major: u32,
    /// Hypervisor minor version.
    pub minor: u32,
    /// Space-separated capability tokens (e.g. `xen-3.0-x86_64 hvm-3.0-x86_32`).
    pub capabilities: String,
}

impl VersionInfo {
    /// Version as a single comparable integer: `major * 1_000_000 + minor * 1_000`.
    ///
    /// Saturates at `u32::MAX` for out-of-range versions.
    pub fn encoded(&self) -> u32 {
        self.major
            .saturating_mul(1_000_000)
            .saturating_add(self.minor.saturating_mul(1_000))
    }

    /// Check if the host can run hardware-virtualized guests.
    pub fn supports_hvm(&self) -> bool {
        self.capabilities
            .split_whitespace()
            .any(|cap| cap.starts_with("hvm-"))
    }
}

/// Token for an armed death notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeathWatch {
    /// Watched domain.
    pub domid: DomainId,
    /// Toolstack-assigned token.
    pub token: u64,
}

/// Event delivered by the toolstack's event loop.
///
/// Each event is allocated by the toolstack and must be handed back through
/// [`Toolstack::free_event`] exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Domain the event concerns.
    pub domid: DomainId,
    /// What happened.
    pub kind: EventKind,
}

/// Closed set of toolstack event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The domain shut down for the given reason.
    DomainShutdown {
        /// Why the guest shut down.
        reason: ShutdownReason,
    },
    /// The domain has been destroyed.
    DomainDeath,
    /// A removable disk was ejected by the guest.
    DiskEject {
        /// Guest device name of the disk.
        vdev: String,
    },
    /// An asynchronous toolstack operation completed.
    OperationComplete {
        /// Return code of the operation.
        rc: i32,
    },
    /// The domain console became available during creation.
    ConsoleAvailable,
}

/// Receiver of toolstack events.
pub trait EventHooks: Send + Sync {
    /// Called by the toolstack's event loop for every event in the registered mask.
    fn event_occurs(&self, event: Event);
}

/// An open connection to the hypervisor toolstack.
///
/// Operations against one domain are not issued concurrently; implementations
/// only need to tolerate events arriving on another thread.
pub trait Toolstack: Send + Sync + 'static {
    /// Hand helper-process reaping to the caller: exits are reported back
    /// through [`Toolstack::childproc_reaped`].
    fn delegate_child_reaping(&self);

    /// Query hypervisor version and capabilities.
    fn version_info(&self) -> Result<VersionInfo, ToolstackError>;

    /// Query free host memory in KiB.
    fn free_memory_kb(&self) -> Result<u64, ToolstackError>;

    /// Register the event callback for the given event mask.
    fn register_event_hooks(
        &self,
        mask: u64,
        hooks: Arc<dyn EventHooks>,
    ) -> Result<(), ToolstackError>;

    /// Create a new domain from a fully assembled configuration.
    ///
    /// The domain is left paused.
    fn create_domain(&self, config: &DomainConfig) -> Result<DomainId, ToolstackError>;

    /// Arm the death notification for a domain.
    fn enable_domain_death(&self, domid: DomainId) -> Result<DeathWatch, ToolstackError>;

    /// Disarm a death notification.
    fn disable_domain_death(&self, watch: DeathWatch);

    /// Unpause a domain.
    fn unpause_domain(&self, domid: DomainId) -> Result<(), ToolstackError>;

    /// Destroy a domain.
    fn destroy_domain(&self, domid: DomainId) -> Result<(), ToolstackError>;

    /// Inspect a domain.
    fn domain_info(&self, domid: DomainId) -> Result<DomainInfo, ToolstackError>;

    /// Attach a network interface.
    fn nic_add(&self, domid: DomainId, nic: &NicDevice) -> Result<(), ToolstackError>;

    /// Resolve a MAC address to the live interface record.
    fn nic_from_mac(&self, domid: DomainId, mac: &MacAddr) -> Result<NicDevice, ToolstackError>;

    /// Detach a network interface.
    fn nic_remove(&self, domid: DomainId, nic: &NicDevice) -> Result<(), ToolstackError>;

    /// Attach a disk.
    fn disk_add(&self, domid: DomainId, disk: &DiskDevice) -> Result<(), ToolstackError>;

    /// Detach a disk.
    fn disk_remove(&self, domid: DomainId, disk: &DiskDevice) -> Result<(), ToolstackError>;

    /// Report a reaped child. Returns `true` if the child was a helper the
    /// toolstack spawned.
    fn childproc_reaped(&self, pid: i32, status: i32) -> bool;

    /// Release an event previously delivered through [`EventHooks`].
    fn free_event(&self, event: Event);
}

/// Opens toolstack connections.
pub trait Connector {
    /// Connection type produced.
    type Connection: Toolstack;

    /// Open a connection that reports diagnostics through `logger`.
    fn connect(&self, logger: Arc<LogAggregator>) -> Result<Self::Connection, ToolstackError>;
}
