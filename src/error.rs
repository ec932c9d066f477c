//! Error types for xlctl.

use crate::domain::DomainId;
use crate::toolstack::ToolstackError;
use thiserror::Error;

/// Result type alias using xlctl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in xlctl operations.
#[derive(Error, Debug)]
pub enum Error {
    // Handle initialization errors
    /// The handle state could not be allocated.
    #[error("failed to allocate hypervisor handle")]
    Allocation,

    /// The toolstack logger could not be constructed.
    #[error("failed to initialize toolstack logger: {0}")]
    LoggerInit(String),

    /// Opening the toolstack connection failed.
    #[error("failed to open toolstack connection")]
    Connection(#[source] ToolstackError),

    /// Version, capability or free-memory query failed.
    #[error("toolstack capability query failed")]
    CapabilityQuery(#[source] ToolstackError),

    /// The toolstack is older than the configured minimum.
    #[error("toolstack version {found} is not new enough, need {required} or higher")]
    VersionTooOld {
        /// Encoded version reported by the toolstack.
        found: u32,
        /// Encoded minimum version.
        required: u32,
    },

    /// The host cannot run hardware-virtualized guests.
    #[error("installation does not support HVM, current capabilities: {capabilities}")]
    HvmUnsupported {
        /// Capabilities string reported by the toolstack.
        capabilities: String,
    },

    /// A legacy xend daemon owns the hypervisor.
    #[error("xend is running, cannot start with the libxl toolstack")]
    XendRunning,

    // Domain lifecycle errors
    /// Only hardware-virtualized domains can be started.
    #[error("unsupported domain type: {0}")]
    UnsupportedMode(String),

    /// The domain build state could not be assembled.
    #[error("failed to build domain {name}: {reason}")]
    ResourceBuild {
        /// Domain name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The privileged create call failed.
    #[error("failed to create domain {name}")]
    DomainCreate {
        /// Domain name.
        name: String,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// The domain was created but its death notification could not be armed.
    #[error("failed to arm death notification for domain {domid}")]
    DeathNotifyArm {
        /// Domain that was created.
        domid: DomainId,
        /// Whether the compensating destroy removed the domain again.
        destroyed: bool,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// The domain was created and monitored but could not be unpaused.
    #[error("failed to unpause domain {domid}")]
    DomainUnpause {
        /// Domain that was created.
        domid: DomainId,
        /// Whether the compensating destroy removed the domain again.
        destroyed: bool,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// The domain shut down before start completed.
    #[error("domain {domid} shut down during start")]
    DomainExited {
        /// Domain that shut down.
        domid: DomainId,
        /// Whether the compensating destroy removed the domain again.
        destroyed: bool,
    },

    /// Destroying a domain failed.
    #[error("failed to destroy domain {domid}")]
    DomainDestroy {
        /// Domain that could not be destroyed.
        domid: DomainId,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// The domain does not exist.
    #[error("domain not found: {domid}")]
    DomainNotFound {
        /// Domain that was looked up.
        domid: DomainId,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// Inspecting an existing domain failed.
    #[error("failed to query domain {domid}")]
    DomainQuery {
        /// Domain that was looked up.
        domid: DomainId,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// A persisted domain record cannot be reattached.
    #[error("invalid domain record: {0}")]
    InvalidRecord(String),

    // Device errors
    /// Attaching a device failed.
    #[error("failed to attach {device} to domain {domid}")]
    DeviceAttach {
        /// Target domain.
        domid: DomainId,
        /// MAC address or target device name.
        device: String,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// The device to detach does not exist on the domain.
    #[error("device {device} not found on domain {domid}")]
    DeviceNotFound {
        /// Target domain.
        domid: DomainId,
        /// MAC address or target device name.
        device: String,
    },

    /// Detaching a device failed.
    #[error("failed to detach {device} from domain {domid}")]
    DeviceDetach {
        /// Target domain.
        domid: DomainId,
        /// MAC address or target device name.
        device: String,
        /// Underlying toolstack failure.
        #[source]
        source: ToolstackError,
    },

    /// A MAC address string could not be parsed.
    #[error("invalid mac address: {0}")]
    InvalidMac(String),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a resource build error.
    pub fn resource_build(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceBuild {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a domain creation error.
    pub fn domain_create(name: impl Into<String>, source: ToolstackError) -> Self {
        Self::DomainCreate {
            name: name.into(),
            source,
        }
    }

    /// Create a device attach error.
    pub fn device_attach(domid: DomainId, device: impl Into<String>, source: ToolstackError) -> Self {
        Self::DeviceAttach {
            domid,
            device: device.into(),
            source,
        }
    }

    /// Create a device detach error.
    pub fn device_detach(domid: DomainId, device: impl Into<String>, source: ToolstackError) -> Self {
        Self::DeviceDetach {
            domid,
            device: device.into(),
            source,
        }
    }

    /// Create a device not found error.
    pub fn device_not_found(domid: DomainId, device: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            domid,
            device: device.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolstack::ToolstackErrorKind;

    #[test]
    fn test_device_not_found_includes_device_and_domain() {
        let err = Error::device_not_found(DomainId(7), "00:16:3e:00:00:01");
        let msg = err.to_string();
        assert!(msg.contains("00:16:3e:00:00:01"), "Error should include the MAC");
        assert!(msg.contains('7'), "Error should include the domain id");
    }

    #[test]
    fn test_version_too_old_includes_both_versions() {
        let err = Error::VersionTooOld {
            found: 4_004_000,
            required: 4_005_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("4004000"));
        assert!(msg.contains("4005000"));
    }

    #[test]
    fn test_toolstack_failure_is_error_source() {
        use std::error::Error as _;

        let err = Error::domain_create(
            "vm-1",
            ToolstackError::new("domain_create_new", ToolstackErrorKind::Failed, -3),
        );
        let source = err.source().expect("toolstack error should be the source");
        assert!(source.to_string().contains("domain_create_new"));
    }

    #[test]
    fn test_hvm_unsupported_includes_capabilities() {
        let err = Error::HvmUnsupported {
            capabilities: "xen-3.0-x86_64".to_string(),
        };
        assert!(err.to_string().contains("xen-3.0-x86_64"));
    }
}
