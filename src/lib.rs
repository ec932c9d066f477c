//! xlctl - Xen domain lifecycle control.
//!
//! This library drives the libxl toolstack to start, monitor and tear down
//! hardware-virtualized domains:
//! - [`Hypervisor`] opens one validated toolstack connection and starts,
//!   destroys and inspects domains with full rollback on partial failure
//! - NIC and disk hot-plug against running domains (see [`device`])
//! - [`EventDispatcher`] turns toolstack events into death notifications
//! - [`ChildReaper`] reaps helper processes the toolstack spawned
//! - [`LogAggregator`] buffers toolstack diagnostics and collapses progress
//!
//! The privileged toolstack itself sits behind the [`Toolstack`] trait.

pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod events;
pub mod hypervisor;
pub mod logger;
pub mod logging;
pub mod reaper;
pub mod toolstack;

pub use config::ControlConfig;
pub use device::{DiskBackend, DiskConfig, DiskFormat, MacAddr, NicConfig};
pub use domain::{DomainId, DomainInfo, DomainRecord, DomainSpec, DomainState, DomainType};
pub use error::{Error, Result};
pub use events::{DeathSink, EventDispatcher, FnDeathSink};
pub use hypervisor::Hypervisor;
pub use logger::{LogAggregator, LogLevel, LogSink};
pub use reaper::{watch_sigchld, ChildReaper};
pub use toolstack::{Connector, Event, EventKind, Toolstack, ToolstackError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
