//! Domain definitions.
//!
//! This module provides the types that describe a single domain:
//! - [`DomainSpec`]: caller-supplied description of a domain to start
//! - [`DomainConfig`]: the full build state handed to the toolstack
//! - [`DomainInfo`]: the result of inspecting a running domain
//! - [`DomainRecord`]: persisted reference used to reattach to a domain

pub mod config;
pub mod state;

use serde::{Deserialize, Serialize};

pub use config::{
    shadow_memory_kb, BuildInfo, CpuBitmap, CreateInfo, DomainConfig, DomainSpec,
    DomainSpecBuilder, HvmBuildInfo, VgaKind,
};
pub use state::{DomainInfo, DomainRecord, DomainState, ShutdownReason};

/// Numeric domain identifier assigned by the toolstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Get the raw identifier.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DomainId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Virtualization mode of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    /// Hardware-virtualized guest.
    #[default]
    Hvm,
    /// Paravirtualized guest (not supported).
    Pv,
}

impl DomainType {
    /// Get the type name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            DomainType::Hvm => "hvm",
            DomainType::Pv => "pv",
        }
    }
}

impl std::fmt::Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
