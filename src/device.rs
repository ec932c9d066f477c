//! Network and disk device descriptors and hot-plug operations.
//!
//! Descriptors are built from caller-supplied configs with fixed policy
//! defaults, handed to the toolstack by reference, and dropped when the
//! operation returns regardless of outcome.

use crate::domain::DomainId;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::toolstack::Toolstack;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Backend domain for every device (the control domain).
pub const BACKEND_DOMID: u32 = 0;

/// MTU of emulated network interfaces.
pub const NIC_MTU: u32 = 1492;

/// Emulated NIC model.
pub const NIC_MODEL: &str = "e1000";

/// Guest disk device name prefix.
pub const DISK_NAME_PREFIX: &str = "xvd";

/// Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| Error::InvalidMac(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidMac(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// How an interface is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicType {
    /// Emulated device backed by a paravirtual interface.
    VifIoemu,
    /// Paravirtual interface only.
    Vif,
}

/// Caller-supplied network interface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    /// Guest IP address.
    pub ip: String,
    /// Host bridge the interface joins.
    pub bridge: String,
    /// Gateway device.
    pub gateway_dev: String,
    /// Interface MAC address; the detach key.
    pub mac: MacAddr,
    /// Host-side interface name.
    pub ifname: String,
}

/// Network interface descriptor handed to the toolstack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicDevice {
    /// Backend domain.
    pub backend_domid: u32,
    /// Device index assigned by the toolstack, once attached.
    pub devid: Option<u32>,
    /// MTU.
    pub mtu: u32,
    /// Emulated model.
    pub model: String,
    /// Exposure type.
    pub nictype: NicType,
    /// MAC address.
    pub mac: MacAddr,
    /// Guest IP address.
    pub ip: String,
    /// Host bridge.
    pub bridge: String,
    /// Host-side interface name.
    pub ifname: String,
    /// Gateway device.
    pub gateway_dev: String,
}

impl NicDevice {
    /// Build a descriptor with fixed defaults from caller settings.
    pub fn from_config(config: &NicConfig) -> Self {
        Self {
            backend_domid: BACKEND_DOMID,
            devid: None,
            mtu: NIC_MTU,
            model: NIC_MODEL.to_string(),
            nictype: NicType::VifIoemu,
            mac: config.mac,
            ip: config.ip.clone(),
            bridge: config.bridge.clone(),
            ifname: config.ifname.clone(),
            gateway_dev: config.gateway_dev.clone(),
        }
    }
}

/// Disk backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum DiskBackend {
    /// Let the toolstack choose.
    #[default]
    Unknown = 0,
    /// Physical block device.
    Phy = 1,
    /// Blktap image file.
    Tap = 2,
    /// Device-model disk.
    Qdisk = 3,
}

impl DiskBackend {
    /// Pick a backend for a source path: block devices under `/dev/` use
    /// [`DiskBackend::Phy`], image files use [`DiskBackend::Tap`].
    pub fn for_source(source: &std::path::Path) -> Self {
        if source.starts_with("/dev/") {
            DiskBackend::Phy
        } else {
            DiskBackend::Tap
        }
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum DiskFormat {
    /// Unknown format.
    Unknown = 0,
    /// QCOW format.
    Qcow = 1,
    /// QCOW2 format (copy-on-write).
    Qcow2 = 2,
    /// VHD format.
    Vhd = 3,
    /// Raw disk image.
    #[default]
    Raw = 4,
    /// Empty drive.
    Empty = 5,
}

impl DiskFormat {
    /// Map a format name to the format the toolstack opens it with.
    ///
    /// Both `qcow` and `qcow2` images are opened as QCOW2; anything else is raw.
    pub fn from_name(name: &str) -> Self {
        match name {
            "qcow" | "qcow2" => DiskFormat::Qcow2,
            _ => DiskFormat::Raw,
        }
    }
}

/// Caller-supplied disk settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Host path of the image or block device.
    pub source: PathBuf,
    /// Guest device name; the detach key.
    pub target: String,
    /// Backend implementation.
    pub backend: DiskBackend,
    /// Image format.
    pub format: DiskFormat,
}

impl DiskConfig {
    /// Create a raw disk config, picking the backend from the source path.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            backend: DiskBackend::for_source(&source),
            source,
            target: target.into(),
            format: DiskFormat::Raw,
        }
    }

    /// Create a config for the `id`-th guest disk (`xvda`, `xvdb`, ...).
    pub fn indexed(source: impl Into<PathBuf>, id: usize) -> Self {
        Self::new(source, disk_name(id))
    }

    /// Set the disk format.
    pub fn format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the disk backend.
    pub fn backend(mut self, backend: DiskBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// Disk descriptor handed to the toolstack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    /// Backend domain.
    pub backend_domid: u32,
    /// Host path.
    pub pdev_path: PathBuf,
    /// Guest device name.
    pub vdev: String,
    /// Backend implementation.
    pub backend: DiskBackend,
    /// Image format.
    pub format: DiskFormat,
    /// Media can be removed.
    pub removable: bool,
    /// Writable.
    pub readwrite: bool,
    /// CD-ROM drive.
    pub is_cdrom: bool,
}

impl DiskDevice {
    /// Build a descriptor with fixed policy from caller settings.
    ///
    /// Attach and detach both go through here so a detach describes the
    /// same device shape that was attached.
    pub fn from_config(config: &DiskConfig) -> Self {
        Self {
            backend_domid: BACKEND_DOMID,
            pdev_path: config.source.clone(),
            vdev: config.target.clone(),
            backend: config.backend,
            format: config.format,
            removable: true,
            readwrite: true,
            is_cdrom: false,
        }
    }
}

/// Guest device name of the `id`-th disk: `xvda`..`xvdz`, `xvdaa`, ...
pub fn disk_name(id: usize) -> String {
    format!("{}{}", DISK_NAME_PREFIX, disk_suffix(id))
}

fn disk_suffix(id: usize) -> String {
    let ch = char::from(b'a' + (id % 26) as u8);
    if id < 26 {
        ch.to_string()
    } else {
        let mut prefix = disk_suffix(id / 26 - 1);
        prefix.push(ch);
        prefix
    }
}

impl<T: Toolstack> Hypervisor<T> {
    /// Attach a network interface to a running domain.
    pub fn nic_add(&self, domid: DomainId, config: &NicConfig) -> Result<()> {
        let nic = NicDevice::from_config(config);

        tracing::debug!(
            %domid,
            mac = %nic.mac,
            ip = %nic.ip,
            bridge = %nic.bridge,
            ifname = %nic.ifname,
            "adding network interface"
        );

        self.conn
            .nic_add(domid, &nic)
            .map_err(|e| Error::device_attach(domid, nic.mac.to_string(), e))?;

        tracing::info!(%domid, mac = %nic.mac, "network interface added");
        Ok(())
    }

    /// Detach the network interface with the given MAC address.
    pub fn nic_remove(&self, domid: DomainId, mac: &MacAddr) -> Result<()> {
        let nic = self.conn.nic_from_mac(domid, mac).map_err(|e| {
            tracing::debug!(%domid, %mac, error = %e, "mac does not resolve to an interface");
            Error::device_not_found(domid, mac.to_string())
        })?;

        self.conn
            .nic_remove(domid, &nic)
            .map_err(|e| Error::device_detach(domid, mac.to_string(), e))?;

        tracing::info!(%domid, %mac, "network interface removed");
        Ok(())
    }

    /// Attach a disk to a running domain.
    pub fn disk_add(&self, domid: DomainId, config: &DiskConfig) -> Result<()> {
        let disk = DiskDevice::from_config(config);

        self.conn
            .disk_add(domid, &disk)
            .map_err(|e| Error::device_attach(domid, disk.vdev.clone(), e))?;

        tracing::info!(
            %domid,
            vdev = %disk.vdev,
            source = %disk.pdev_path.display(),
            "disk added"
        );
        Ok(())
    }

    /// Detach a disk from a running domain.
    pub fn disk_remove(&self, domid: DomainId, config: &DiskConfig) -> Result<()> {
        let disk = DiskDevice::from_config(config);

        self.conn.disk_remove(domid, &disk).map_err(|e| {
            if e.is_not_found() {
                Error::device_not_found(domid, disk.vdev.clone())
            } else {
                Error::device_detach(domid, disk.vdev.clone(), e)
            }
        })?;

        tracing::info!(
            %domid,
            vdev = %disk.vdev,
            source = %disk.pdev_path.display(),
            "disk removed"
        );
        Ok(())
    }
}
