//! Domain specification and build state.

use super::DomainType;
use crate::config::ControlConfig;
use crate::device::{DiskDevice, NicDevice};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default guest kernel command line.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0 pci=nomsi";

/// Default vCPU count.
pub const DEFAULT_VCPUS: u32 = 1;

/// Default memory in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 128;

/// Scheduler weight given to every domain.
pub const SCHED_WEIGHT: u32 = 1000;

/// Boot order: first disk.
pub const BOOT_ORDER_DISK: &str = "c";

/// Minimal description of a domain to start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainSpec {
    /// Virtualization mode.
    pub domain_type: DomainType,

    /// Display name.
    pub name: String,

    /// Guest kernel image.
    pub kernel: PathBuf,

    /// Guest initrd image.
    pub initrd: PathBuf,

    /// Kernel command line.
    pub cmdline: String,

    /// Number of vCPUs.
    pub max_vcpus: u32,

    /// Memory size in KiB.
    pub max_memory_kb: u64,

    /// Serial console specification handed to the device model.
    pub console_sock: String,

    /// Extra device-model arguments.
    pub extra: Vec<String>,
}

impl DomainSpec {
    /// Create a builder for a hardware-virtualized domain.
    pub fn builder(
        name: impl Into<String>,
        kernel: impl Into<PathBuf>,
        initrd: impl Into<PathBuf>,
    ) -> DomainSpecBuilder {
        DomainSpecBuilder::new(name, kernel, initrd)
    }
}

/// Builder for DomainSpec.
#[derive(Debug)]
pub struct DomainSpecBuilder {
    spec: DomainSpec,
}

impl DomainSpecBuilder {
    /// Create a new builder with driver defaults.
    pub fn new(
        name: impl Into<String>,
        kernel: impl Into<PathBuf>,
        initrd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spec: DomainSpec {
                domain_type: DomainType::Hvm,
                name: name.into(),
                kernel: kernel.into(),
                initrd: initrd.into(),
                cmdline: DEFAULT_CMDLINE.to_string(),
                max_vcpus: DEFAULT_VCPUS,
                max_memory_kb: DEFAULT_MEMORY_MIB << 10,
                console_sock: String::new(),
                extra: Vec::new(),
            },
        }
    }

    /// Set the virtualization mode.
    pub fn domain_type(mut self, domain_type: DomainType) -> Self {
        self.spec.domain_type = domain_type;
        self
    }

    /// Set the kernel command line.
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.spec.cmdline = cmdline.into();
        self
    }

    /// Set the number of vCPUs.
    pub fn cpus(mut self, cpus: u32) -> Self {
        self.spec.max_vcpus = cpus;
        self
    }

    /// Set the memory in MiB. Saturates at `u64::MAX` KiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.spec.max_memory_kb = mib.saturating_mul(1024);
        self
    }

    /// Set the memory in KiB.
    pub fn memory_kb(mut self, kb: u64) -> Self {
        self.spec.max_memory_kb = kb;
        self
    }

    /// Expose the serial console on a listening Unix socket.
    pub fn console_socket(mut self, path: impl AsRef<Path>) -> Self {
        self.spec.console_sock = format!("unix:{},server,nowait", path.as_ref().display());
        self
    }

    /// Add a device-model argument.
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.extra.push(arg.into());
        self
    }

    /// Add several device-model arguments.
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.extra.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the DomainSpec.
    pub fn build(self) -> DomainSpec {
        self.spec
    }
}

/// Shadow memory reservation in KiB.
///
/// 256 pages (1 MiB) per vCPU, plus one page per MiB of RAM for the P2M map,
/// plus one page per MiB of RAM to shadow resident processes.
pub fn shadow_memory_kb(vcpus: u32, memory_kb: u64) -> u64 {
    4 * (256 * u64::from(vcpus) + 2 * (memory_kb / 1024))
}

/// Bitmap of available vCPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuBitmap {
    words: Vec<u64>,
    size: usize,
}

impl CpuBitmap {
    /// Allocate an empty bitmap for `size` vCPUs.
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(64)],
            size,
        }
    }

    /// Number of vCPUs the bitmap covers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark a vCPU as online. Out-of-range indices are ignored.
    pub fn set(&mut self, cpu: usize) {
        if cpu < self.size {
            self.words[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    /// Mark every vCPU as online.
    pub fn set_all(&mut self) {
        for cpu in 0..self.size {
            self.set(cpu);
        }
    }

    /// Check if a vCPU is online.
    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < self.size && self.words[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    /// Count online vCPUs.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Creation-time identity of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInfo {
    /// Virtualization mode.
    pub domain_type: DomainType,
    /// Freshly generated domain UUID.
    pub uuid: Uuid,
    /// Domain name.
    pub name: String,
    /// Whether the toolstack runs hotplug scripts itself.
    pub run_hotplug_scripts: bool,
}

/// Emulated graphics adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgaKind {
    /// No graphics adapter.
    None,
    /// Standard VGA.
    Std,
    /// Cirrus logic adapter.
    Cirrus,
}

/// Firmware, boot and console settings of a hardware-virtualized domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvmBuildInfo {
    /// Physical address extension.
    pub pae: bool,
    /// Local APIC.
    pub apic: bool,
    /// ACPI tables.
    pub acpi: bool,
    /// Boot device order.
    pub boot: String,
    /// Graphics adapter.
    pub vga: VgaKind,
    /// Disable graphical output entirely.
    pub nographic: bool,
    /// Remote display.
    pub vnc: bool,
    /// Local GUI.
    pub sdl: bool,
    /// Serial console specification.
    pub serial: String,
}

/// Build-time resources of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// Maximum vCPU count.
    pub max_vcpus: u32,
    /// vCPUs online at boot.
    pub avail_vcpus: CpuBitmap,
    /// Credit scheduler weight.
    pub sched_weight: u32,
    /// Maximum memory in KiB.
    pub max_memkb: u64,
    /// Target memory in KiB.
    pub target_memkb: u64,
    /// Video memory in KiB.
    pub video_memkb: u64,
    /// Shadow memory reservation in KiB.
    pub shadow_memkb: u64,
    /// Guest kernel.
    pub kernel: PathBuf,
    /// Guest initrd.
    pub ramdisk: PathBuf,
    /// Kernel command line.
    pub cmdline: String,
    /// Extra device-model arguments.
    pub extra: Vec<String>,
    /// HVM-specific settings.
    pub hvm: HvmBuildInfo,
}

/// Full build state for one create call.
///
/// Owns everything it references; it is dropped when the create call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// Creation-time identity.
    pub c_info: CreateInfo,
    /// Build-time resources.
    pub b_info: BuildInfo,
    /// Network interfaces present at creation (attached later).
    pub nics: Vec<NicDevice>,
    /// Disks present at creation (attached later).
    pub disks: Vec<DiskDevice>,
}

impl DomainConfig {
    /// Assemble the build state for a domain spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedMode`] for paravirtualized specs and
    /// [`Error::ResourceBuild`] when the vCPU bitmap or memory sizing cannot be
    /// derived from the spec.
    pub fn build(spec: &DomainSpec, config: &ControlConfig) -> Result<Self> {
        if spec.domain_type != DomainType::Hvm {
            return Err(Error::UnsupportedMode(spec.domain_type.to_string()));
        }

        if spec.max_vcpus == 0 || spec.max_vcpus > config.max_vcpus {
            return Err(Error::resource_build(
                &spec.name,
                format!(
                    "vcpu count {} outside 1..={}",
                    spec.max_vcpus, config.max_vcpus
                ),
            ));
        }
        if spec.max_memory_kb == 0 {
            return Err(Error::resource_build(&spec.name, "memory size is zero"));
        }

        let c_info = CreateInfo {
            domain_type: spec.domain_type,
            uuid: Uuid::new_v4(),
            name: spec.name.clone(),
            run_hotplug_scripts: false,
        };

        let mut avail_vcpus = CpuBitmap::new(spec.max_vcpus as usize);
        avail_vcpus.set_all();

        let hvm = HvmBuildInfo {
            pae: true,
            apic: false,
            acpi: true,
            boot: BOOT_ORDER_DISK.to_string(),
            vga: VgaKind::None,
            nographic: true,
            vnc: false,
            sdl: false,
            serial: spec.console_sock.clone(),
        };

        let shadow_memkb = shadow_memory_kb(avail_vcpus.count_set(), spec.max_memory_kb);

        let b_info = BuildInfo {
            max_vcpus: spec.max_vcpus,
            avail_vcpus,
            sched_weight: SCHED_WEIGHT,
            max_memkb: spec.max_memory_kb,
            target_memkb: spec.max_memory_kb,
            video_memkb: 0,
            shadow_memkb,
            kernel: spec.kernel.clone(),
            ramdisk: spec.initrd.clone(),
            cmdline: spec.cmdline.clone(),
            extra: spec.extra.clone(),
            hvm,
        };

        Ok(Self {
            c_info,
            b_info,
            nics: Vec::new(),
            disks: Vec::new(),
        })
    }
}
