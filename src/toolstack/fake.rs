//! In-memory toolstack for tests.
//!
//! Records every call, keeps live domains and devices in a map, and can be
//! told to fail any single operation by name. A [`FakeInspector`] shares the
//! state so tests can inspect it after the connection has moved into a
//! handle or been dropped.

use super::{
    Connector, DeathWatch, Event, EventHooks, EventKind, Toolstack, ToolstackError,
    ToolstackErrorKind, VersionInfo,
};
use crate::device::{DiskDevice, MacAddr, NicDevice};
use crate::domain::{DomainConfig, DomainId, DomainInfo, ShutdownReason};
use crate::logger::{LogAggregator, LogLevel};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const ERROR_FAIL: i32 = -3;
const ERROR_NOT_FOUND: i32 = -21;

struct FakeDomain {
    c_info_uuid: uuid::Uuid,
    paused: bool,
    max_memkb: u64,
    vcpus: u32,
    nics: Vec<NicDevice>,
    disks: Vec<DiskDevice>,
}

struct FakeState {
    version: VersionInfo,
    next_domid: u32,
    next_token: u64,
    domains: HashMap<DomainId, FakeDomain>,
    watches: HashMap<u64, DeathWatch>,
    failing: HashSet<&'static str>,
    calls: Vec<&'static str>,
    freed_events: usize,
    closed: bool,
    hooks: Option<Arc<dyn EventHooks>>,
    helper_pids: HashSet<i32>,
    reaped: Vec<(i32, i32)>,
    removed_disks: Vec<DiskDevice>,
    deaths: Vec<DomainId>,
    crash_while_arming: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            version: VersionInfo {
                major: 4,
                minor: 6,
                capabilities: "xen-3.0-x86_64 xen-3.0-x86_32p hvm-3.0-x86_32 hvm-3.0-x86_64"
                    .to_string(),
            },
            next_domid: 1,
            next_token: 1,
            domains: HashMap::new(),
            watches: HashMap::new(),
            failing: HashSet::new(),
            calls: Vec::new(),
            freed_events: 0,
            closed: false,
            hooks: None,
            helper_pids: HashSet::new(),
            reaped: Vec::new(),
            removed_disks: Vec::new(),
            deaths: Vec::new(),
            crash_while_arming: false,
        }
    }
}

type Shared = Arc<Mutex<FakeState>>;

fn fail(op: &'static str, kind: ToolstackErrorKind) -> ToolstackError {
    let code = match kind {
        ToolstackErrorKind::NotFound => ERROR_NOT_FOUND,
        _ => ERROR_FAIL,
    };
    ToolstackError::new(op, kind, code)
}

/// Record a call and fail it if requested.
fn enter(state: &mut FakeState, op: &'static str) -> Result<(), ToolstackError> {
    state.calls.push(op);
    if state.failing.contains(op) {
        Err(fail(op, ToolstackErrorKind::Failed))
    } else {
        Ok(())
    }
}

/// Fake connection.
pub(crate) struct FakeToolstack {
    state: Shared,
    logger: Option<Arc<LogAggregator>>,
}

impl Default for FakeToolstack {
    fn default() -> Self {
        Self {
            state: Shared::default(),
            logger: None,
        }
    }
}

impl FakeToolstack {
    pub(crate) fn inspector(&self) -> FakeInspector {
        FakeInspector {
            state: self.state.clone(),
        }
    }

    fn log(&self, level: LogLevel, args: std::fmt::Arguments<'_>) {
        if let Some(logger) = &self.logger {
            logger.emit(level, None, args);
        }
    }
}

impl Drop for FakeToolstack {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.calls.push("close");
        state.closed = true;
        state.hooks = None;
    }
}

impl Toolstack for FakeToolstack {
    fn delegate_child_reaping(&self) {
        self.state.lock().calls.push("delegate_child_reaping");
    }

    fn version_info(&self) -> Result<VersionInfo, ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "version_info")?;
        Ok(state.version.clone())
    }

    fn free_memory_kb(&self) -> Result<u64, ToolstackError> {
        enter(&mut self.state.lock(), "free_memory_kb")?;
        Ok(8 << 20)
    }

    fn register_event_hooks(
        &self,
        _mask: u64,
        hooks: Arc<dyn EventHooks>,
    ) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "register_event_hooks")?;
        state.hooks = Some(hooks);
        Ok(())
    }

    fn create_domain(&self, config: &DomainConfig) -> Result<DomainId, ToolstackError> {
        {
            let mut state = self.state.lock();
            enter(&mut state, "create_domain")?;
        }
        self.log(
            LogLevel::Info,
            format_args!("creating domain {}", config.c_info.name),
        );

        let mut state = self.state.lock();
        let domid = DomainId(state.next_domid);
        state.next_domid += 1;
        state.domains.insert(
            domid,
            FakeDomain {
                c_info_uuid: config.c_info.uuid,
                paused: true,
                max_memkb: config.b_info.max_memkb,
                vcpus: config.b_info.avail_vcpus.count_set(),
                nics: config.nics.clone(),
                disks: config.disks.clone(),
            },
        );
        Ok(domid)
    }

    fn enable_domain_death(&self, domid: DomainId) -> Result<DeathWatch, ToolstackError> {
        let (watch, crash_hooks) = {
            let mut state = self.state.lock();
            enter(&mut state, "enable_domain_death")?;
            let token = state.next_token;
            state.next_token += 1;
            let watch = DeathWatch { domid, token };
            state.watches.insert(token, watch);
            let crash_hooks = if state.crash_while_arming {
                state.hooks.clone()
            } else {
                None
            };
            (watch, crash_hooks)
        };

        // Delivered from inside the call, as an event loop on another
        // thread could before the caller sees the watch.
        if let Some(hooks) = crash_hooks {
            hooks.event_occurs(Event {
                domid,
                kind: EventKind::DomainShutdown {
                    reason: ShutdownReason::Crash,
                },
            });
        }
        Ok(watch)
    }

    fn disable_domain_death(&self, watch: DeathWatch) {
        let mut state = self.state.lock();
        state.calls.push("disable_domain_death");
        state.watches.remove(&watch.token);
    }

    fn unpause_domain(&self, domid: DomainId) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "unpause_domain")?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or_else(|| fail("unpause_domain", ToolstackErrorKind::NotFound))?;
        domain.paused = false;
        Ok(())
    }

    fn destroy_domain(&self, domid: DomainId) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "destroy_domain")?;
        state
            .domains
            .remove(&domid)
            .map(|_| ())
            .ok_or_else(|| fail("destroy_domain", ToolstackErrorKind::NotFound))
    }

    fn domain_info(&self, domid: DomainId) -> Result<DomainInfo, ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "domain_info")?;
        let domain = state
            .domains
            .get(&domid)
            .ok_or_else(|| fail("domain_info", ToolstackErrorKind::NotFound))?;
        Ok(DomainInfo {
            domid,
            uuid: domain.c_info_uuid,
            running: !domain.paused,
            blocked: false,
            paused: domain.paused,
            shutdown: false,
            dying: false,
            shutdown_reason: None,
            current_memkb: domain.max_memkb,
            max_memkb: domain.max_memkb,
            vcpu_online: domain.vcpus,
        })
    }

    fn nic_add(&self, domid: DomainId, nic: &NicDevice) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "nic_add")?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or_else(|| fail("nic_add", ToolstackErrorKind::NotFound))?;
        let mut nic = nic.clone();
        nic.devid = Some(domain.nics.len() as u32);
        domain.nics.push(nic);
        Ok(())
    }

    fn nic_from_mac(&self, domid: DomainId, mac: &MacAddr) -> Result<NicDevice, ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "nic_from_mac")?;
        state
            .domains
            .get(&domid)
            .and_then(|d| d.nics.iter().find(|n| n.mac == *mac))
            .cloned()
            .ok_or_else(|| fail("nic_from_mac", ToolstackErrorKind::NotFound))
    }

    fn nic_remove(&self, domid: DomainId, nic: &NicDevice) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "nic_remove")?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or_else(|| fail("nic_remove", ToolstackErrorKind::NotFound))?;
        let before = domain.nics.len();
        domain.nics.retain(|n| n.devid != nic.devid || n.mac != nic.mac);
        if domain.nics.len() == before {
            return Err(fail("nic_remove", ToolstackErrorKind::NotFound));
        }
        Ok(())
    }

    fn disk_add(&self, domid: DomainId, disk: &DiskDevice) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "disk_add")?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or_else(|| fail("disk_add", ToolstackErrorKind::NotFound))?;
        if domain.disks.iter().any(|d| d.vdev == disk.vdev) {
            return Err(fail("disk_add", ToolstackErrorKind::Invalid));
        }
        domain.disks.push(disk.clone());
        Ok(())
    }

    fn disk_remove(&self, domid: DomainId, disk: &DiskDevice) -> Result<(), ToolstackError> {
        let mut state = self.state.lock();
        enter(&mut state, "disk_remove")?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or_else(|| fail("disk_remove", ToolstackErrorKind::NotFound))?;
        let pos = domain
            .disks
            .iter()
            .position(|d| d.vdev == disk.vdev && d.pdev_path == disk.pdev_path)
            .ok_or_else(|| fail("disk_remove", ToolstackErrorKind::NotFound))?;
        domain.disks.remove(pos);
        state.removed_disks.push(disk.clone());
        Ok(())
    }

    fn childproc_reaped(&self, pid: i32, status: i32) -> bool {
        let mut state = self.state.lock();
        state.calls.push("childproc_reaped");
        state.reaped.push((pid, status));
        state.helper_pids.remove(&pid)
    }

    fn free_event(&self, _event: Event) {
        let mut state = self.state.lock();
        state.freed_events += 1;
    }
}

/// Shared view of a fake connection's state.
#[derive(Clone)]
pub(crate) struct FakeInspector {
    state: Shared,
}

impl FakeInspector {
    pub(crate) fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub(crate) fn set_version(&self, major: u32, minor: u32, capabilities: &str) {
        self.state.lock().version = VersionInfo {
            major,
            minor,
            capabilities: capabilities.to_string(),
        };
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub(crate) fn domain_count(&self) -> usize {
        self.state.lock().domains.len()
    }

    pub(crate) fn is_paused(&self, domid: DomainId) -> Option<bool> {
        self.state.lock().domains.get(&domid).map(|d| d.paused)
    }

    pub(crate) fn insert_domain(&self, domid: DomainId) {
        self.state.lock().domains.insert(
            domid,
            FakeDomain {
                c_info_uuid: uuid::Uuid::new_v4(),
                paused: false,
                max_memkb: 131072,
                vcpus: 1,
                nics: Vec::new(),
                disks: Vec::new(),
            },
        );
    }

    pub(crate) fn nics(&self, domid: DomainId) -> Vec<NicDevice> {
        self.state
            .lock()
            .domains
            .get(&domid)
            .map(|d| d.nics.clone())
            .unwrap_or_default()
    }

    pub(crate) fn disks(&self, domid: DomainId) -> Vec<DiskDevice> {
        self.state
            .lock()
            .domains
            .get(&domid)
            .map(|d| d.disks.clone())
            .unwrap_or_default()
    }

    pub(crate) fn removed_disks(&self) -> Vec<DiskDevice> {
        self.state.lock().removed_disks.clone()
    }

    pub(crate) fn active_watches(&self) -> usize {
        self.state.lock().watches.len()
    }

    pub(crate) fn freed_events(&self) -> usize {
        self.state.lock().freed_events
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn has_hooks(&self) -> bool {
        self.state.lock().hooks.is_some()
    }

    pub(crate) fn add_helper_pid(&self, pid: i32) {
        self.state.lock().helper_pids.insert(pid);
    }

    pub(crate) fn reaped(&self) -> Vec<(i32, i32)> {
        self.state.lock().reaped.clone()
    }

    /// Deliver an event through the registered hooks, as the event loop would.
    pub(crate) fn fire(&self, event: Event) {
        let hooks = self.state.lock().hooks.clone();
        if let Some(hooks) = hooks {
            hooks.event_occurs(event);
        }
    }

    /// Make the next arming calls deliver a crash before returning.
    pub(crate) fn crash_while_arming(&self) {
        self.state.lock().crash_while_arming = true;
    }

    pub(crate) fn record_death(&self, domid: DomainId) {
        self.state.lock().deaths.push(domid);
    }

    pub(crate) fn deaths(&self) -> Vec<DomainId> {
        self.state.lock().deaths.clone()
    }
}

/// Fake connector; connections it opens share one inspector.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Shared,
    fail_connect: Arc<Mutex<bool>>,
}

impl FakeConnector {
    pub(crate) fn inspector(&self) -> FakeInspector {
        FakeInspector {
            state: self.state.clone(),
        }
    }

    pub(crate) fn fail_connect(&self) {
        *self.fail_connect.lock() = true;
    }
}

impl Connector for FakeConnector {
    type Connection = FakeToolstack;

    fn connect(&self, logger: Arc<LogAggregator>) -> Result<FakeToolstack, ToolstackError> {
        if *self.fail_connect.lock() {
            return Err(fail("ctx_alloc", ToolstackErrorKind::Failed));
        }
        {
            let mut state = self.state.lock();
            state.calls.push("connect");
            state.closed = false;
        }
        Ok(FakeToolstack {
            state: self.state.clone(),
            logger: Some(logger),
        })
    }
}
