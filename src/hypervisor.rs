//! Hypervisor handle and domain lifecycle control.
//!
//! [`Hypervisor::initialize`] opens one toolstack connection and gates it on
//! version and capability checks. The handle then starts, destroys, inspects
//! and reattaches domains. Every multi-stage operation unwinds what it
//! acquired before returning an error: locals are dropped in reverse order,
//! and explicit compensating calls undo toolstack side effects.

use crate::config::ControlConfig;
use crate::domain::{DomainConfig, DomainId, DomainInfo, DomainRecord, DomainSpec};
use crate::error::{Error, Result};
use crate::events::{DeathSink, DeathWatches, EventDispatcher, WatchSlot};
use crate::logger::{LogAggregator, LogSink};
use crate::reaper::ChildReaper;
use crate::toolstack::{Connector, DeathWatch, Toolstack, ToolstackError, EVENT_MASK_ALL};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Initial capacity of the death-watch registry.
const WATCH_CAPACITY: usize = 16;

/// Check whether a legacy xend daemon owns the hypervisor.
///
/// A missing `xend` binary means no daemon.
fn xend_running() -> bool {
    Command::new("xend")
        .arg("status")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// An open, validated connection to the hypervisor toolstack.
///
/// Dropping the handle disarms the remaining death notifications, then
/// closes the connection and destroys the logger.
pub struct Hypervisor<T: Toolstack> {
    pub(crate) conn: Arc<T>,
    logger: Arc<LogAggregator>,
    config: ControlConfig,
    version: u32,
    capabilities: String,
    watches: DeathWatches,
}

impl<T: Toolstack> Hypervisor<T> {
    /// Open a connection and validate the host.
    ///
    /// Domain deaths observed from here on are reported to `deaths`;
    /// toolstack diagnostics are written to `log_sink`.
    ///
    /// # Errors
    ///
    /// - [`Error::XendRunning`] when the xend check is enabled and answers
    /// - [`Error::Allocation`] when the watch registry cannot be reserved
    /// - [`Error::LoggerInit`] when the log aggregator cannot be built
    /// - [`Error::Connection`] when the connection cannot be opened
    /// - [`Error::CapabilityQuery`] when the version or free-memory query fails
    /// - [`Error::VersionTooOld`] or [`Error::HvmUnsupported`] from the host gate
    pub fn initialize<C>(
        connector: &C,
        config: ControlConfig,
        log_sink: Arc<dyn LogSink>,
        deaths: Arc<dyn DeathSink>,
    ) -> Result<Self>
    where
        C: Connector<Connection = T>,
    {
        if config.check_xend && xend_running() {
            return Err(Error::XendRunning);
        }

        let watches = DeathWatches::default();
        watches
            .lock()
            .try_reserve(WATCH_CAPACITY)
            .map_err(|_| Error::Allocation)?;

        let logger = Arc::new(LogAggregator::new(&config.log, log_sink)?);

        let conn = Arc::new(
            connector
                .connect(logger.clone())
                .map_err(Error::Connection)?,
        );

        conn.delegate_child_reaping();

        let info = conn.version_info().map_err(Error::CapabilityQuery)?;
        let free_kb = conn.free_memory_kb().map_err(Error::CapabilityQuery)?;

        let version = info.encoded();
        tracing::debug!(
            version,
            capabilities = %info.capabilities,
            free_kb,
            "toolstack connected"
        );

        if version < config.required_version {
            return Err(Error::VersionTooOld {
                found: version,
                required: config.required_version,
            });
        }
        if !info.supports_hvm() {
            return Err(Error::HvmUnsupported {
                capabilities: info.capabilities,
            });
        }

        let dispatcher = EventDispatcher::new(Arc::downgrade(&conn), watches.clone(), deaths);
        if let Err(e) = conn.register_event_hooks(EVENT_MASK_ALL, Arc::new(dispatcher)) {
            tracing::warn!(error = %e, "event registration failed, domain deaths will not be reported");
        }

        Ok(Self {
            conn,
            logger,
            config,
            version,
            capabilities: info.capabilities,
            watches,
        })
    }

    /// Create, monitor and unpause a domain.
    ///
    /// On success the domain is running and its death notification is armed.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedMode`] / [`Error::ResourceBuild`] before anything
    ///   is created
    /// - [`Error::DomainCreate`] when creation fails
    /// - [`Error::DeathNotifyArm`] when the domain cannot be monitored
    /// - [`Error::DomainExited`] when the domain shuts down while being armed
    /// - [`Error::DomainUnpause`] when the first unpause fails
    ///
    /// Every error after creation destroys the domain again; `destroyed`
    /// reports whether that worked and `domid` names the domain otherwise.
    pub fn start(&self, spec: &DomainSpec) -> Result<DomainId> {
        let config = DomainConfig::build(spec, &self.config)?;

        tracing::debug!(
            name = %spec.name,
            uuid = %config.c_info.uuid,
            vcpus = config.b_info.max_vcpus,
            memory_kb = config.b_info.max_memkb,
            shadow_kb = config.b_info.shadow_memkb,
            "creating domain"
        );

        let domid = self
            .conn
            .create_domain(&config)
            .map_err(|e| Error::domain_create(&spec.name, e))?;

        let (armed, died) = self.arm_watch(domid);
        let watch = match armed {
            Ok(watch) => watch,
            Err(source) => {
                let destroyed = self.destroy_after_failed_start(domid);
                return Err(Error::DeathNotifyArm {
                    domid,
                    destroyed,
                    source,
                });
            }
        };

        if died {
            self.conn.disable_domain_death(watch);
            let destroyed = self.destroy_after_failed_start(domid);
            return Err(Error::DomainExited { domid, destroyed });
        }

        if let Err(source) = self.conn.unpause_domain(domid) {
            let watch = self.watches.lock().remove(&domid).and_then(|s| s.armed());
            if let Some(watch) = watch {
                self.conn.disable_domain_death(watch);
            }
            let destroyed = self.destroy_after_failed_start(domid);
            return Err(Error::DomainUnpause {
                domid,
                destroyed,
                source,
            });
        }

        tracing::info!(%domid, name = %spec.name, "domain started");
        Ok(domid)
    }

    /// Arm the death notification and register it.
    ///
    /// The domain holds an `Arming` slot while the toolstack call runs, so a
    /// terminal shutdown delivered meanwhile is recorded instead of lost.
    /// Returns the arming result and whether the domain died during it; a
    /// watch is registered only when arming succeeded and the domain lives.
    fn arm_watch(
        &self,
        domid: DomainId,
    ) -> (std::result::Result<DeathWatch, ToolstackError>, bool) {
        self.watches.lock().insert(domid, WatchSlot::Arming);
        let armed = self.conn.enable_domain_death(domid);

        let mut watches = self.watches.lock();
        let died = watches.remove(&domid) == Some(WatchSlot::Died);
        if let (Ok(watch), false) = (&armed, died) {
            watches.insert(domid, WatchSlot::Armed(*watch));
        }
        (armed, died)
    }

    /// Compensating destroy for a domain `start` could not finish.
    ///
    /// Returns whether the domain is gone.
    fn destroy_after_failed_start(&self, domid: DomainId) -> bool {
        match self.conn.destroy_domain(domid) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%domid, error = %e, "domain left behind unmonitored");
                false
            }
        }
    }

    /// Destroy a domain.
    ///
    /// The death notification stays armed if the destroy fails.
    pub fn destroy(&self, domid: DomainId) -> Result<()> {
        self.conn
            .destroy_domain(domid)
            .map_err(|source| Error::DomainDestroy { domid, source })?;

        let watch = self.watches.lock().remove(&domid).and_then(|s| s.armed());
        if let Some(watch) = watch {
            self.conn.disable_domain_death(watch);
        }

        tracing::info!(%domid, "domain destroyed");
        Ok(())
    }

    /// Inspect a domain.
    ///
    /// Returns [`Error::DomainNotFound`] if the domain does not exist and
    /// [`Error::DomainQuery`] for any other toolstack failure.
    pub fn check(&self, domid: DomainId) -> Result<DomainInfo> {
        self.conn.domain_info(domid).map_err(|source| {
            if source.is_not_found() {
                Error::DomainNotFound { domid, source }
            } else {
                Error::DomainQuery { domid, source }
            }
        })
    }

    /// Reattach to a domain from a persisted record.
    ///
    /// Validates the record, confirms the domain still exists and arms its
    /// death notification unless it is already armed. The domain is never
    /// destroyed by a failed reattach.
    pub fn load_domain(&self, record: &DomainRecord) -> Result<DomainId> {
        let domid = record.domain_id()?;
        let info = self.check(domid)?;

        if self.is_watched(domid) {
            return Ok(domid);
        }

        let (armed, died) = self.arm_watch(domid);
        let watch = armed.map_err(|source| Error::DeathNotifyArm {
            domid,
            destroyed: false,
            source,
        })?;
        if died {
            self.conn.disable_domain_death(watch);
            return Err(Error::DomainExited {
                domid,
                destroyed: false,
            });
        }

        tracing::info!(%domid, state = %info.state(), "domain reattached");
        Ok(domid)
    }

    /// Encoded toolstack version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Capabilities string reported at connection time.
    pub fn capabilities(&self) -> &str {
        &self.capabilities
    }

    /// Log aggregator shared with the toolstack.
    pub fn logger(&self) -> &Arc<LogAggregator> {
        &self.logger
    }

    /// Active configuration.
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Check if a domain's death notification is armed.
    pub fn is_watched(&self, domid: DomainId) -> bool {
        matches!(self.watches.lock().get(&domid), Some(WatchSlot::Armed(_)))
    }

    /// Domains with an armed death notification.
    pub fn watched_domains(&self) -> Vec<DomainId> {
        let mut domids: Vec<_> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, slot)| slot.armed().is_some())
            .map(|(domid, _)| *domid)
            .collect();
        domids.sort();
        domids
    }

    /// Child-reap handler bound to this connection.
    pub fn child_reaper(&self) -> ChildReaper<T> {
        ChildReaper::new(Arc::downgrade(&self.conn))
    }
}

impl<T: Toolstack> Drop for Hypervisor<T> {
    fn drop(&mut self) {
        let watches: Vec<_> = self
            .watches
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.armed())
            .collect();
        for watch in watches {
            self.conn.disable_domain_death(watch);
        }
        tracing::debug!("closing toolstack connection");
    }
}

impl<T: Toolstack> std::fmt::Debug for Hypervisor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hypervisor")
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .field("watched", &self.watches.lock().len())
            .finish()
    }
}
