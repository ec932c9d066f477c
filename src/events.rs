//! Domain event dispatch.
//!
//! The toolstack invokes [`EventDispatcher`] for every event on its own
//! event-loop thread. Only terminal shutdowns reach the [`DeathSink`];
//! everything else, including suspends, is discarded. Every event is handed
//! back to the toolstack exactly once, whichever path it takes.

use crate::domain::DomainId;
use crate::toolstack::{DeathWatch, Event, EventHooks, EventKind, Toolstack};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;

/// Death-notification state of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSlot {
    /// Notification is being armed.
    Arming,
    /// Notification is armed.
    Armed(DeathWatch),
    /// Terminal shutdown arrived while the notification was being armed.
    Died,
}

impl WatchSlot {
    /// The armed watch, if any.
    pub fn armed(&self) -> Option<DeathWatch> {
        match self {
            WatchSlot::Armed(watch) => Some(*watch),
            _ => None,
        }
    }
}

/// Death-notification registry, keyed by domain.
pub type DeathWatches = Arc<Mutex<HashMap<DomainId, WatchSlot>>>;

/// Receiver of domain-death notifications.
pub trait DeathSink: Send + Sync {
    /// Called once when a domain reaches terminal shutdown.
    fn domain_died(&self, domid: DomainId);
}

impl DeathSink for UnboundedSender<DomainId> {
    fn domain_died(&self, domid: DomainId) {
        if self.send(domid).is_err() {
            tracing::debug!(%domid, "death receiver dropped");
        }
    }
}

/// Adapts a closure into a [`DeathSink`].
pub struct FnDeathSink<F>(pub F);

impl<F> DeathSink for FnDeathSink<F>
where
    F: Fn(DomainId) + Send + Sync,
{
    fn domain_died(&self, domid: DomainId) {
        (self.0)(domid)
    }
}

/// What the dispatcher did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a shutdown event.
    Ignored,
    /// Shutdown for suspend; the domain is alive.
    Suspended,
    /// Terminal shutdown forwarded to the death sink.
    Died(DomainId),
}

/// Classify an event without side effects.
pub fn classify(event: &Event) -> Dispatch {
    match &event.kind {
        EventKind::DomainShutdown { reason } if reason.is_terminal() => Dispatch::Died(event.domid),
        EventKind::DomainShutdown { .. } => Dispatch::Suspended,
        EventKind::DomainDeath
        | EventKind::DiskEject { .. }
        | EventKind::OperationComplete { .. }
        | EventKind::ConsoleAvailable => Dispatch::Ignored,
    }
}

/// Turns toolstack events into death notifications.
pub struct EventDispatcher<T: Toolstack> {
    conn: Weak<T>,
    watches: DeathWatches,
    sink: Arc<dyn DeathSink>,
}

impl<T: Toolstack> EventDispatcher<T> {
    /// Create a dispatcher that releases events through `conn`.
    pub fn new(conn: Weak<T>, watches: DeathWatches, sink: Arc<dyn DeathSink>) -> Self {
        Self {
            conn,
            watches,
            sink,
        }
    }

    /// Handle one event and release it.
    pub fn dispatch(&self, event: Event) -> Dispatch {
        let outcome = classify(&event);
        let conn = self.conn.upgrade();

        match outcome {
            Dispatch::Died(domid) => {
                tracing::info!(%domid, kind = ?event.kind, "domain quit");
                let slot = {
                    let mut watches = self.watches.lock();
                    match watches.remove(&domid) {
                        Some(WatchSlot::Arming) => {
                            watches.insert(domid, WatchSlot::Died);
                            None
                        }
                        slot => slot,
                    }
                };
                if let (Some(watch), Some(conn)) = (slot.and_then(|s| s.armed()), &conn) {
                    conn.disable_domain_death(watch);
                }
                self.sink.domain_died(domid);
            }
            Dispatch::Suspended => {
                tracing::debug!(domid = %event.domid, "domain suspended");
            }
            Dispatch::Ignored => {
                tracing::trace!(domid = %event.domid, kind = ?event.kind, "ignoring event");
            }
        }

        match conn {
            Some(conn) => conn.free_event(event),
            None => tracing::debug!("connection closed, dropping event"),
        }
        outcome
    }
}

impl<T: Toolstack> EventHooks for EventDispatcher<T> {
    fn event_occurs(&self, event: Event) {
        self.dispatch(event);
    }
}
