//! Child-process reaping.
//!
//! The toolstack spawns helper processes (device models, hotplug scripts)
//! but leaves reaping to the caller. Each child-termination signal reaps at
//! most one child and reports it back so the toolstack can match the pid
//! against its helpers.

use crate::toolstack::Toolstack;
use std::sync::Weak;

/// A child reaped by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedChild {
    /// Process id.
    pub pid: i32,
    /// Raw wait status.
    pub status: i32,
    /// Whether the toolstack recognised the pid as one of its helpers.
    pub helper: bool,
}

/// Reaps children on behalf of one toolstack connection.
pub struct ChildReaper<T: Toolstack> {
    conn: Weak<T>,
}

impl<T: Toolstack> Clone for ChildReaper<T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

impl<T: Toolstack> ChildReaper<T> {
    /// Create a reaper reporting to `conn`.
    pub fn new(conn: Weak<T>) -> Self {
        Self { conn }
    }

    /// Check if the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.conn.strong_count() > 0
    }

    /// Reap one terminated child without blocking.
    ///
    /// Returns `None` when no child has exited.
    pub fn reap_one(&self) -> Option<ReapedChild> {
        self.reap_with(|| {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            (pid > 0).then_some((pid, status))
        })
    }

    /// Report the child returned by `wait` to the connection.
    ///
    /// A child reaped after the connection closed is reported as not a helper.
    pub fn reap_with<F>(&self, wait: F) -> Option<ReapedChild>
    where
        F: FnOnce() -> Option<(i32, i32)>,
    {
        let (pid, status) = wait()?;

        let helper = match self.conn.upgrade() {
            Some(conn) => conn.childproc_reaped(pid, status),
            None => false,
        };

        tracing::debug!(pid, status, helper, "reaped child");
        Some(ReapedChild {
            pid,
            status,
            helper,
        })
    }
}

/// Reap a child on every SIGCHLD until the connection closes.
///
/// Must be called within a tokio runtime.
pub async fn watch_sigchld<T: Toolstack>(reaper: ChildReaper<T>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigchld = signal(SignalKind::child())?;
    while sigchld.recv().await.is_some() {
        if !reaper.is_connected() {
            break;
        }
        reaper.reap_one();
    }
    tracing::debug!("sigchld watcher stopped");
    Ok(())
}
