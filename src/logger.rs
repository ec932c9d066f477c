//! Toolstack log aggregation.
//!
//! The toolstack reports diagnostics and progress through a
//! [`LogAggregator`]. Each message is rendered into a bounded line buffer
//! and flushed to a [`LogSink`] immediately. Progress updates are collapsed:
//! repeats are dropped, small steps are demoted to [`LogLevel::Detail`], and
//! the last progress line is erased before the next line is written.
//!
//! The aggregator is called from both the control thread and the toolstack's
//! event loop, so all buffer mutation happens under one lock.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// Forward steps smaller than this many percent are logged at detail level.
const PROGRESS_DETAIL_STEP: i32 = 5;

/// Severity of a toolstack log message, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debugging output.
    Debug,
    /// Verbose output.
    Verbose,
    /// Fine-grained detail, including small progress steps.
    Detail,
    /// Progress updates.
    Progress,
    /// Informational.
    Info,
    /// Normal but significant.
    Notice,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical error.
    Critical,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Detail => "detail",
            LogLevel::Progress => "progress",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for flushed log lines.
pub trait LogSink: Send + Sync {
    /// Receive one flushed line. The bytes are not newline-terminated.
    fn log_line(&self, line: &[u8]);
}

/// `fmt::Write` adapter that stops silently at capacity.
struct Bounded<'a> {
    buf: &'a mut Vec<u8>,
    capacity: usize,
}

impl fmt::Write for Bounded<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.capacity.saturating_sub(self.buf.len());
        let n = room.min(s.len());
        self.buf.extend_from_slice(&s.as_bytes()[..n]);
        Ok(())
    }
}

struct LogState {
    buf: Vec<u8>,
    capacity: usize,
    progress_erase_len: usize,
    progress_last_percent: i32,
}

impl LogState {
    fn writer(&mut self) -> Bounded<'_> {
        Bounded {
            buf: &mut self.buf,
            capacity: self.capacity,
        }
    }

    /// Overwrite the last progress line, if one is displayed.
    fn erase_progress(&mut self) {
        if self.progress_erase_len > 0 {
            let width = self.progress_erase_len;
            let _ = write!(self.writer(), "\r{:width$}\r", "", width = width);
            self.progress_erase_len = 0;
        }
    }

    /// Render one line into the buffer. Returns the rendered width.
    fn render(&mut self, level: LogLevel, errno: Option<i32>, args: fmt::Arguments<'_>) -> usize {
        self.erase_progress();
        let start = self.buf.len();

        let mut w = self.writer();
        let _ = write!(w, "{}: ", level);
        let _ = w.write_fmt(args);
        if let Some(errno) = errno {
            let _ = write!(w, ": {}", nix::errno::Errno::from_i32(errno).desc());
        }

        self.buf.len() - start
    }

    fn flush(&mut self, sink: &dyn LogSink) {
        if !self.buf.is_empty() {
            sink.log_line(&self.buf);
            self.buf.clear();
        }
    }
}

/// Bounded, lock-protected log buffer with progress collapsing.
pub struct LogAggregator {
    min_level: LogLevel,
    hide_progress: bool,
    sink: Arc<dyn LogSink>,
    state: Mutex<LogState>,
}

impl LogAggregator {
    /// Create an aggregator that flushes into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoggerInit`] if the buffer size is zero or the buffer
    /// cannot be allocated.
    pub fn new(config: &LogConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(Error::LoggerInit("buffer size must be non-zero".into()));
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(config.buffer_size)
            .map_err(|e| Error::LoggerInit(e.to_string()))?;

        Ok(Self {
            min_level: config.min_level,
            hide_progress: config.hide_progress,
            sink,
            state: Mutex::new(LogState {
                buf,
                capacity: config.buffer_size,
                progress_erase_len: 0,
                progress_last_percent: 0,
            }),
        })
    }

    /// Messages below this level are discarded.
    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Render and flush one message.
    ///
    /// If `errno` is given, its description is appended. Output longer than
    /// the buffer capacity is truncated.
    pub fn emit(&self, level: LogLevel, errno: Option<i32>, args: fmt::Arguments<'_>) {
        if level < self.min_level {
            return;
        }

        let mut state = self.state.lock();
        state.render(level, errno, args);
        state.flush(self.sink.as_ref());
    }

    /// Render and flush a plain message.
    pub fn message(&self, level: LogLevel, msg: &str) {
        self.emit(level, None, format_args!("{}", msg));
    }

    /// Report progress of a long-running toolstack activity.
    ///
    /// `context` names the reporting subsystem and is not rendered.
    pub fn progress(&self, context: &str, activity: &str, percent: i32, done: u64, total: u64) {
        if self.hide_progress {
            return;
        }

        let mut state = self.state.lock();
        let last = state.progress_last_percent;
        let level = if percent < last {
            LogLevel::Progress
        } else if percent == last {
            return;
        } else if i64::from(percent) - i64::from(last) < i64::from(PROGRESS_DETAIL_STEP) {
            LogLevel::Detail
        } else {
            LogLevel::Progress
        };

        if level < self.min_level {
            return;
        }

        tracing::trace!(context, activity, percent, "toolstack progress");

        state.progress_last_percent = percent;
        let width = state.render(
            level,
            None,
            format_args!("{}: {}/{}  {:>3}%", activity, done, total, percent),
        );
        state.flush(self.sink.as_ref());
        state.progress_erase_len = width;
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.erase_progress();
        state.flush(self.sink.as_ref());
    }
}

impl fmt::Debug for LogAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogAggregator")
            .field("min_level", &self.min_level)
            .field("hide_progress", &self.hide_progress)
            .finish_non_exhaustive()
    }
}
