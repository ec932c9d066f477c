//! Tracing setup and the default toolstack log sink.

use crate::logger::LogSink;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "xlctl=warn";

/// Initialize the tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to warnings from this crate only. Calling
/// this more than once is harmless.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Log sink that forwards toolstack lines to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_line(&self, line: &[u8]) {
        tracing::debug!("[libxl] {}", String::from_utf8_lossy(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::logger::{LogAggregator, LogLevel};
    use std::sync::Arc;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn test_tracing_sink_accepts_lossy_lines() {
        let agg = LogAggregator::new(&LogConfig::default(), Arc::new(TracingSink)).unwrap();
        agg.message(LogLevel::Info, "domain 1 created");
        TracingSink.log_line(b"\xffinvalid utf-8");
    }
}
