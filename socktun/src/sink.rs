//! Injected line-oriented log capability.
//!
//! The host that embeds the proxy decides where diagnostic lines go (an
//! output pane, a file, stdout). The core only ever appends lines.

/// Capability to append one line of diagnostic text.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// Forwards appended lines through `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn append(&self, line: &str) {
        tracing::info!("{line}");
    }
}

/// Discards every line. Useful for embedders that only want `tracing`
/// output, and for tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn append(&self, _line: &str) {}
}

impl<T: LogSink + ?Sized> LogSink for std::sync::Arc<T> {
    fn append(&self, line: &str) {
        (**self).append(line);
    }
}
