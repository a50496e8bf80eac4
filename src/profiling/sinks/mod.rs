//! Consumers of completion records
//!
//! Every sink sees every record. A sink failure is logged and counted but
//! never reaches the application, and never stops the remaining sinks.

pub mod profiler;
pub mod text;
pub mod timeline;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::error::ShimResult;

use super::record::{CompletionRecord, HostCallRecord};

pub use profiler::{
    ClockDomainId, ClockSyncContext, ProfilerBridgeSink, ProfilerDomain, ProfilerInterval,
    TracingDomain,
};
pub use text::TextReportSink;
pub use timeline::TimelineSink;

pub trait TraceSink: Send {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    fn on_completion(&mut self, record: &CompletionRecord) -> ShimResult<()>;

    /// Host-side call timing; most sinks only care about completions
    fn on_host_call(&mut self, _call: &HostCallRecord<'_>) -> ShimResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> ShimResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TraceSinkSet {
    sinks: Vec<Box<dyn TraceSink>>,
    failures: u64,
}

impl TraceSinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn TraceSink>) {
        tracing::debug!(sink = sink.name(), "trace sink enabled");
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Sink errors swallowed so far
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn notify(&mut self, record: &CompletionRecord) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.on_completion(record) {
                self.failures += 1;
                tracing::warn!(sink = sink.name(), key = %record.key, error = %err, "trace sink failed");
            }
        }
    }

    pub fn notify_call(&mut self, call: &HostCallRecord<'_>) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.on_host_call(call) {
                self.failures += 1;
                tracing::warn!(sink = sink.name(), call = call.name, error = %err, "trace sink failed");
            }
        }
    }

    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                self.failures += 1;
                tracing::warn!(sink = sink.name(), error = %err, "trace sink flush failed");
            }
        }
    }
}

impl std::fmt::Debug for TraceSinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSinkSet")
            .field("sinks", &self.names())
            .field("failures", &self.failures)
            .finish()
    }
}

/// In-memory writer that can be shared with a sink and read back later
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.inner.lock() {
            Ok(bytes) => bytes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "shared buffer poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
