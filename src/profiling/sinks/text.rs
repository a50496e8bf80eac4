//! Human-readable per-completion log

use std::io::Write;

use super::TraceSink;
use crate::error::ShimResult;
use crate::profiling::record::CompletionRecord;

/// Appends one line per completion to a writer
pub struct TextReportSink {
    out: Box<dyn Write + Send>,
    lines: u64,
}

impl TextReportSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        TextReportSink { out, lines: 0 }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines
    }
}

impl TraceSink for TextReportSink {
    fn name(&self) -> &'static str {
        "text"
    }

    fn on_completion(&mut self, record: &CompletionRecord) -> ShimResult<()> {
        writeln!(
            self.out,
            "Device Time for call {} to {} = {} ns (queued {} ns, submitted {} ns)",
            record.enqueue_counter,
            record.key,
            record.device_delta(),
            record.device.queued_to_submit(),
            record.device.submit_to_start(),
        )?;
        self.lines += 1;
        Ok(())
    }

    fn flush(&mut self) -> ShimResult<()> {
        self.out.flush()?;
        Ok(())
    }
}
