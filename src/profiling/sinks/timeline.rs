//! Chrome trace-event timeline
//!
//! The output is an unterminated JSON array (`[` followed by one event per
//! line, each with a trailing comma), which chrome://tracing and Perfetto both
//! accept. Events are only ever appended, so a file cut short by a crash
//! still loads.
//!
//! Device timestamps live in the backend's clock. They are placed on the host
//! timeline by anchoring the device's queued timestamp at the host time the
//! operation was submitted; timestamps are microseconds since the process
//! start reference captured when the shim initialized.
//!
//! With call logging enabled, host API calls are written too. They sit on the
//! calling thread's track (a positive tid) next to the queue tracks.

use std::collections::HashMap;
use std::io::{BufWriter, Write};

use serde::Serialize;

use super::TraceSink;
use crate::error::ShimResult;
use crate::profiling::record::{CompletionRecord, HostCallRecord};

#[derive(Serialize)]
struct CompleteEvent<'a> {
    ph: &'static str,
    pid: u32,
    tid: i64,
    name: &'a str,
    ts: f64,
    dur: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<IdArgs>,
}

#[derive(Serialize)]
struct IdArgs {
    id: u64,
}

#[derive(Serialize)]
struct MetadataEvent<'a> {
    ph: &'static str,
    name: &'static str,
    pid: u32,
    tid: i64,
    args: MetadataArgs<'a>,
}

#[derive(Serialize, Default)]
struct MetadataArgs<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<u64>,
}

pub struct TimelineSink {
    out: BufWriter<Box<dyn Write + Send>>,
    pid: u32,
    start_ns: u64,
    stages: bool,
    call_logging: bool,
    /// Queue handle to queue number, in order of first appearance
    queues: HashMap<usize, u32>,
    events: u64,
}

impl TimelineSink {
    /// Start a timeline and write its header
    ///
    /// `start_ns` is the host clock reading all timestamps are relative to.
    pub fn new(out: Box<dyn Write + Send>, start_ns: u64, stages: bool) -> ShimResult<Self> {
        let mut sink = TimelineSink {
            out: BufWriter::new(out),
            pid: std::process::id(),
            start_ns,
            stages,
            call_logging: false,
            queues: HashMap::new(),
            events: 0,
        };
        sink.out.write_all(b"[\n")?;
        sink.write_metadata(0, "process_name", MetadataArgs {
            name: Some("clshim"),
            ..Default::default()
        })?;
        sink.write_metadata(0, "clshim_start_time", MetadataArgs {
            start_time: Some(start_ns),
            ..Default::default()
        })?;
        sink.out.flush()?;
        Ok(sink)
    }

    /// Also record host API calls, each on its calling thread's track
    pub fn with_call_logging(mut self, enabled: bool) -> Self {
        self.call_logging = enabled;
        self
    }

    /// Complete events written so far
    pub fn events_written(&self) -> u64 {
        self.events
    }

    fn write_metadata(&mut self, tid: i64, name: &'static str, args: MetadataArgs<'_>) -> ShimResult<()> {
        let event = MetadataEvent {
            ph: "M",
            name,
            pid: self.pid,
            tid,
            args,
        };
        serde_json::to_writer(&mut self.out, &event)?;
        self.out.write_all(b",\n")?;
        Ok(())
    }

    /// Thread id for a queue; queues render as negative ids below host threads
    fn queue_tid(&mut self, queue: usize) -> ShimResult<i64> {
        if let Some(&number) = self.queues.get(&queue) {
            return Ok(-i64::from(number));
        }
        let number = self.queues.len() as u32 + 1;
        self.queues.insert(queue, number);

        let tid = -i64::from(number);
        let label = format!("Queue {number} ({queue:#x})");
        self.write_metadata(tid, "thread_name", MetadataArgs {
            name: Some(&label),
            ..Default::default()
        })?;
        self.write_metadata(tid, "thread_sort_index", MetadataArgs {
            sort_index: Some(number),
            ..Default::default()
        })?;
        Ok(tid)
    }

    fn write_event(&mut self, tid: i64, name: &str, ts_ns: u64, dur_ns: u64, id: Option<u64>) -> ShimResult<()> {
        let event = CompleteEvent {
            ph: "X",
            pid: self.pid,
            tid,
            name,
            ts: ts_ns as f64 / 1000.0,
            dur: dur_ns as f64 / 1000.0,
            args: id.map(|id| IdArgs { id }),
        };
        serde_json::to_writer(&mut self.out, &event)?;
        self.out.write_all(b",\n")?;
        self.events += 1;
        Ok(())
    }
}

impl TraceSink for TimelineSink {
    fn name(&self) -> &'static str {
        "timeline"
    }

    fn on_completion(&mut self, record: &CompletionRecord) -> ShimResult<()> {
        let tid = self.queue_tid(record.queue)?;
        let device = &record.device;
        let queued = record.host_queued_ns.saturating_sub(self.start_ns);
        let id = Some(record.enqueue_counter);

        if self.stages {
            let submitted = queued + device.queued_to_submit();
            let started = submitted + device.submit_to_start();
            self.write_event(
                tid,
                &format!("{} (Queued)", record.key),
                queued,
                device.queued_to_submit(),
                id,
            )?;
            self.write_event(
                tid,
                &format!("{} (Submitted)", record.key),
                submitted,
                device.submit_to_start(),
                id,
            )?;
            self.write_event(tid, &record.key, started, device.start_to_end(), id)?;
        } else {
            let started = queued + device.started.saturating_sub(device.queued);
            self.write_event(tid, &record.key, started, device.start_to_end(), id)?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn on_host_call(&mut self, call: &HostCallRecord<'_>) -> ShimResult<()> {
        if !self.call_logging {
            return Ok(());
        }
        let tid = i64::try_from(call.thread).unwrap_or(i64::MAX);
        let ts = call.start_ns.saturating_sub(self.start_ns);
        self.write_event(tid, call.name, ts, call.duration_ns, None)?;
        self.out.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> ShimResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceTimestamps;
    use crate::profiling::sinks::SharedBuffer;

    fn record(queue: usize, counter: u64) -> CompletionRecord {
        CompletionRecord {
            key: "gemm".to_string(),
            queue,
            enqueue_counter: counter,
            host_queued_ns: 11_000,
            device: DeviceTimestamps {
                queued: 1_000_000,
                submitted: 1_002_000,
                started: 1_005_000,
                ended: 1_015_000,
            },
            variant: None,
        }
    }

    /// Parse the unterminated array by closing it
    fn parse(buffer: &SharedBuffer) -> Vec<serde_json::Value> {
        let text = buffer.to_string_lossy();
        let body = text.trim_end().trim_end_matches(',');
        serde_json::from_str(&format!("{body}]")).unwrap()
    }

    #[test]
    fn test_complete_event_timing() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 1_000, false).unwrap();
        sink.on_completion(&record(0x40, 7)).unwrap();

        let events = parse(&buffer);
        let complete: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
        assert_eq!(complete.len(), 1);
        // (11000 - 1000 + 5000) ns = 15 us, duration 10 us
        assert_eq!(complete[0]["ts"], 15.0);
        assert_eq!(complete[0]["dur"], 10.0);
        assert_eq!(complete[0]["tid"], -1);
        assert_eq!(complete[0]["args"]["id"], 7);
    }

    #[test]
    fn test_queue_metadata_written_once_per_queue() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 0, false).unwrap();
        sink.on_completion(&record(0x40, 1)).unwrap();
        sink.on_completion(&record(0x40, 2)).unwrap();
        sink.on_completion(&record(0x80, 3)).unwrap();

        let events = parse(&buffer);
        let names: Vec<_> = events
            .iter()
            .filter(|e| e["name"] == "thread_name")
            .map(|e| e["tid"].as_i64().unwrap())
            .collect();
        assert_eq!(names, vec![-1, -2]);
        assert_eq!(sink.events_written(), 3);
    }

    #[test]
    fn test_stage_events() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 1_000, true).unwrap();
        sink.on_completion(&record(0x40, 1)).unwrap();

        let events = parse(&buffer);
        let complete: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
        assert_eq!(complete.len(), 3);
        assert_eq!(complete[0]["name"], "gemm (Queued)");
        assert_eq!(complete[0]["ts"], 10.0);
        assert_eq!(complete[0]["dur"], 2.0);
        assert_eq!(complete[1]["name"], "gemm (Submitted)");
        assert_eq!(complete[1]["ts"], 12.0);
        assert_eq!(complete[2]["name"], "gemm");
        assert_eq!(complete[2]["ts"], 15.0);
        assert_eq!(complete[2]["dur"], 10.0);
    }

    #[test]
    fn test_host_calls_on_thread_track() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 1_000, false)
            .unwrap()
            .with_call_logging(true);
        let call = HostCallRecord {
            name: "clEnqueueNDRangeKernel",
            thread: 3,
            start_ns: 3_000,
            duration_ns: 1_500,
        };
        sink.on_host_call(&call).unwrap();
        sink.on_completion(&record(0x40, 1)).unwrap();

        let events = parse(&buffer);
        let complete: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0]["name"], "clEnqueueNDRangeKernel");
        assert_eq!(complete[0]["tid"], 3);
        assert_eq!(complete[0]["ts"], 2.0);
        assert_eq!(complete[0]["dur"], 1.5);
        assert!(complete[0].get("args").is_none());
        assert_eq!(complete[1]["tid"], -1);
    }

    #[test]
    fn test_host_calls_ignored_without_call_logging() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 0, false).unwrap();
        let call = HostCallRecord {
            name: "clFinish",
            thread: 1,
            start_ns: 10,
            duration_ns: 10,
        };
        sink.on_host_call(&call).unwrap();
        assert_eq!(sink.events_written(), 0);
    }

    #[test]
    fn test_earlier_entries_are_never_rewritten() {
        let buffer = SharedBuffer::new();
        let mut sink = TimelineSink::new(Box::new(buffer.clone()), 0, false).unwrap();
        sink.on_completion(&record(0x40, 1)).unwrap();
        let before = buffer.contents();
        sink.on_completion(&record(0x40, 2)).unwrap();
        let after = buffer.contents();
        assert!(after.starts_with(&before));
    }
}
