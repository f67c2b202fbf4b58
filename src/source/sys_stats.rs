//! System-wide counters data source (/proc/stat, /proc/meminfo).

use std::any::Any;

use crate::config::DataSourceConfig;
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.sys_stats",
    handles_incremental_state: false,
    fill_descriptor: None,
};

/// Snapshots system-wide counters when the session starts.
pub struct SysStatsDataSource {
    writer: Box<dyn TraceWriter>,
}

impl SysStatsDataSource {
    pub fn new(writer: Box<dyn TraceWriter>) -> Self {
        Self { writer }
    }
}

impl DataSource for SysStatsDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        let cpu = read_first_line("/proc/stat").unwrap_or_default();
        let packet = format!("sys_stats: {cpu}");
        self.writer.write_packet(packet.as_bytes());

        for key in ["MemTotal", "MemFree", "MemAvailable"] {
            if let Some(value) = read_meminfo_field(key) {
                let packet = format!("sys_stats: {key}={value}");
                self.writer.write_packet(packet.as_bytes());
            }
        }
    }

    fn flush(&mut self, _flush_id: FlushId, done: FlushDoneFn) {
        self.writer.flush(Some(done));
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn create(
    ctx: &mut FactoryCtx<'_>,
    _session_id: SessionId,
    config: &DataSourceConfig,
) -> Option<Box<dyn DataSource>> {
    let writer = ctx.endpoint.create_trace_writer(config.target_buffer);
    Some(Box::new(SysStatsDataSource::new(writer)))
}

fn read_first_line(path: &str) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.lines().next().map(str::to_string)
}

fn read_meminfo_field(key: &str) -> Option<String> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    raw.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}
