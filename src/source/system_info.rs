//! One-shot host description data source.

use std::any::Any;

use crate::config::DataSourceConfig;
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.system_info",
    handles_incremental_state: false,
    fill_descriptor: None,
};

/// Emits a single host-description packet when the session starts.
pub struct SystemInfoDataSource {
    writer: Box<dyn TraceWriter>,
}

impl SystemInfoDataSource {
    pub fn new(writer: Box<dyn TraceWriter>) -> Self {
        Self { writer }
    }
}

impl DataSource for SystemInfoDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        let kernel = std::fs::read_to_string("/proc/version")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);

        let packet = format!(
            "system_info: os={} arch={} cpus={cpus} kernel={kernel}",
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        self.writer.write_packet(packet.as_bytes());
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
    Some(Box::new(SystemInfoDataSource::new(writer)))
}
