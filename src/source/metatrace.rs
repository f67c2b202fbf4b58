//! Producer self-tracing data source.
//!
//! Records the producer's own activity so traces can explain themselves.
//! The stop path gives this source one last empty flush so the flushes of
//! its peers land in the trace before it goes away.

use std::any::Any;

use crate::config::DataSourceConfig;
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.metatrace",
    handles_incremental_state: false,
    fill_descriptor: None,
};

/// Buffers producer-side diagnostic events, emitted at flush time.
pub struct MetatraceDataSource {
    writer: Box<dyn TraceWriter>,
    events: Vec<String>,
}

impl MetatraceDataSource {
    pub fn new(writer: Box<dyn TraceWriter>) -> Self {
        Self {
            writer,
            events: Vec::new(),
        }
    }

    /// Record one producer-side event.
    pub fn record(&mut self, event: &str) {
        self.events.push(event.to_string());
    }
}

impl DataSource for MetatraceDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        self.writer.write_packet(b"metatrace: enabled");
    }

    fn flush(&mut self, flush_id: FlushId, done: FlushDoneFn) {
        for event in self.events.drain(..) {
            let packet = format!("metatrace: {event}");
            self.writer.write_packet(packet.as_bytes());
        }
        let marker = format!("metatrace: flush id={flush_id}");
        self.writer.write_packet(marker.as_bytes());
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
    Some(Box::new(MetatraceDataSource::new(writer)))
}
