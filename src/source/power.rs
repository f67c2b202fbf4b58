//! Battery and power-supply counters data source (sysfs).

use std::any::Any;
use std::path::Path;

use crate::config::DataSourceConfig;
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

/// Sysfs tree enumerating power supplies.
const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.power_sysfs",
    handles_incremental_state: false,
    fill_descriptor: None,
};

/// Snapshots battery capacity and charge counters when the session starts.
pub struct PowerDataSource {
    writer: Box<dyn TraceWriter>,
}

impl PowerDataSource {
    pub fn new(writer: Box<dyn TraceWriter>) -> Self {
        Self { writer }
    }
}

impl DataSource for PowerDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        for supply in list_power_supplies() {
            let root = Path::new(POWER_SUPPLY_ROOT).join(&supply);
            let capacity = read_trimmed(&root.join("capacity")).unwrap_or_default();
            let status = read_trimmed(&root.join("status")).unwrap_or_default();
            let packet =
                format!("power_supply: name={supply} capacity={capacity} status={status}");
            self.writer.write_packet(packet.as_bytes());
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
    Some(Box::new(PowerDataSource::new(writer)))
}

fn list_power_supplies() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(POWER_SUPPLY_ROOT) else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect()
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}
