//! Process command-line and stats scraping data source.

use std::any::Any;
use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::config::{DataSourceConfig, ProcessStatsSourceConfig};
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.process_stats",
    handles_incremental_state: true,
    fill_descriptor: None,
};

/// Dumps process details into the trace, either for every process at start
/// or on demand as peer data sources report fresh pids.
///
/// The seen-pid cache is the source's incremental state: a pid is dumped at
/// most once until the cache is rewound or the pid is invalidated by a
/// rename.
pub struct ProcessStatsDataSource {
    writer: Box<dyn TraceWriter>,
    on_demand_dumps: bool,
    scan_all_on_start: bool,
    seen_pids: HashSet<i32>,
}

impl ProcessStatsDataSource {
    pub fn new(config: ProcessStatsSourceConfig, writer: Box<dyn TraceWriter>) -> Self {
        Self {
            writer,
            on_demand_dumps: config.on_demand_dumps,
            scan_all_on_start: config.scan_all_on_start,
            seen_pids: HashSet::new(),
        }
    }

    pub fn on_demand_dumps_enabled(&self) -> bool {
        self.on_demand_dumps
    }

    /// Peer-reported renamed pids. A renamed process must be re-scraped:
    /// forget it, then dump the fresh command line right away.
    pub fn on_rename_pids(&mut self, pids: &BTreeSet<i32>) {
        for pid in pids {
            self.seen_pids.remove(pid);
        }
        for &pid in pids {
            self.dump_process(pid);
        }
    }

    /// Peer-reported freshly seen pids. Already-dumped pids are skipped.
    pub fn on_pids(&mut self, pids: &BTreeSet<i32>) {
        for &pid in pids {
            if !self.seen_pids.contains(&pid) {
                self.dump_process(pid);
            }
        }
    }

    fn dump_process(&mut self, pid: i32) {
        self.seen_pids.insert(pid);
        let cmdline = read_cmdline(pid).unwrap_or_default();
        let packet = format!("process_tree: pid={pid} cmdline={cmdline}");
        self.writer.write_packet(packet.as_bytes());
    }
}

impl DataSource for ProcessStatsDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        if !self.scan_all_on_start {
            return;
        }

        let pids = scan_all_pids();
        debug!(count = pids.len(), "process stats full scan");
        for pid in pids {
            self.dump_process(pid);
        }
    }

    fn flush(&mut self, _flush_id: FlushId, done: FlushDoneFn) {
        self.writer.flush(Some(done));
    }

    fn clear_incremental_state(&mut self) {
        self.seen_pids.clear();
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
    Some(Box::new(ProcessStatsDataSource::new(
        config.process_stats.clone(),
        writer,
    )))
}

#[cfg(target_os = "linux")]
fn read_cmdline(pid: i32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let joined = raw
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined)
}

#[cfg(not(target_os = "linux"))]
fn read_cmdline(_pid: i32) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn scan_all_pids() -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn scan_all_pids() -> Vec<i32> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct RecordingWriter {
        packets: Arc<Mutex<Vec<String>>>,
    }

    impl TraceWriter for RecordingWriter {
        fn write_packet(&mut self, payload: &[u8]) {
            self.packets
                .lock()
                .push(String::from_utf8_lossy(payload).into_owned());
        }

        fn flush(&mut self, done: Option<Box<dyn FnOnce() + Send>>) {
            if let Some(done) = done {
                done();
            }
        }
    }

    fn test_source(packets: &Arc<Mutex<Vec<String>>>) -> ProcessStatsDataSource {
        ProcessStatsDataSource::new(
            ProcessStatsSourceConfig::default(),
            Box::new(RecordingWriter {
                packets: Arc::clone(packets),
            }),
        )
    }

    fn dumped_pids(packets: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        packets
            .lock()
            .iter()
            .filter_map(|p| p.split("pid=").nth(1))
            .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn test_on_pids_dumps_each_pid_once() {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut ds = test_source(&packets);

        ds.on_pids(&BTreeSet::from([100, 101]));
        ds.on_pids(&BTreeSet::from([100, 102]));

        assert_eq!(dumped_pids(&packets), vec!["100", "101", "102"]);
    }

    #[test]
    fn test_rename_invalidates_seen_pid() {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut ds = test_source(&packets);

        ds.on_pids(&BTreeSet::from([100]));
        ds.on_rename_pids(&BTreeSet::from([100]));

        // Renamed pid re-dumped; the cache holds it again afterwards.
        assert_eq!(dumped_pids(&packets), vec!["100", "100"]);
        ds.on_pids(&BTreeSet::from([100]));
        assert_eq!(packets.lock().len(), 2);
    }

    #[test]
    fn test_clear_incremental_state_rewinds_cache() {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut ds = test_source(&packets);

        ds.on_pids(&BTreeSet::from([100]));
        ds.clear_incremental_state();
        ds.on_pids(&BTreeSet::from([100]));

        assert_eq!(dumped_pids(&packets), vec!["100", "100"]);
    }
}
