//! Kernel ftrace controller and the ftrace data source.
//!
//! The controller owns the tracefs instance and is shared by every ftrace
//! data source; it is created lazily on the first setup request and must
//! outlive all of its data sources. The page reader that drains the kernel
//! ring buffer lives outside this crate and reports drained batches through
//! [`FtraceController::notify_batch_drained`].

use std::any::Any;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{DataSourceConfig, FtraceSourceConfig};
use crate::service::{FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

/// Upper bound on one kernel flush round. The producer-level flush timeout
/// must stay above this.
pub const CONTROLLER_FLUSH_TIMEOUT_MS: u64 = 500;

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.ftrace",
    handles_incremental_state: false,
    fill_descriptor: None,
};

/// Observer invoked after each batch of kernel pages has been drained into
/// the per-session trace buffers.
pub type BatchObserver = Box<dyn Fn() + Send + Sync>;

/// Metadata scraped from drained ftrace events, handed to peer data
/// sources in the same session. Inode pairs are `(inode, device)`.
#[derive(Debug, Default)]
pub struct FtraceMetadata {
    pub pids: BTreeSet<i32>,
    pub rename_pids: BTreeSet<i32>,
    pub inode_and_device: BTreeSet<(u64, u64)>,
}

impl FtraceMetadata {
    pub fn add_pid(&mut self, pid: i32) {
        self.pids.insert(pid);
    }

    pub fn add_rename_pid(&mut self, pid: i32) {
        self.rename_pids.insert(pid);
    }

    pub fn add_inode(&mut self, inode: u64, device: u64) {
        self.inode_and_device.insert((inode, device));
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.rename_pids.is_empty() && self.inode_and_device.is_empty()
    }

    pub fn clear(&mut self) {
        self.pids.clear();
        self.rename_pids.clear();
        self.inode_and_device.clear();
    }
}

/// Owns the kernel tracefs instance.
pub struct FtraceController {
    tracefs_root: PathBuf,
    inner: Mutex<ControllerInner>,
}

struct ControllerInner {
    active_sources: usize,
    enabled_events: BTreeSet<String>,
    batch_observer: Option<BatchObserver>,
}

impl FtraceController {
    /// Probe the kernel tracefs mount and take control of it.
    ///
    /// Fails when no mount is accessible (e.g. restricted builds); callers
    /// treat that failure as sticky for the process lifetime.
    pub fn create() -> Result<Arc<Self>> {
        Self::create_at(Self::probe_tracefs_root()?)
    }

    /// Take control of a tracefs instance mounted at `root`.
    pub fn create_at(root: PathBuf) -> Result<Arc<Self>> {
        let controller = Arc::new(Self {
            tracefs_root: root,
            inner: Mutex::new(ControllerInner {
                active_sources: 0,
                enabled_events: BTreeSet::new(),
                batch_observer: None,
            }),
        });

        // Start from a clean slate: no stale events, no stale data.
        controller
            .disable_all_events()
            .context("disabling inherited ftrace events")?;
        controller.clear_trace().context("clearing stale ftrace data")?;

        Ok(controller)
    }

    fn probe_tracefs_root() -> Result<PathBuf> {
        const CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

        for candidate in CANDIDATES {
            let path = Path::new(candidate);
            if path.join("trace").exists() {
                return Ok(path.to_path_buf());
            }
        }
        bail!("tracefs is not mounted or not accessible");
    }

    fn disable_all_events(&self) -> Result<()> {
        self.write_tracefs("events/enable", "0")
    }

    fn clear_trace(&self) -> Result<()> {
        self.write_tracefs("trace", "")
    }

    fn write_tracefs(&self, rel: &str, value: &str) -> Result<()> {
        let path = self.tracefs_root.join(rel);
        std::fs::write(&path, value).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Install the observer notified after each drained batch.
    pub fn set_batch_observer(&self, observer: BatchObserver) {
        self.inner.lock().batch_observer = Some(observer);
    }

    /// Account a new data source and enable its events.
    ///
    /// Returns false when the kernel rejects part of the event set.
    pub fn add_data_source(&self, config: &FtraceSourceConfig) -> bool {
        let mut inner = self.inner.lock();

        for event in &config.events {
            if !inner.enabled_events.insert(event.clone()) {
                continue; // already enabled by a peer source
            }
            let rel = format!("events/{event}/enable");
            if let Err(e) = self.write_tracefs(&rel, "1") {
                warn!(event = %event, error = %e, "failed to enable ftrace event");
                inner.enabled_events.remove(event);
                return false;
            }
        }

        inner.active_sources += 1;
        true
    }

    /// Drop one data source's registration. Disables all events once the
    /// last source detaches.
    pub fn remove_data_source(&self) {
        let mut inner = self.inner.lock();
        inner.active_sources = inner.active_sources.saturating_sub(1);
        if inner.active_sources > 0 {
            return;
        }

        inner.enabled_events.clear();
        drop(inner);
        if let Err(e) = self.disable_all_events() {
            warn!(error = %e, "failed to disable ftrace events");
        }
    }

    /// Number of data sources currently attached.
    pub fn active_sources(&self) -> usize {
        self.inner.lock().active_sources
    }

    /// Entry point for the external page reader: one batch of cpu pages
    /// has been drained into the per-session trace buffers.
    pub fn notify_batch_drained(&self) {
        let inner = self.inner.lock();
        if let Some(observer) = &inner.batch_observer {
            observer();
        }
    }
}

impl Drop for FtraceController {
    fn drop(&mut self) {
        debug_assert!(
            self.inner.get_mut().active_sources == 0,
            "ftrace data sources must be destroyed before the controller",
        );
    }
}

/// Streams kernel trace data for one session and accumulates cross-source
/// metadata while doing so.
pub struct FtraceDataSource {
    session_id: SessionId,
    config: FtraceSourceConfig,
    controller: Weak<FtraceController>,
    writer: Box<dyn TraceWriter>,
    metadata: FtraceMetadata,
}

impl FtraceDataSource {
    pub fn new(
        session_id: SessionId,
        config: FtraceSourceConfig,
        controller: Weak<FtraceController>,
        writer: Box<dyn TraceWriter>,
    ) -> Self {
        Self {
            session_id,
            config,
            controller,
            writer,
            metadata: FtraceMetadata::default(),
        }
    }

    /// Metadata accumulated since the last broadcast.
    pub fn metadata_mut(&mut self) -> &mut FtraceMetadata {
        &mut self.metadata
    }
}

impl DataSource for FtraceDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        let marker = format!(
            "ftrace_start: session={} events={}",
            self.session_id,
            self.config.events.len(),
        );
        self.writer.write_packet(marker.as_bytes());
    }

    fn flush(&mut self, _flush_id: FlushId, done: FlushDoneFn) {
        self.writer.flush(Some(done));
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for FtraceDataSource {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.remove_data_source();
        }
    }
}

/// Factory for [`FtraceDataSource`].
///
/// The controller is created lazily on the first request and shared with
/// later instances. Once its creation has failed, every subsequent request
/// refuses without re-probing restricted paths.
pub(crate) fn create(
    ctx: &mut FactoryCtx<'_>,
    session_id: SessionId,
    config: &DataSourceConfig,
) -> Option<Box<dyn DataSource>> {
    if *ctx.ftrace_creation_failed {
        return None;
    }

    if ctx.ftrace.is_none() {
        match FtraceController::create() {
            Ok(controller) => {
                // Route batch notifications through the task runner so the
                // metadata broadcast never interleaves with other work.
                let producer = ctx.producer.clone();
                let runner = Arc::clone(ctx.runner);
                controller.set_batch_observer(Box::new(move || {
                    let producer = producer.clone();
                    runner.post_task(Box::new(move || {
                        if let Some(producer) = producer.upgrade() {
                            producer.on_ftrace_batch_drained();
                        }
                    }));
                }));
                *ctx.ftrace = Some(controller);
            }
            Err(e) => {
                warn!(error = %e, "failed to create ftrace controller");
                *ctx.ftrace_creation_failed = true;
                return None;
            }
        }
    }

    let controller = ctx.ftrace.as_ref()?;
    debug!(target_buffer = config.target_buffer, "ftrace setup");

    if !controller.add_data_source(&config.ftrace) {
        warn!("failed to set up ftrace events");
        return None;
    }

    let writer = ctx.endpoint.create_trace_writer(config.target_buffer);
    Some(Box::new(FtraceDataSource::new(
        session_id,
        config.ftrace.clone(),
        Arc::downgrade(controller),
        writer,
    )))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// Lay out a fake tracefs root with the given event nodes.
    fn fake_tracefs(events: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("trace"), "").expect("trace file");
        fs::create_dir_all(dir.path().join("events")).expect("events dir");
        fs::write(dir.path().join("events/enable"), "1").expect("enable file");
        for event in events {
            let event_dir = dir.path().join("events").join(event);
            fs::create_dir_all(&event_dir).expect("event dir");
            fs::write(event_dir.join("enable"), "0").expect("event enable file");
        }
        dir
    }

    #[test]
    fn test_create_disables_inherited_events() {
        let root = fake_tracefs(&[]);
        let _controller =
            FtraceController::create_at(root.path().to_path_buf()).expect("controller");
        let enable = fs::read_to_string(root.path().join("events/enable")).expect("readable");
        assert_eq!(enable, "0");
    }

    #[test]
    fn test_create_fails_without_tracefs() {
        let dir = tempfile::tempdir().expect("tempdir");
        // No trace file, no events directory.
        assert!(FtraceController::create_at(dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_add_data_source_enables_events() {
        let root = fake_tracefs(&["sched/sched_switch", "sched/sched_process_exit"]);
        let controller =
            FtraceController::create_at(root.path().to_path_buf()).expect("controller");

        let config = FtraceSourceConfig {
            events: vec![
                "sched/sched_switch".to_string(),
                "sched/sched_process_exit".to_string(),
            ],
            buffer_size_kb: 0,
        };
        assert!(controller.add_data_source(&config));
        assert_eq!(controller.active_sources(), 1);

        let enabled =
            fs::read_to_string(root.path().join("events/sched/sched_switch/enable")).unwrap();
        assert_eq!(enabled, "1");

        controller.remove_data_source();
    }

    #[test]
    fn test_add_data_source_rejects_unknown_event() {
        let root = fake_tracefs(&[]);
        let controller =
            FtraceController::create_at(root.path().to_path_buf()).expect("controller");

        let config = FtraceSourceConfig {
            events: vec!["nonexistent/event".to_string()],
            buffer_size_kb: 0,
        };
        assert!(!controller.add_data_source(&config));
        assert_eq!(controller.active_sources(), 0);
    }

    #[test]
    fn test_last_source_removal_disables_events() {
        let root = fake_tracefs(&["sched/sched_switch"]);
        let controller =
            FtraceController::create_at(root.path().to_path_buf()).expect("controller");

        let config = FtraceSourceConfig {
            events: vec!["sched/sched_switch".to_string()],
            buffer_size_kb: 0,
        };
        assert!(controller.add_data_source(&config));
        assert!(controller.add_data_source(&config));
        assert_eq!(controller.active_sources(), 2);

        controller.remove_data_source();
        assert_eq!(controller.active_sources(), 1);

        controller.remove_data_source();
        assert_eq!(controller.active_sources(), 0);
        let enable = fs::read_to_string(root.path().join("events/enable")).expect("readable");
        assert_eq!(enable, "0");
    }

    #[test]
    fn test_metadata_accumulates_and_clears() {
        let mut metadata = FtraceMetadata::default();
        assert!(metadata.is_empty());

        metadata.add_pid(100);
        metadata.add_pid(100);
        metadata.add_rename_pid(100);
        metadata.add_inode(9, 42);

        assert_eq!(metadata.pids.len(), 1);
        assert_eq!(metadata.rename_pids.len(), 1);
        assert!(metadata.inode_and_device.contains(&(9, 42)));

        metadata.clear();
        assert!(metadata.is_empty());
    }
}
