//! Inode-to-path resolution data source.
//!
//! Resolves the `(inode, device)` pairs observed by ftrace into file paths.
//! The `/system` tree is walked exactly once per process; the resulting map
//! is shared by every inode data source.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::DataSourceConfig;
use crate::service::{DataSourceRegistration, FlushId, SessionId, TraceWriter};

use super::{DataSource, Descriptor, FactoryCtx, FlushDoneFn};

/// Root walked once per process to seed the static inode map.
pub const SYSTEM_SCAN_ROOT: &str = "/system";

pub static DESCRIPTOR: Descriptor = Descriptor {
    name: "linux.inode_file_map",
    handles_incremental_state: false,
    fill_descriptor: Some(fill_descriptor),
};

fn fill_descriptor(desc: &mut DataSourceRegistration) {
    desc.details
        .insert("scan_root".to_string(), SYSTEM_SCAN_ROOT.to_string());
}

/// Device-keyed inode-to-path map.
#[derive(Debug, Default)]
pub struct InodeMap {
    by_device: HashMap<u64, HashMap<u64, PathBuf>>,
}

impl InodeMap {
    /// Walk `root` and index every regular file by `(device, inode)`.
    ///
    /// Unreadable subtrees are skipped; a missing root yields an empty map.
    pub fn scan(root: &Path) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        let mut map = Self::default();

        #[cfg(unix)]
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            map.by_device
                .entry(meta.dev())
                .or_default()
                .insert(meta.ino(), entry.into_path());
        }

        #[cfg(not(unix))]
        let _ = WalkDir::new(root);

        map
    }

    pub fn resolve(&self, device: u64, inode: u64) -> Option<&Path> {
        self.by_device
            .get(&device)?
            .get(&inode)
            .map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_device.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }
}

/// Emits one map-entry packet per resolved (or unresolved) inode pair.
pub struct InodeFileDataSource {
    writer: Box<dyn TraceWriter>,
    system_inodes: Arc<InodeMap>,
    extra_inodes: InodeMap,
}

impl InodeFileDataSource {
    pub fn new(
        writer: Box<dyn TraceWriter>,
        system_inodes: Arc<InodeMap>,
        extra_inodes: InodeMap,
    ) -> Self {
        Self {
            writer,
            system_inodes,
            extra_inodes,
        }
    }

    /// Peer-reported `(inode, device)` pairs fresh from the kernel.
    pub fn on_inodes(&mut self, pairs: &BTreeSet<(u64, u64)>) {
        for &(inode, device) in pairs {
            let resolved = self
                .system_inodes
                .resolve(device, inode)
                .or_else(|| self.extra_inodes.resolve(device, inode));

            let packet = match resolved {
                Some(path) => format!(
                    "inode_map_entry: device={device} inode={inode} path={}",
                    path.display(),
                ),
                None => format!("inode_map_entry: device={device} inode={inode} unresolved"),
            };
            self.writer.write_packet(packet.as_bytes());
        }
    }
}

impl DataSource for InodeFileDataSource {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn start(&mut self) {
        let marker = format!("inode_map_start: system_entries={}", self.system_inodes.len());
        self.writer.write_packet(marker.as_bytes());
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
    debug!(target_buffer = config.target_buffer, "inode file map setup");

    // Built once per process, then shared across instances and sessions.
    if ctx.system_inodes.is_none() {
        let map = InodeMap::scan(Path::new(SYSTEM_SCAN_ROOT));
        debug!(entries = map.len(), "seeded system inode map");
        *ctx.system_inodes = Some(Arc::new(map));
    }
    let system_inodes = Arc::clone(ctx.system_inodes.as_ref()?);

    let mut extra_inodes = InodeMap::default();
    for mount in &config.inode_file.scan_mount_points {
        let scanned = InodeMap::scan(Path::new(mount));
        for (device, inodes) in scanned.by_device {
            extra_inodes.by_device.entry(device).or_default().extend(inodes);
        }
    }

    let writer = ctx.endpoint.create_trace_writer(config.target_buffer);
    Some(Box::new(InodeFileDataSource::new(
        writer,
        system_inodes,
        extra_inodes,
    )))
}

#[cfg(test)]
mod tests {
    use std::fs;
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

    #[test]
    fn test_scan_indexes_regular_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.so"), b"x").expect("file");
        fs::create_dir(dir.path().join("sub")).expect("dir");
        fs::write(dir.path().join("sub/b.so"), b"y").expect("file");

        let map = InodeMap::scan(dir.path());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let map = InodeMap::scan(Path::new("/nonexistent/probekit-test"));
        assert!(map.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_by_device_and_inode() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("lib.so");
        fs::write(&file, b"x").expect("file");
        let meta = fs::metadata(&file).expect("metadata");

        let map = InodeMap::scan(dir.path());
        let path = map.resolve(meta.dev(), meta.ino()).expect("resolved");
        assert_eq!(path, file.as_path());
        assert!(map.resolve(meta.dev(), meta.ino() + 1).is_none());
    }

    #[test]
    fn test_on_inodes_emits_one_packet_per_pair() {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut ds = InodeFileDataSource::new(
            Box::new(RecordingWriter {
                packets: Arc::clone(&packets),
            }),
            Arc::new(InodeMap::default()),
            InodeMap::default(),
        );

        ds.on_inodes(&BTreeSet::from([(9, 42), (10, 42)]));

        let packets = packets.lock();
        assert_eq!(packets.len(), 2);
        assert!(packets[0].contains("device=42 inode=9"));
        assert!(packets[0].contains("unresolved"));
    }
}
