//! Producer lifecycle and session orchestration.
//!
//! One [`Producer`] incarnation spans a single connection to the tracing
//! service: it registers the data-source catalogue on connect, instantiates
//! and drives per-session instances, coordinates flush fan-out, and
//! broadcasts ftrace metadata to peer sources. Losing an established
//! connection tears the whole incarnation down; the owning
//! [`ProducerHandle`] then builds a fresh one, which guarantees no stale
//! per-session state survives a service restart.

mod stats;

pub use stats::TriggerStats;

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, DataSourceConfig};
use crate::runner::{Task, TaskRunner};
use crate::service::{
    ConnectArgs, FlushId, InstanceId, ServiceEndpoint, ServiceTransport, SessionId,
    SmbScrapingMode, PRODUCER_NAME,
};
use crate::source::ftrace::{self, FtraceController, FtraceDataSource};
use crate::source::inode_file::{InodeFileDataSource, InodeMap};
use crate::source::process_stats::ProcessStatsDataSource;
use crate::source::{
    metatrace, DataSource, DescriptorKey, FactoryCtx, FlushDoneFn, ALL_DATA_SOURCES,
};
use crate::watchdog::{Watchdog, DEFAULT_MEMORY_SLACK_BYTES, DEFAULT_MEMORY_WINDOW_MS};

const INITIAL_CONNECTION_BACKOFF_MS: u64 = 100;
const MAX_CONNECTION_BACKOFF_MS: u64 = 30_000;

/// How long a flush round may stay unacknowledged before it is forced to
/// completion.
const FLUSH_TIMEOUT_MS: u64 = 1000;

// The producer timeout has to outlast a full kernel flush round.
const _: () = assert!(FLUSH_TIMEOUT_MS > ftrace::CONTROLLER_FLUSH_TIMEOUT_MS);

// State transition diagram:
//                    +----------------------------+
//                    v                            +
// NotStarted -> NotConnected -> Connecting -> Connected
//                    ^              +
//                    +--------------+
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    NotStarted,
    NotConnected,
    Connecting,
    Connected,
}

/// One live data-source instance and its lifecycle flag.
struct Instance {
    session_id: SessionId,
    started: bool,
    source: Box<dyn DataSource>,
}

#[derive(Debug, Clone)]
struct ConnectSettings {
    socket_name: String,
    shm_size_hint_bytes: usize,
    shm_page_size_hint_bytes: usize,
}

impl ConnectSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            socket_name: config.socket.clone(),
            shm_size_hint_bytes: config.shm_size_hint_bytes,
            shm_page_size_hint_bytes: config.shm_page_size_hint_bytes,
        }
    }
}

struct State {
    connection: ConnectionState,
    backoff_ms: u64,
    endpoint: Option<Arc<dyn ServiceEndpoint>>,

    // Owning index. Declared before `ftrace` so instances drop before the
    // controller they may reference.
    instances: HashMap<InstanceId, Instance>,
    /// Secondary per-session view; stores ids, not references.
    session_index: HashMap<SessionId, Vec<(DescriptorKey, InstanceId)>>,

    /// Outstanding flush acknowledgements as (flush, instance) pairs.
    pending_flushes: Vec<(FlushId, InstanceId)>,
    fatal_timers: HashMap<InstanceId, crate::watchdog::FatalTimer>,

    ftrace: Option<Arc<FtraceController>>,
    /// Once the ftrace controller has failed to initialise, never re-probe.
    ftrace_creation_failed: bool,
    system_inodes: Option<Arc<InodeMap>>,

    all_registered_cb: Option<Task>,
}

impl State {
    fn new() -> Self {
        Self {
            connection: ConnectionState::NotStarted,
            backoff_ms: INITIAL_CONNECTION_BACKOFF_MS,
            endpoint: None,
            instances: HashMap::new(),
            session_index: HashMap::new(),
            pending_flushes: Vec::new(),
            fatal_timers: HashMap::new(),
            ftrace: None,
            ftrace_creation_failed: false,
            system_inodes: None,
            all_registered_cb: None,
        }
    }
}

/// One incarnation of the tracing producer.
///
/// All service callbacks must be delivered through the task runner the
/// producer was built with; they never interleave.
pub struct Producer {
    state: Mutex<State>,
    runner: Arc<dyn TaskRunner>,
    transport: Arc<dyn ServiceTransport>,
    settings: ConnectSettings,
    stats: TriggerStats,
    restart: Weak<HandleInner>,
    weak_self: Weak<Producer>,
}

impl Producer {
    fn new(
        transport: Arc<dyn ServiceTransport>,
        runner: Arc<dyn TaskRunner>,
        settings: ConnectSettings,
        restart: Weak<HandleInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Producer {
            state: Mutex::new(State::new()),
            runner,
            transport,
            settings,
            stats: TriggerStats::new(),
            restart,
            weak_self: weak_self.clone(),
        })
    }

    /// Begin connecting. Invocable only once per incarnation.
    fn connect_with_retries(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.connection,
            ConnectionState::NotStarted,
            "connect_with_retries is a one-shot transition",
        );
        state.connection = ConnectionState::NotConnected;
        state.backoff_ms = INITIAL_CONNECTION_BACKOFF_MS;
        self.connect_locked(&mut state);
    }

    fn connect_locked(&self, state: &mut State) {
        debug_assert_eq!(state.connection, ConnectionState::NotConnected);
        state.connection = ConnectionState::Connecting;

        let args = ConnectArgs {
            socket_name: self.settings.socket_name.clone(),
            producer_name: PRODUCER_NAME.to_string(),
            scraping_mode: SmbScrapingMode::Disabled,
            shm_size_hint_bytes: self.settings.shm_size_hint_bytes,
            shm_page_size_hint_bytes: self.settings.shm_page_size_hint_bytes,
        };
        state.endpoint = Some(self.transport.connect(args, self.weak_self.clone()));
    }

    fn connect(&self) {
        let mut state = self.state.lock();
        if state.connection != ConnectionState::NotConnected {
            return;
        }
        self.connect_locked(&mut state);
    }

    /// Whether the service connection is established.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connection == ConnectionState::Connected
    }

    /// Trigger forwarding telemetry.
    pub fn trigger_stats(&self) -> &TriggerStats {
        &self.stats
    }

    /// Install a one-shot callback that fires once every data source is
    /// durably registered at the service side. Used by integration
    /// harnesses to synchronize with producer startup.
    pub fn set_all_data_sources_registered_callback(&self, callback: Task) {
        self.state.lock().all_registered_cb = Some(callback);
    }

    /// Service callback: the connection is established.
    pub fn on_connect(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.connection, ConnectionState::Connecting);
        state.connection = ConnectionState::Connected;
        state.backoff_ms = INITIAL_CONNECTION_BACKOFF_MS;
        info!("connected to the tracing service");

        // Generate every descriptor message before registering any of
        // them: if one kind is slow to describe itself, a partially
        // registered catalogue must not be observable.
        let descriptors: Vec<_> = ALL_DATA_SOURCES
            .iter()
            .map(|source| source.descriptor.registration())
            .collect();

        let Some(endpoint) = state.endpoint.clone() else {
            return;
        };
        for descriptor in &descriptors {
            endpoint.register_data_source(descriptor);
        }

        if let Some(callback) = state.all_registered_cb.take() {
            endpoint.sync(callback);
        }
    }

    /// Service callback: the connection is gone.
    pub fn on_disconnect(&self) {
        let mut state = self.state.lock();
        debug_assert!(matches!(
            state.connection,
            ConnectionState::Connected | ConnectionState::Connecting
        ));
        info!("disconnected from the tracing service");

        if state.connection == ConnectionState::Connected {
            // An established producer has live per-session state; rebuild
            // from scratch rather than trying to unwind it piecemeal.
            drop(state);
            let restart = self.restart.clone();
            self.runner.post_task(Box::new(move || {
                if let Some(inner) = restart.upgrade() {
                    ProducerHandle { inner }.respawn();
                }
            }));
            return;
        }

        state.connection = ConnectionState::NotConnected;
        state.endpoint = None;

        let delay = state.backoff_ms;
        state.backoff_ms = (state.backoff_ms * 2).min(MAX_CONNECTION_BACKOFF_MS);

        let weak = self.weak_self.clone();
        self.runner.post_delayed_task(
            Box::new(move || {
                if let Some(producer) = weak.upgrade() {
                    producer.connect();
                }
            }),
            Duration::from_millis(delay),
        );
    }

    /// Service callback: shared memory is mapped and tracing can begin.
    pub fn on_tracing_setup(&self) {
        let endpoint = self.state.lock().endpoint.clone();
        let Some(endpoint) = endpoint else {
            return;
        };

        if let Some(shm_size) = endpoint.shared_memory_size() {
            Watchdog::instance().set_memory_limit(
                shm_size as u64 + DEFAULT_MEMORY_SLACK_BYTES,
                DEFAULT_MEMORY_WINDOW_MS,
            );
        }
    }

    /// Service callback: create an instance for the given config.
    ///
    /// Factory refusal is logged and swallowed; the service never hears
    /// about it and a later Start on the same id is a silent no-op.
    pub fn setup_data_source(&self, instance_id: InstanceId, config: &DataSourceConfig) {
        debug!(id = instance_id, name = %config.name, "setup data source");

        let mut state = self.state.lock();
        debug_assert!(
            !state.instances.contains_key(&instance_id),
            "duplicate setup for data source instance",
        );

        let session_id = config.tracing_session_id;
        assert!(session_id > 0, "setup without a tracing session");

        let Some(endpoint) = state.endpoint.clone() else {
            warn!(id = instance_id, "setup while disconnected");
            return;
        };

        let source = {
            let state = &mut *state;
            let mut ctx = FactoryCtx {
                runner: &self.runner,
                endpoint: &endpoint,
                producer: &self.weak_self,
                ftrace: &mut state.ftrace,
                ftrace_creation_failed: &mut state.ftrace_creation_failed,
                system_inodes: &mut state.system_inodes,
            };
            crate::source::registered_source(&config.name)
                .and_then(|registered| (registered.factory)(&mut ctx, session_id, config))
        };

        let Some(source) = source else {
            warn!(name = %config.name, "failed to create data source");
            return;
        };

        let key = DescriptorKey::of(source.descriptor());
        state
            .session_index
            .entry(session_id)
            .or_default()
            .push((key, instance_id));
        state.instances.insert(
            instance_id,
            Instance {
                session_id,
                started: false,
                source,
            },
        );
    }

    /// Service callback: start a previously set-up instance.
    pub fn start_data_source(&self, instance_id: InstanceId, config: &DataSourceConfig) {
        debug!(id = instance_id, name = %config.name, "start data source");

        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(instance) = state.instances.get_mut(&instance_id) else {
            // Legitimate after a refused setup (e.g. ftrace was busy).
            warn!(id = instance_id, "start for unknown data source");
            return;
        };
        if instance.started {
            return;
        }

        if config.trace_duration_ms > 0 {
            let timeout_ms = 5000 + 2 * config.trace_duration_ms;
            state.fatal_timers.insert(
                instance_id,
                Watchdog::instance().create_fatal_timer(timeout_ms, "trace_didnt_stop"),
            );
        }

        instance.started = true;
        instance.source.start();
        if let Some(endpoint) = &state.endpoint {
            endpoint.notify_data_source_started(instance_id);
        }
    }

    /// Service callback: stop and destroy an instance.
    pub fn stop_data_source(&self, instance_id: InstanceId) {
        info!(id = instance_id, "stop data source");

        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(instance) = state.instances.get_mut(&instance_id) else {
            // Legitimate after a refused setup (e.g. ftrace was busy).
            warn!(id = instance_id, "stop for unknown data source");
            return;
        };

        // Metatrace special case: one last flush, so the flushes of the
        // other data sources are recorded before this instance goes away.
        if ptr::eq(instance.source.descriptor(), &metatrace::DESCRIPTOR) {
            instance.source.flush(0, Box::new(|| {}));
        }

        if let Some(endpoint) = &state.endpoint {
            endpoint.notify_data_source_stopped(instance_id);
        }

        let session_id = instance.session_id;
        let key = DescriptorKey::of(instance.source.descriptor());
        if let Some(entries) = state.session_index.get_mut(&session_id) {
            if let Some(pos) = entries
                .iter()
                .position(|&(entry_key, entry_id)| entry_key == key && entry_id == instance_id)
            {
                entries.remove(pos);
            }
            if entries.is_empty() {
                state.session_index.remove(&session_id);
            }
        }

        state.instances.remove(&instance_id);
        state.fatal_timers.remove(&instance_id);
    }

    /// Service callback: flush the given instances and report completion.
    pub fn flush(&self, flush_id: FlushId, instance_ids: &[InstanceId]) {
        debug_assert!(flush_id != 0);

        let mut state = self.state.lock();
        let state = &mut *state;
        let mut flush_queued = false;

        for &ds_id in instance_ids {
            let started = state
                .instances
                .get(&ds_id)
                .map(|instance| instance.started)
                .unwrap_or(false);
            if !started {
                continue;
            }

            state.pending_flushes.push((flush_id, ds_id));
            flush_queued = true;

            let done = self.flush_ack_callback(flush_id, ds_id);
            if let Some(instance) = state.instances.get_mut(&ds_id) {
                instance.source.flush(flush_id, done);
            }
        }

        // Nothing to wait for: ack immediately.
        if !flush_queued {
            if let Some(endpoint) = &state.endpoint {
                endpoint.notify_flush_complete(flush_id);
            }
            return;
        }

        let weak = self.weak_self.clone();
        self.runner.post_delayed_task(
            Box::new(move || {
                if let Some(producer) = weak.upgrade() {
                    producer.on_flush_timeout(flush_id);
                }
            }),
            Duration::from_millis(FLUSH_TIMEOUT_MS),
        );
    }

    /// Builds the per-instance ack callback handed to `DataSource::flush`.
    ///
    /// The callback holds a weak producer reference, so acks delivered
    /// after a restart die silently. It re-enters through the task runner
    /// because sources may ack synchronously, while the producer lock is
    /// still held.
    fn flush_ack_callback(&self, flush_id: FlushId, ds_id: InstanceId) -> FlushDoneFn {
        let weak = self.weak_self.clone();
        let runner = Arc::clone(&self.runner);
        Box::new(move || {
            runner.post_task(Box::new(move || {
                if let Some(producer) = weak.upgrade() {
                    producer.on_data_source_flush_complete(flush_id, ds_id);
                }
            }));
        })
    }

    /// One instance acknowledged a flush round.
    ///
    /// Removes exactly one matching pair; acks with no matching entry
    /// (late, after a timeout) are ignored. The service is notified once,
    /// when the last pair for the flush id goes.
    pub fn on_data_source_flush_complete(&self, flush_id: FlushId, ds_id: InstanceId) {
        debug!(flush_id, id = ds_id, "flush acked");

        let mut state = self.state.lock();
        let Some(pos) = state
            .pending_flushes
            .iter()
            .position(|&(pending_flush, pending_ds)| {
                pending_flush == flush_id && pending_ds == ds_id
            })
        else {
            return;
        };
        state.pending_flushes.remove(pos);

        if state
            .pending_flushes
            .iter()
            .any(|&(pending_flush, _)| pending_flush == flush_id)
        {
            return; // Still waiting for other data sources to ack.
        }

        debug!(flush_id, "all data sources acked");
        if let Some(endpoint) = &state.endpoint {
            endpoint.notify_flush_complete(flush_id);
        }
    }

    /// Force-complete a flush round whose acks did not arrive in time.
    pub fn on_flush_timeout(&self, flush_id: FlushId) {
        let mut state = self.state.lock();
        if !state
            .pending_flushes
            .iter()
            .any(|&(pending_flush, _)| pending_flush == flush_id)
        {
            return; // All acked.
        }

        warn!(flush_id, "flush timed out");
        state
            .pending_flushes
            .retain(|&(pending_flush, _)| pending_flush != flush_id);
        if let Some(endpoint) = &state.endpoint {
            endpoint.notify_flush_complete(flush_id);
        }
    }

    /// Service callback: rewind incremental state on started instances.
    pub fn clear_incremental_state(&self, instance_ids: &[InstanceId]) {
        let mut state = self.state.lock();
        for &ds_id in instance_ids {
            if let Some(instance) = state.instances.get_mut(&ds_id) {
                if instance.started {
                    instance.source.clear_incremental_state();
                }
            }
        }
    }

    /// Ask the service to activate a trigger.
    ///
    /// Posted onto the task runner; while disconnected the trigger is
    /// counted as dropped and discarded.
    pub fn activate_trigger(&self, trigger: String) {
        self.stats.record_requested();

        let weak = self.weak_self.clone();
        self.runner.post_task(Box::new(move || {
            let Some(producer) = weak.upgrade() else {
                return;
            };
            let endpoint = producer.state.lock().endpoint.clone();
            match endpoint {
                Some(endpoint) => endpoint.activate_triggers(&[trigger]),
                None => {
                    producer.stats.record_dropped();
                    warn!(trigger = %trigger, "trigger dropped while disconnected");
                }
            }
        }));
    }

    /// Invoked (via the task runner) by the ftrace controller after each
    /// batch of kernel pages has been drained into trace buffers.
    ///
    /// Per session and per started ftrace source, hands the accumulated
    /// metadata to peer data sources: rename pids strictly before seen
    /// pids to the process-stats sources (a renamed process must be
    /// re-scraped before it is catalogued as seen), inode pairs to the
    /// inode sources. The metadata is taken, leaving the source's copy
    /// empty.
    pub fn on_ftrace_batch_drained(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let ftrace_key = DescriptorKey::of(&ftrace::DESCRIPTOR);
        let ps_key = DescriptorKey::of(&crate::source::process_stats::DESCRIPTOR);
        let inode_key = DescriptorKey::of(&crate::source::inode_file::DESCRIPTOR);

        let sessions: Vec<SessionId> = state.session_index.keys().copied().collect();
        for session_id in sessions {
            let Some(entries) = state.session_index.get(&session_id) else {
                continue;
            };

            let ids_with_key = |key: DescriptorKey| -> Vec<InstanceId> {
                entries
                    .iter()
                    .filter(|&&(entry_key, _)| entry_key == key)
                    .map(|&(_, id)| id)
                    .collect()
            };
            let ftrace_ids = ids_with_key(ftrace_key);
            let ps_ids = ids_with_key(ps_key);
            let inode_ids = ids_with_key(inode_key);

            // There can be more than one ftrace source per session; each
            // one's metadata is delivered independently.
            for ftrace_id in ftrace_ids {
                let metadata = {
                    let Some(instance) = state.instances.get_mut(&ftrace_id) else {
                        continue;
                    };
                    if !instance.started {
                        continue;
                    }
                    let Some(ftrace_ds) = instance
                        .source
                        .as_any_mut()
                        .downcast_mut::<FtraceDataSource>()
                    else {
                        continue;
                    };
                    mem::take(ftrace_ds.metadata_mut())
                };

                for &ps_id in &ps_ids {
                    let Some(instance) = state.instances.get_mut(&ps_id) else {
                        continue;
                    };
                    if !instance.started {
                        continue;
                    }
                    let Some(ps_ds) = instance
                        .source
                        .as_any_mut()
                        .downcast_mut::<ProcessStatsDataSource>()
                    else {
                        continue;
                    };
                    if !ps_ds.on_demand_dumps_enabled() {
                        continue;
                    }
                    if !metadata.rename_pids.is_empty() {
                        ps_ds.on_rename_pids(&metadata.rename_pids);
                    }
                    if !metadata.pids.is_empty() {
                        ps_ds.on_pids(&metadata.pids);
                    }
                }

                for &inode_id in &inode_ids {
                    let Some(instance) = state.instances.get_mut(&inode_id) else {
                        continue;
                    };
                    if !instance.started {
                        continue;
                    }
                    let Some(inode_ds) = instance
                        .source
                        .as_any_mut()
                        .downcast_mut::<InodeFileDataSource>()
                    else {
                        continue;
                    };
                    inode_ds.on_inodes(&metadata.inode_and_device);
                }
            }
        }
    }
}

/// Owns the live producer incarnation.
///
/// Cloning the handle shares the slot. Dropping the last clone (or calling
/// [`ProducerHandle::shutdown`]) destroys the producer together with all
/// its data sources; the ftrace controller is destroyed last.
#[derive(Clone)]
pub struct ProducerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    current: Mutex<Option<Arc<Producer>>>,
    transport: Arc<dyn ServiceTransport>,
    runner: Arc<dyn TaskRunner>,
    settings: ConnectSettings,
}

impl ProducerHandle {
    /// Build the first producer incarnation and begin connecting with
    /// exponential retry backoff.
    pub fn connect_with_retries(
        transport: Arc<dyn ServiceTransport>,
        runner: Arc<dyn TaskRunner>,
        config: &Config,
    ) -> Self {
        let handle = Self {
            inner: Arc::new(HandleInner {
                current: Mutex::new(None),
                transport,
                runner,
                settings: ConnectSettings::from_config(config),
            }),
        };
        handle.respawn();
        handle
    }

    /// The live incarnation, if any.
    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.inner.current.lock().clone()
    }

    /// Tear the producer down, destroying every data-source instance.
    pub fn shutdown(&self) {
        *self.inner.current.lock() = None;
    }

    fn respawn(&self) {
        let mut current = self.inner.current.lock();
        // Drop the previous incarnation first: its weakly-held callbacks
        // die and its data sources are destroyed before new ones can
        // exist.
        *current = None;

        let producer = Producer::new(
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.runner),
            self.inner.settings.clone(),
            Arc::downgrade(&self.inner),
        );
        producer.connect_with_retries();
        *current = Some(producer);
    }
}
