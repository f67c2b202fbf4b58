//! End-to-end producer flows against fake service collaborators, driven by
//! the real tokio task runner under a paused clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use probekit::config::{Config, DataSourceConfig, WatchdogConfig};
use probekit::producer::{Producer, ProducerHandle};
use probekit::runner::{TaskRunner, TokioTaskRunner};
use probekit::service::{
    BufferId, ConnectArgs, DataSourceRegistration, FlushId, InstanceId, ServiceEndpoint,
    ServiceTransport, TraceWriter,
};
use probekit::source::ALL_DATA_SOURCES;
use probekit::watchdog::Watchdog;

// --- Fake collaborators ---

struct FakeWriter {
    packets: Arc<Mutex<Vec<String>>>,
    defer_acks: Arc<AtomicBool>,
    deferred_acks: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl TraceWriter for FakeWriter {
    fn write_packet(&mut self, payload: &[u8]) {
        self.packets
            .lock()
            .push(String::from_utf8_lossy(payload).into_owned());
    }

    fn flush(&mut self, done: Option<Box<dyn FnOnce() + Send>>) {
        let Some(done) = done else {
            return;
        };
        if self.defer_acks.load(Ordering::SeqCst) {
            self.deferred_acks.lock().push(done);
        } else {
            done();
        }
    }
}

#[derive(Default)]
struct FakeEndpoint {
    registrations: Mutex<Vec<DataSourceRegistration>>,
    started: Mutex<Vec<InstanceId>>,
    stopped: Mutex<Vec<InstanceId>>,
    flush_completes: Mutex<Vec<FlushId>>,
    triggers: Mutex<Vec<String>>,
    packets: Arc<Mutex<Vec<String>>>,
    defer_acks: Arc<AtomicBool>,
    deferred_acks: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl ServiceEndpoint for FakeEndpoint {
    fn register_data_source(&self, desc: &DataSourceRegistration) {
        self.registrations.lock().push(desc.clone());
    }

    fn create_trace_writer(&self, _buffer_id: BufferId) -> Box<dyn TraceWriter> {
        Box::new(FakeWriter {
            packets: Arc::clone(&self.packets),
            defer_acks: Arc::clone(&self.defer_acks),
            deferred_acks: Arc::clone(&self.deferred_acks),
        })
    }

    fn notify_data_source_started(&self, id: InstanceId) {
        self.started.lock().push(id);
    }

    fn notify_data_source_stopped(&self, id: InstanceId) {
        self.stopped.lock().push(id);
    }

    fn notify_flush_complete(&self, flush_id: FlushId) {
        self.flush_completes.lock().push(flush_id);
    }

    fn activate_triggers(&self, names: &[String]) {
        self.triggers.lock().extend(names.iter().cloned());
    }

    fn sync(&self, done: Box<dyn FnOnce() + Send>) {
        done();
    }

    fn shared_memory_size(&self) -> Option<usize> {
        None
    }
}

struct FakeTransport {
    endpoint: Arc<FakeEndpoint>,
    connects: Mutex<Vec<ConnectArgs>>,
}

impl ServiceTransport for FakeTransport {
    fn connect(&self, args: ConnectArgs, _producer: Weak<Producer>) -> Arc<dyn ServiceEndpoint> {
        self.connects.lock().push(args);
        Arc::clone(&self.endpoint) as Arc<dyn ServiceEndpoint>
    }
}

struct Setup {
    handle: ProducerHandle,
    runner: Arc<TokioTaskRunner>,
    transport: Arc<FakeTransport>,
    endpoint: Arc<FakeEndpoint>,
}

fn connect_producer() -> Setup {
    let runner = Arc::new(TokioTaskRunner::new());
    let endpoint = Arc::new(FakeEndpoint::default());
    let transport = Arc::new(FakeTransport {
        endpoint: Arc::clone(&endpoint),
        connects: Mutex::new(Vec::new()),
    });

    let handle = ProducerHandle::connect_with_retries(
        Arc::clone(&transport) as Arc<dyn ServiceTransport>,
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        &Config::default(),
    );

    Setup {
        handle,
        runner,
        transport,
        endpoint,
    }
}

fn source_config(name: &str, session_id: u64) -> DataSourceConfig {
    DataSourceConfig {
        name: name.to_string(),
        tracing_session_id: session_id,
        ..Default::default()
    }
}

/// Let the runner drain everything queued so far (virtual time).
async fn drain() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// --- Flows ---

#[tokio::test(start_paused = true)]
async fn full_session_lifecycle() {
    let setup = connect_producer();
    let producer = setup.handle.producer().expect("producer is live");

    // The transport was asked to connect with the configured identity.
    {
        let connects = setup.transport.connects.lock();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].socket_name, "/run/probekit/producer.sock");
        assert_eq!(connects[0].shm_size_hint_bytes, 1024 * 1024);
        assert_eq!(connects[0].shm_page_size_hint_bytes, 32 * 1024);
    }

    // Deliver OnConnect on the runner, as the transport would.
    {
        let producer = Arc::clone(&producer);
        setup
            .runner
            .post_task(Box::new(move || producer.on_connect()));
    }
    drain().await;

    assert!(producer.is_connected());
    assert_eq!(
        setup.endpoint.registrations.lock().len(),
        ALL_DATA_SOURCES.len(),
    );

    // Set up and start two data sources in session 7.
    let config_a = source_config("linux.process_stats", 7);
    let config_b = source_config("linux.sys_stats", 7);
    producer.setup_data_source(1, &config_a);
    producer.setup_data_source(2, &config_b);
    producer.start_data_source(1, &config_a);
    producer.start_data_source(2, &config_b);
    assert_eq!(*setup.endpoint.started.lock(), vec![1, 2]);

    // Flush both; acks arrive synchronously, completion is reported once.
    producer.flush(42, &[1, 2]);
    drain().await;
    assert_eq!(*setup.endpoint.flush_completes.lock(), vec![42]);

    // Let the 1s flush deadline pass: no duplicate notification.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(*setup.endpoint.flush_completes.lock(), vec![42]);

    producer.stop_data_source(1);
    producer.stop_data_source(2);
    assert_eq!(*setup.endpoint.stopped.lock(), vec![1, 2]);

    setup.handle.shutdown();
    assert!(setup.handle.producer().is_none());
}

#[tokio::test(start_paused = true)]
async fn flush_deadline_forces_completion() {
    let setup = connect_producer();
    let producer = setup.handle.producer().expect("producer is live");
    producer.on_connect();

    let config = source_config("linux.sys_stats", 7);
    producer.setup_data_source(1, &config);
    producer.start_data_source(1, &config);

    setup.endpoint.defer_acks.store(true, Ordering::SeqCst);
    producer.flush(42, &[1]);

    // No ack within the deadline: forced completion at 1s.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(setup.endpoint.flush_completes.lock().is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*setup.endpoint.flush_completes.lock(), vec![42]);

    // The ack arriving late changes nothing.
    let late_ack = setup.endpoint.deferred_acks.lock().remove(0);
    late_ack();
    drain().await;
    assert_eq!(*setup.endpoint.flush_completes.lock(), vec![42]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_timing() {
    let setup = connect_producer();

    // First failure: retry after 100ms.
    setup.handle.producer().unwrap().on_disconnect();
    tokio::time::sleep(Duration::from_millis(95)).await;
    assert_eq!(setup.transport.connects.lock().len(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(setup.transport.connects.lock().len(), 2);

    // Second failure: retry after 200ms.
    setup.handle.producer().unwrap().on_disconnect();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(setup.transport.connects.lock().len(), 2);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(setup.transport.connects.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn established_disconnect_rebuilds_producer() {
    let setup = connect_producer();
    let first = setup.handle.producer().expect("producer is live");
    first.on_connect();

    let config = source_config("linux.sys_stats", 7);
    first.setup_data_source(1, &config);
    first.start_data_source(1, &config);

    first.on_disconnect();
    drop(first);
    drain().await;

    // A fresh incarnation reconnected from scratch.
    let second = setup.handle.producer().expect("producer is live");
    assert!(!second.is_connected());
    assert_eq!(setup.transport.connects.lock().len(), 2);

    // The service sees the full catalogue again on the new connection.
    second.on_connect();
    assert_eq!(
        setup.endpoint.registrations.lock().len(),
        2 * ALL_DATA_SOURCES.len(),
    );
}

#[tokio::test(start_paused = true)]
async fn trigger_roundtrip_and_drop_accounting() {
    let setup = connect_producer();
    let producer = setup.handle.producer().expect("producer is live");
    producer.on_connect();

    producer.activate_trigger("session_start".to_string());
    drain().await;
    assert_eq!(*setup.endpoint.triggers.lock(), vec!["session_start"]);
    assert_eq!(producer.trigger_stats().requested(), 1);

    // Knock the producer back to a disconnected state and try again.
    producer.on_disconnect();
    drop(producer);
    drain().await;

    let producer = setup.handle.producer().expect("producer is live");
    producer.on_disconnect();
    producer.activate_trigger("too_late".to_string());
    drain().await;
    assert_eq!(setup.endpoint.triggers.lock().len(), 1);
    assert_eq!(producer.trigger_stats().dropped(), 1);
}

#[test]
fn watchdog_limits_follow_config() {
    let config = Config {
        watchdog: WatchdogConfig {
            polling_interval: Duration::from_secs(1),
            cpu_limit_percentage: 50,
            cpu_limit_window: Duration::from_secs(10),
            memory_limit_bytes: 64 * 1024 * 1024,
            memory_limit_window: Duration::from_secs(5),
        },
        ..Default::default()
    };
    config.validate().expect("aligned windows");

    // apply() asserts window alignment internally; surviving it with a
    // watchdog built on the configured cadence is the contract.
    let watchdog = Watchdog::new(config.watchdog.polling_interval.as_millis() as u32);
    config.watchdog.apply(&watchdog);
}
