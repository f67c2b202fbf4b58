//! Contracts between the producer core and its external collaborators.
//!
//! The IPC transport, the shared-memory arbiter and the trace-packet wire
//! format all live outside this crate. The producer consumes them through
//! the traits below; integration harnesses substitute fakes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::producer::Producer;

/// Identifier of a tracing session, assigned by the service.
pub type SessionId = u64;

/// Identifier of one data-source instance, assigned by the service.
pub type InstanceId = u64;

/// Selects a shared-memory buffer of the tracing session.
pub type BufferId = u32;

/// Tag correlating flush requests with their acknowledgements.
pub type FlushId = u64;

/// Shared-memory size hint passed on connect.
pub const SHM_SIZE_HINT_BYTES: usize = 1024 * 1024;

/// Shared-memory page size hint passed on connect.
pub const SHM_PAGE_SIZE_HINT_BYTES: usize = 32 * 1024;

/// Name under which the producer registers with the service.
pub const PRODUCER_NAME: &str = "probekit.probes";

/// Registration message for one data-source kind.
///
/// Built from the static descriptor on connect; the descriptor's optional
/// enrichment hook may add kind-specific detail fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSourceRegistration {
    pub name: String,
    pub will_notify_on_start: bool,
    pub will_notify_on_stop: bool,
    pub handles_incremental_state_clear: bool,
    pub details: HashMap<String, String>,
}

/// Whether the service may scrape this producer's shared-memory buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SmbScrapingMode {
    #[default]
    Disabled,
    Enabled,
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub socket_name: String,
    pub producer_name: String,
    pub scraping_mode: SmbScrapingMode,
    pub shm_size_hint_bytes: usize,
    pub shm_page_size_hint_bytes: usize,
}

/// Serialises trace packets into a shared-memory buffer.
pub trait TraceWriter: Send {
    /// Append one serialized packet.
    fn write_packet(&mut self, payload: &[u8]);

    /// Commit buffered packets; `done` fires once they are visible to the
    /// service.
    fn flush(&mut self, done: Option<Box<dyn FnOnce() + Send>>);
}

/// Producer-side handle to the tracing service.
pub trait ServiceEndpoint: Send + Sync {
    fn register_data_source(&self, desc: &DataSourceRegistration);

    fn create_trace_writer(&self, buffer_id: BufferId) -> Box<dyn TraceWriter>;

    fn notify_data_source_started(&self, id: InstanceId);

    fn notify_data_source_stopped(&self, id: InstanceId);

    fn notify_flush_complete(&self, flush_id: FlushId);

    fn activate_triggers(&self, names: &[String]);

    /// Invoke `done` once all requests posted so far are durable at the
    /// service side.
    fn sync(&self, done: Box<dyn FnOnce() + Send>);

    /// Size of the shared-memory region, once the service has mapped one.
    fn shared_memory_size(&self) -> Option<usize>;
}

/// Connection factory for the IPC transport.
///
/// Implementations must deliver `on_connect` and `on_disconnect` to the
/// producer through its task runner, never from inside `connect` itself.
pub trait ServiceTransport: Send + Sync {
    fn connect(&self, args: ConnectArgs, producer: Weak<Producer>) -> Arc<dyn ServiceEndpoint>;
}
