//! Data-source catalogue.
//!
//! Each kind of data source has a static [`Descriptor`] and a factory
//! function. The producer registers every descriptor with the service on
//! connect and instantiates kinds on demand, one instance per
//! `SetupDataSource` request. Descriptor pointer identity is the canonical
//! way to group peer instances of the same kind within a session.

pub mod ftrace;
pub mod inode_file;
pub mod metatrace;
pub mod power;
pub mod process_stats;
pub mod sys_stats;
pub mod system_info;

use std::any::Any;
use std::sync::{Arc, Weak};

use crate::config::DataSourceConfig;
use crate::producer::Producer;
use crate::runner::TaskRunner;
use crate::service::{DataSourceRegistration, FlushId, ServiceEndpoint, SessionId};

use self::ftrace::FtraceController;
use self::inode_file::InodeMap;

/// Static description of one data-source kind.
pub struct Descriptor {
    /// Stable name the service selects the kind by.
    pub name: &'static str,

    /// The kind can rewind per-session interning state without stopping.
    pub handles_incremental_state: bool,

    /// Optional hook enriching the registration message with kind-specific
    /// fields.
    pub fill_descriptor: Option<fn(&mut DataSourceRegistration)>,
}

impl Descriptor {
    /// Build the registration message sent to the service for this kind.
    pub fn registration(&'static self) -> DataSourceRegistration {
        let mut desc = DataSourceRegistration {
            name: self.name.to_string(),
            will_notify_on_start: true,
            will_notify_on_stop: true,
            handles_incremental_state_clear: self.handles_incremental_state,
            ..Default::default()
        };
        if let Some(fill) = self.fill_descriptor {
            fill(&mut desc);
        }
        desc
    }
}

/// Map-friendly identity of a descriptor. Pointer identity is canonical;
/// the secondary session index stores these instead of references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorKey(usize);

impl DescriptorKey {
    pub fn of(descriptor: &'static Descriptor) -> Self {
        Self(descriptor as *const Descriptor as usize)
    }
}

/// Callback acknowledging that a flush round reached shared memory.
pub type FlushDoneFn = Box<dyn FnOnce() + Send>;

/// One live data-source instance, scoped to a tracing session.
pub trait DataSource: Send {
    fn descriptor(&self) -> &'static Descriptor;

    /// Begin emitting packets.
    fn start(&mut self);

    /// Commit all pending data. `done` must eventually be invoked; the
    /// producer bounds the wait with its own timeout.
    fn flush(&mut self, flush_id: FlushId, done: FlushDoneFn);

    /// Rewind per-session accumulated state.
    fn clear_incremental_state(&mut self) {}

    /// Downcast hook for peer-to-peer metadata delivery.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared producer state a factory may draw on.
pub struct FactoryCtx<'a> {
    pub runner: &'a Arc<dyn TaskRunner>,
    pub endpoint: &'a Arc<dyn ServiceEndpoint>,
    pub producer: &'a Weak<Producer>,
    pub ftrace: &'a mut Option<Arc<FtraceController>>,
    pub ftrace_creation_failed: &'a mut bool,
    pub system_inodes: &'a mut Option<Arc<InodeMap>>,
}

/// Builds one instance, or refuses (e.g. ftrace unavailable). Refusal is
/// logged by the factory and is not an error towards the service.
pub type FactoryFn =
    fn(&mut FactoryCtx<'_>, SessionId, &DataSourceConfig) -> Option<Box<dyn DataSource>>;

/// A catalogue entry: descriptor plus its factory.
pub struct RegisteredSource {
    pub descriptor: &'static Descriptor,
    pub factory: FactoryFn,
}

/// Every data-source kind this producer can host, in registration order.
pub static ALL_DATA_SOURCES: &[RegisteredSource] = &[
    RegisteredSource {
        descriptor: &ftrace::DESCRIPTOR,
        factory: ftrace::create,
    },
    RegisteredSource {
        descriptor: &inode_file::DESCRIPTOR,
        factory: inode_file::create,
    },
    RegisteredSource {
        descriptor: &metatrace::DESCRIPTOR,
        factory: metatrace::create,
    },
    RegisteredSource {
        descriptor: &power::DESCRIPTOR,
        factory: power::create,
    },
    RegisteredSource {
        descriptor: &process_stats::DESCRIPTOR,
        factory: process_stats::create,
    },
    RegisteredSource {
        descriptor: &sys_stats::DESCRIPTOR,
        factory: sys_stats::create,
    },
    RegisteredSource {
        descriptor: &system_info::DESCRIPTOR,
        factory: system_info::create,
    },
];

/// Look a catalogue entry up by its service-facing name.
pub fn registered_source(name: &str) -> Option<&'static RegisteredSource> {
    ALL_DATA_SOURCES
        .iter()
        .find(|source| source.descriptor.name == name)
}
