//! Device runtime abstraction.
//!
//! The work graph only needs a handful of primitives from a device runtime:
//! ordered execution streams, events that let one stream wait for progress on
//! another, and asynchronous execution of elementwise operations and copies.
//! [`DeviceRuntime`] is that seam; backends implement it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque identifier of a device execution stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Opaque identifier of a device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Device backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick the best available backend.
    #[default]
    Auto,
    /// Host execution (always available).
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Body of an elementwise operation, invoked once per position `0..len`.
pub type ForEachBody = Arc<dyn Fn(usize) + Send + Sync>;

/// One-shot operation executed in stream order.
pub type DeviceTask = Box<dyn FnOnce() + Send>;

/// Work that can be enqueued on a stream.
pub enum DeviceOp {
    /// Invoke `body(n)` for every `n` in `0..len`, in any order and in parallel.
    ForEach {
        /// Number of invocations.
        len: usize,
        /// Invocation body.
        body: ForEachBody,
    },
    /// Run a task once. Used for copies and completion signals.
    Task(DeviceTask),
}

impl DeviceOp {
    /// Elementwise operation over `0..len`.
    pub fn for_each(len: usize, body: impl Fn(usize) + Send + Sync + 'static) -> Self {
        DeviceOp::ForEach {
            len,
            body: Arc::new(body),
        }
    }

    /// Single task.
    pub fn task(task: impl FnOnce() + Send + 'static) -> Self {
        DeviceOp::Task(Box::new(task))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceOp::ForEach { .. } => "for_each",
            DeviceOp::Task(_) => "task",
        }
    }
}

impl fmt::Debug for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOp::ForEach { len, .. } => f.debug_struct("ForEach").field("len", len).finish(),
            DeviceOp::Task(_) => f.write_str("Task"),
        }
    }
}

/// Streams, events and asynchronous execution provided by a device.
///
/// Operations enqueued on one stream run in submission order. Ordering across
/// streams exists only where a stream was told to wait on an event.
pub trait DeviceRuntime: Send + Sync {
    /// Backend implemented by this runtime.
    fn backend(&self) -> Backend;

    /// Create a new stream.
    fn create_stream(&self) -> Result<StreamId>;

    /// Destroy a stream once its queued work has drained.
    fn destroy_stream(&self, stream: StreamId) -> Result<()>;

    /// True when everything enqueued on `stream` so far has completed.
    fn query_stream(&self, stream: StreamId) -> Result<bool>;

    /// Block the host until everything enqueued on `stream` so far has completed.
    fn synchronize_stream(&self, stream: StreamId) -> Result<()>;

    /// Create an event.
    fn create_event(&self) -> Result<EventId>;

    /// Capture the current frontier of `stream` in `event`.
    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// Make future work on `stream` wait for the last capture of `event`.
    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()>;

    /// Release an event. Pending records and waits still complete.
    fn destroy_event(&self, event: EventId) -> Result<()>;

    /// Enqueue an operation on `stream` without blocking.
    fn enqueue(&self, stream: StreamId, op: DeviceOp) -> Result<()>;
}

/// Shared device runtime handle.
pub type SharedRuntime = Arc<dyn DeviceRuntime>;

/// True when both handles refer to the same runtime instance.
pub fn same_runtime(a: &SharedRuntime, b: &SharedRuntime) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_display() {
        assert_eq!(StreamId(3).to_string(), "stream#3");
        assert_eq!(EventId(7).to_string(), "event#7");
    }

    #[test]
    fn test_backend_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: Backend,
        }

        let w: Wrapper = toml::from_str("backend = \"cpu\"").unwrap();
        assert_eq!(w.backend, Backend::Cpu);
        assert_eq!(Backend::default(), Backend::Auto);
        assert_eq!(Backend::Cpu.to_string(), "cpu");
    }

    #[test]
    fn test_device_op_kind() {
        let op = DeviceOp::for_each(8, |_| {});
        assert_eq!(op.kind(), "for_each");
        assert_eq!(format!("{op:?}"), "ForEach { len: 8 }");
        assert_eq!(DeviceOp::task(|| {}).kind(), "task");
    }
}
