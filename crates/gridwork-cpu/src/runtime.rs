//! CPU runtime implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, trace};

use gridwork_core::config::RuntimeConfig;
use gridwork_core::device::{Backend, DeviceOp, DeviceRuntime, EventId, StreamId};
use gridwork_core::error::{GridworkError, Result};

use crate::event::EventState;
use crate::worker::{Command, StreamWorker};

/// CPU-based implementation of [`DeviceRuntime`].
///
/// Streams are worker threads executing commands in order; elementwise
/// operations fan out over a shared rayon pool. Used for testing and as the
/// fallback when no accelerator is available.
pub struct CpuRuntime {
    /// Live streams.
    streams: RwLock<HashMap<StreamId, StreamWorker>>,
    /// Live events.
    events: RwLock<HashMap<EventId, Arc<EventState>>>,
    /// Pool running elementwise operations.
    compute: Arc<ThreadPool>,
    /// Prefix of worker thread names.
    name_prefix: String,
    next_stream: AtomicU64,
    next_event: AtomicU64,
    /// Total streams ever created.
    total_streams: AtomicU64,
}

impl CpuRuntime {
    /// Create a new CPU runtime.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        info!(
            "Initializing CPU runtime (worker_threads={})",
            config.worker_threads
        );

        let prefix = config.stream_name_prefix.clone();
        let compute = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(move |i| format!("{prefix}-compute-{i}"))
            .build()
            .map_err(|e| GridworkError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            streams: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            compute: Arc::new(compute),
            name_prefix: config.stream_name_prefix.clone(),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            total_streams: AtomicU64::new(0),
        })
    }

    /// Create a CPU runtime with default settings.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&RuntimeConfig::default())
    }

    /// Threads in the elementwise pool.
    pub fn compute_threads(&self) -> usize {
        self.compute.current_num_threads()
    }

    /// Streams currently alive.
    pub fn live_streams(&self) -> usize {
        self.streams.read().len()
    }

    /// Events currently alive.
    pub fn live_events(&self) -> usize {
        self.events.read().len()
    }

    /// Streams created over the runtime's lifetime.
    pub fn total_streams(&self) -> u64 {
        self.total_streams.load(Ordering::Relaxed)
    }

    fn submit(&self, stream: StreamId, command: Command) -> Result<()> {
        let streams = self.streams.read();
        let worker = streams
            .get(&stream)
            .ok_or_else(|| GridworkError::Launch(format!("unknown {stream}")))?;
        worker.submit(command)
    }

    fn event(&self, event: EventId) -> Result<Arc<EventState>> {
        self.events
            .read()
            .get(&event)
            .cloned()
            .ok_or_else(|| GridworkError::Event(format!("unknown {event}")))
    }
}

impl DeviceRuntime for CpuRuntime {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn create_stream(&self) -> Result<StreamId> {
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let name = format!("{}-{}", self.name_prefix, id.0);
        let worker = StreamWorker::spawn(id, name, Arc::clone(&self.compute))?;

        self.streams.write().insert(id, worker);
        self.total_streams.fetch_add(1, Ordering::Relaxed);

        debug!(stream = %id, "created stream");
        Ok(id)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        let worker = self.streams.write().remove(&stream);
        match worker {
            Some(mut worker) => {
                worker.shutdown();
                debug!(stream = %stream, "destroyed stream");
                Ok(())
            }
            None => Err(GridworkError::Synchronization(format!("unknown {stream}"))),
        }
    }

    fn query_stream(&self, stream: StreamId) -> Result<bool> {
        let streams = self.streams.read();
        let worker = streams
            .get(&stream)
            .ok_or_else(|| GridworkError::Synchronization(format!("unknown {stream}")))?;
        worker.query()
    }

    fn synchronize_stream(&self, stream: StreamId) -> Result<()> {
        let streams = self.streams.read();
        let worker = streams
            .get(&stream)
            .ok_or_else(|| GridworkError::Synchronization(format!("unknown {stream}")))?;
        worker.synchronize()
    }

    fn create_event(&self) -> Result<EventId> {
        let id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        self.events.write().insert(id, Arc::new(EventState::new()));
        trace!(event = %id, "created event");
        Ok(id)
    }

    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let state = self.event(event)?;
        let generation = state.next_record();
        trace!(event = %event, stream = %stream, generation, "record event");
        self.submit(
            stream,
            Command::Record {
                event: state,
                generation,
            },
        )
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()> {
        let state = self.event(event)?;
        let generation = state.latest_record();
        if generation == 0 {
            return Ok(());
        }
        trace!(event = %event, stream = %stream, generation, "stream waits on event");
        self.submit(
            stream,
            Command::Wait {
                event: state,
                generation,
            },
        )
    }

    fn destroy_event(&self, event: EventId) -> Result<()> {
        self.events
            .write()
            .remove(&event)
            .map(|_| trace!(event = %event, "destroyed event"))
            .ok_or_else(|| GridworkError::Event(format!("unknown {event}")))
    }

    fn enqueue(&self, stream: StreamId, op: DeviceOp) -> Result<()> {
        trace!(stream = %stream, kind = op.kind(), "enqueue");
        self.submit(stream, Command::Op(op))
    }
}

impl Drop for CpuRuntime {
    fn drop(&mut self) {
        let workers: Vec<StreamWorker> = self.streams.get_mut().drain().map(|(_, w)| w).collect();
        debug!("Shutting down CPU runtime ({} streams)", workers.len());
        drop(workers);
    }
}
