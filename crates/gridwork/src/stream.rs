//! Stream pool and stream handles.
//!
//! The pool keeps every stream it ever created in a ledger together with the
//! receiving end of a one-shot completion channel. A handle owns the sending
//! end; releasing the handle fires it, but only once the stream has drained on
//! the device. [`StreamPool::get`] reuses any stream whose signal has fired
//! and creates a new one otherwise.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use gridwork_core::config::{GridworkConfig, RuntimeConfig};
use gridwork_core::device::{Backend, DeviceOp, SharedRuntime, StreamId};
use gridwork_core::error::{GridworkError, Result};
use gridwork_cpu::CpuRuntime;

use crate::work::WorkNode;

static GLOBAL_POOL: OnceLock<Arc<StreamPool>> = OnceLock::new();

/// A stream in the ledger with the signal of its latest borrower.
struct Slot {
    stream: StreamId,
    released: Receiver<()>,
}

/// Growable set of streams handed out to one borrower at a time.
pub struct StreamPool {
    runtime: SharedRuntime,
    ledger: Mutex<Vec<Slot>>,
}

impl StreamPool {
    /// Create an empty pool on `runtime`.
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            ledger: Mutex::new(Vec::new()),
        }
    }

    /// Create a pool and its runtime from configuration.
    pub fn with_config(config: &RuntimeConfig) -> Result<Self> {
        let runtime: SharedRuntime = match config.backend {
            Backend::Auto | Backend::Cpu => Arc::new(CpuRuntime::new(config)?),
        };
        let pool = Self::new(runtime);

        {
            let mut ledger = pool.ledger.lock();
            for _ in 0..config.initial_streams {
                let stream = pool.runtime.create_stream()?;
                let (signal, released) = channel::bounded(1);
                // Capacity is one and the receiver is alive.
                let _ = signal.try_send(());
                ledger.push(Slot { stream, released });
            }
        }

        debug!(
            backend = %pool.runtime.backend(),
            initial_streams = config.initial_streams,
            "created stream pool"
        );
        Ok(pool)
    }

    /// The process-wide pool, created from default configuration on first use
    /// unless [`crate::init`] installed one.
    pub fn global() -> Result<Arc<StreamPool>> {
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(Arc::clone(pool));
        }
        let config = GridworkConfig::default().apply_env_overrides();
        let pool = Arc::new(Self::with_config(&config.runtime)?);
        Ok(Arc::clone(GLOBAL_POOL.get_or_init(|| pool)))
    }

    /// Install `pool` as the process-wide pool.
    pub(crate) fn install_global(pool: StreamPool) -> Result<Arc<StreamPool>> {
        let pool = Arc::new(pool);
        GLOBAL_POOL
            .set(Arc::clone(&pool))
            .map_err(|_| GridworkError::InvalidConfig("global stream pool already initialized".to_string()))?;
        Ok(pool)
    }

    /// Runtime the pool's streams belong to.
    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Borrow a stream, reusing a released one when possible.
    pub fn get(&self) -> Result<StreamHandle> {
        let mut discarded = Vec::new();

        let handle = {
            let mut ledger = self.ledger.lock();

            let mut reusable = None;
            let mut i = 0;
            while i < ledger.len() {
                match ledger[i].released.try_recv() {
                    Ok(()) => {
                        reusable = Some(i);
                        break;
                    }
                    Err(TryRecvError::Empty) => i += 1,
                    Err(TryRecvError::Disconnected) => {
                        // Released without a confirmed drain, e.g. after a fault.
                        discarded.push(ledger.swap_remove(i).stream);
                    }
                }
            }

            let (signal, released) = channel::bounded(1);
            let stream = match reusable {
                Some(i) => {
                    let slot = &mut ledger[i];
                    slot.released = released;
                    trace!(stream = %slot.stream, "reusing stream");
                    slot.stream
                }
                None => {
                    let stream = self.runtime.create_stream()?;
                    ledger.push(Slot { stream, released });
                    debug!(stream = %stream, total = ledger.len(), "pool created stream");
                    stream
                }
            };

            StreamHandle::new(stream, signal, Arc::clone(&self.runtime))
        };

        for stream in discarded {
            warn!(stream = %stream, "discarding stream released without completion");
            if let Err(e) = self.runtime.destroy_stream(stream) {
                error!(stream = %stream, error = %e, "failed to destroy stream");
            }
        }

        Ok(handle)
    }

    /// Start a new work lineage on a borrowed stream.
    pub fn work(self: &Arc<Self>) -> Result<WorkNode> {
        WorkNode::from_pool(self)
    }

    /// Streams owned by the pool, borrowed or idle.
    pub fn stream_count(&self) -> usize {
        self.ledger.lock().len()
    }

    /// Streams whose last borrower has finished.
    pub fn idle_count(&self) -> usize {
        self.ledger
            .lock()
            .iter()
            .filter(|slot| !slot.released.is_empty())
            .count()
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        // Borrowed streams stay with the runtime until it shuts down.
        for slot in self.ledger.get_mut().drain(..) {
            if !slot.released.is_empty() {
                if let Err(e) = self.runtime.destroy_stream(slot.stream) {
                    debug!(stream = %slot.stream, error = %e, "stream already gone");
                }
            }
        }
    }
}

impl fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("backend", &self.runtime.backend())
            .field("streams", &self.stream_count())
            .finish()
    }
}

/// Exclusive use of one pooled stream.
///
/// Active until released; releasing is idempotent and also happens on drop.
pub struct StreamHandle {
    stream: StreamId,
    signal: Option<Sender<()>>,
    runtime: SharedRuntime,
}

impl StreamHandle {
    fn new(stream: StreamId, signal: Sender<()>, runtime: SharedRuntime) -> Self {
        Self {
            stream,
            signal: Some(signal),
            runtime,
        }
    }

    /// True until released.
    pub fn is_active(&self) -> bool {
        self.signal.is_some()
    }

    /// The borrowed stream.
    pub fn get(&self) -> Result<StreamId> {
        if self.is_active() {
            Ok(self.stream)
        } else {
            Err(GridworkError::InactiveHandle)
        }
    }

    /// Executor enqueuing on the borrowed stream.
    pub fn on_stream(&self) -> Result<StreamExecutor<'_>> {
        Ok(StreamExecutor {
            runtime: &self.runtime,
            stream: self.get()?,
        })
    }

    /// Runtime owning the stream.
    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Block until the stream drains. No-op once released.
    pub fn wait(&self) -> Result<()> {
        if self.is_active() {
            self.runtime.synchronize_stream(self.stream)?;
        }
        Ok(())
    }

    /// Give the stream back to its pool.
    pub fn release(&mut self) {
        let Some(signal) = self.signal.take() else {
            return;
        };

        match self.runtime.query_stream(self.stream) {
            Ok(true) => {
                let _ = signal.try_send(());
                trace!(stream = %self.stream, "released idle stream");
            }
            Ok(false) => {
                let op = DeviceOp::task(move || {
                    let _ = signal.try_send(());
                });
                match self.runtime.enqueue(self.stream, op) {
                    Ok(()) => trace!(stream = %self.stream, "release scheduled after drain"),
                    Err(e) => error!(stream = %self.stream, error = %e, "failed to schedule release"),
                }
            }
            // The pool discards the stream once it sees the dropped signal.
            Err(e) => warn!(stream = %self.stream, error = %e, "releasing unusable stream"),
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream", &self.stream)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Enqueues device work on one stream.
#[derive(Clone, Copy)]
pub struct StreamExecutor<'a> {
    runtime: &'a SharedRuntime,
    stream: StreamId,
}

impl StreamExecutor<'_> {
    /// Target stream.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Invoke `body(n)` for each `n` in `0..len`.
    pub fn for_each(&self, len: usize, body: impl Fn(usize) + Send + Sync + 'static) -> Result<()> {
        self.launch(DeviceOp::for_each(len, body))
    }

    /// Enqueue an arbitrary operation.
    pub fn launch(&self, op: DeviceOp) -> Result<()> {
        self.runtime.enqueue(self.stream, op)
    }
}

impl fmt::Debug for StreamExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamExecutor")
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn pool() -> StreamPool {
        StreamPool::with_config(&RuntimeConfig {
            worker_threads: 2,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_get_creates_streams_while_borrowed() {
        let pool = pool();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a.get().unwrap(), b.get().unwrap());
        assert_eq!(pool.stream_count(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_released_idle_stream_is_reused() {
        let pool = pool();
        let first = pool.get().unwrap();
        let stream = first.get().unwrap();
        drop(first);

        assert_eq!(pool.idle_count(), 1);
        let second = pool.get().unwrap();
        assert_eq!(second.get().unwrap(), stream);
        assert_eq!(pool.stream_count(), 1);
    }

    #[test]
    fn test_busy_stream_not_reused_until_drained() {
        let pool = pool();
        let gate = Arc::new(AtomicBool::new(false));

        let mut busy = pool.get().unwrap();
        let busy_stream = busy.get().unwrap();
        {
            let gate = Arc::clone(&gate);
            busy.on_stream()
                .unwrap()
                .launch(DeviceOp::task(move || {
                    while !gate.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }))
                .unwrap();
        }
        busy.release();

        // Released on the host but still running on the device.
        let other = pool.get().unwrap();
        assert_eq!(pool.stream_count(), 2);
        drop(other);

        gate.store(true, Ordering::Release);
        pool.runtime().synchronize_stream(busy_stream).unwrap();
        while pool.idle_count() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let _again = pool.get().unwrap();
        assert_eq!(pool.stream_count(), 2);
    }

    #[test]
    fn test_inactive_handle() {
        let pool = pool();
        let mut handle = pool.get().unwrap();
        assert!(handle.is_active());
        handle.release();
        handle.release();

        assert!(!handle.is_active());
        assert!(matches!(handle.get(), Err(GridworkError::InactiveHandle)));
        assert!(matches!(handle.on_stream(), Err(GridworkError::InactiveHandle)));
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn test_initial_streams() {
        let pool = StreamPool::with_config(&RuntimeConfig {
            initial_streams: 3,
            ..RuntimeConfig::default()
        })
        .unwrap();
        assert_eq!(pool.stream_count(), 3);
        assert_eq!(pool.idle_count(), 3);

        let _h = pool.get().unwrap();
        assert_eq!(pool.stream_count(), 3);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_executor_for_each() {
        let pool = pool();
        let handle = pool.get().unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            handle
                .on_stream()
                .unwrap()
                .for_each(10, move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        handle.wait().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 10);
    }
}
