//! Flat device and staging allocations.
//!
//! A [`DeviceBuffer`] is shared through an `Arc` between the grid buffer that
//! owns it and every device operation that captured it, so the memory stays
//! alive until the last queued operation touching it has run.
//!
//! Each buffer carries an access fence. Enqueued operations hold a
//! [`DeviceUse`] guard for their whole lifetime; host accessors block until no
//! guard is outstanding, which keeps host reads and writes from racing device
//! work without an explicit `wait()`.
//!
//! Device-side ordering is tracked per buffer as well: the buffer remembers
//! the stream that last enqueued work on it and an event recorded behind that
//! work. Work enqueued on any other stream first waits on that event, so all
//! guarded operations on one buffer run in enqueue order whatever lineage
//! issued them.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::device::{same_runtime, DeviceRuntime, EventId, SharedRuntime, StreamId};
use crate::error::Result;

/// Where an allocation is addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Device-resident storage, touched by enqueued operations.
    Device,
    /// Host-resident mirror used for initialization and inspection.
    Staging,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Device => write!(f, "device"),
            MemoryKind::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Default)]
struct AccessFence {
    in_flight: Mutex<usize>,
    idle: Condvar,
}

/// Stream that last enqueued work on a buffer, and the event behind it.
struct StreamMark {
    runtime: Weak<dyn DeviceRuntime>,
    stream: StreamId,
    event: EventId,
}

impl StreamMark {
    fn runtime_if(&self, runtime: &SharedRuntime) -> Option<SharedRuntime> {
        self.runtime
            .upgrade()
            .filter(|last| same_runtime(last, runtime))
    }

    fn release(self) {
        if let Some(runtime) = self.runtime.upgrade() {
            if let Err(e) = runtime.destroy_event(self.event) {
                debug!(event = %self.event, error = %e, "stream mark event already gone");
            }
        }
    }
}

/// One flat, zero-initialised allocation of `len` scalars.
pub struct DeviceBuffer<T: Pod> {
    ptr: NonNull<T>,
    len: usize,
    kind: MemoryKind,
    fence: AccessFence,
    last_use: Mutex<Option<StreamMark>>,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate `len` zeroed scalars.
    pub fn zeroed(len: usize, kind: MemoryKind) -> Self {
        Self::from_boxed(bytemuck::zeroed_slice_box(len), kind)
    }

    /// Take ownership of existing host data.
    pub fn from_vec(data: Vec<T>, kind: MemoryKind) -> Self {
        Self::from_boxed(data.into_boxed_slice(), kind)
    }

    fn from_boxed(data: Box<[T]>, kind: MemoryKind) -> Self {
        let len = data.len();
        let raw = Box::into_raw(data) as *mut T;
        Self {
            // SAFETY: Box::into_raw never returns null, even for empty slices.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
            kind,
            fence: AccessFence::default(),
            last_use: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Number of scalars.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length allocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Memory kind.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Base pointer of the allocation.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Register an in-flight device operation on this buffer.
    pub fn begin_device_use(self: &Arc<Self>) -> DeviceUse<T> {
        *self.fence.in_flight.lock() += 1;
        DeviceUse {
            buffer: Arc::clone(self),
        }
    }

    /// Number of device operations currently holding this buffer.
    pub fn in_flight(&self) -> usize {
        *self.fence.in_flight.lock()
    }

    /// Block until no device operation holds this buffer.
    pub fn wait_idle(&self) {
        let mut in_flight = self.fence.in_flight.lock();
        while *in_flight > 0 {
            self.fence.idle.wait(&mut in_flight);
        }
    }

    /// Make `stream` wait for the work last marked on this buffer.
    ///
    /// Nothing is inserted when `stream` is itself the last user. A mark left
    /// by another runtime cannot be waited on by `stream`; the host waits on
    /// the fence instead.
    pub fn order_after_last_use(&self, runtime: &SharedRuntime, stream: StreamId) -> Result<()> {
        let last_use = self.last_use.lock();
        let Some(mark) = last_use.as_ref() else {
            return Ok(());
        };

        match mark.runtime_if(runtime) {
            Some(_) if mark.stream == stream => Ok(()),
            Some(_) => runtime.stream_wait_event(stream, mark.event),
            None => {
                self.wait_idle();
                Ok(())
            }
        }
    }

    /// Mark `stream` as the last user of this buffer. Call right after
    /// enqueueing the work that touches it.
    pub fn mark_use(&self, runtime: &SharedRuntime, stream: StreamId) -> Result<()> {
        let event = runtime.create_event()?;
        if let Err(e) = runtime.record_event(event, stream) {
            let _ = runtime.destroy_event(event);
            return Err(e);
        }

        let previous = self.last_use.lock().replace(StreamMark {
            runtime: Arc::downgrade(runtime),
            stream,
            event,
        });
        if let Some(previous) = previous {
            previous.release();
        }
        Ok(())
    }

    /// Stream that last enqueued work on this buffer, if its runtime is `runtime`.
    pub fn last_stream(&self, runtime: &SharedRuntime) -> Option<StreamId> {
        let last_use = self.last_use.lock();
        let mark = last_use.as_ref()?;
        mark.runtime_if(runtime).map(|_| mark.stream)
    }

    /// Host view of the contents, after in-flight operations complete.
    pub fn host_slice(&self) -> &[T] {
        self.wait_idle();
        // SAFETY: no tracked device operation is in flight and the allocation
        // is valid for `len` initialised scalars.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable host view of the contents, after in-flight operations complete.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive host-side ownership of the buffer, so no
    /// other host slice or view of it is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn host_slice_mut(&self) -> &mut [T] {
        self.wait_idle();
        // SAFETY: exclusivity is guaranteed by the caller, device work by the fence.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> Vec<T> {
        self.host_slice().to_vec()
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Some(mark) = self.last_use.get_mut().take() {
            mark.release();
        }
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice of this length.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

impl<T: Pod> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.len)
            .field("kind", &self.kind)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// SAFETY: DeviceBuffer owns its allocation like a Box<[T]>; concurrent access is
// mediated by the fence and by the work graph's stream ordering.
unsafe impl<T: Pod + Send> Send for DeviceBuffer<T> {}
unsafe impl<T: Pod + Sync> Sync for DeviceBuffer<T> {}

/// Guard held by an enqueued operation for as long as it may touch a buffer.
pub struct DeviceUse<T: Pod> {
    buffer: Arc<DeviceBuffer<T>>,
}

impl<T: Pod> DeviceUse<T> {
    /// The guarded buffer.
    #[inline]
    pub fn buffer(&self) -> &DeviceBuffer<T> {
        &self.buffer
    }

    /// Copy all of `src` into this buffer.
    ///
    /// # Safety
    ///
    /// Must only be called from inside the enqueued operation holding both
    /// guards, where stream ordering excludes other writers.
    pub unsafe fn copy_from(&self, src: &DeviceUse<T>) {
        let n = self.buffer.len.min(src.buffer.len);
        debug_assert_eq!(self.buffer.len, src.buffer.len);
        // SAFETY: both allocations hold at least `n` scalars and are distinct.
        unsafe {
            std::ptr::copy_nonoverlapping(src.buffer.as_ptr(), self.buffer.as_ptr(), n);
        }
    }
}

impl<T: Pod> Clone for DeviceUse<T> {
    fn clone(&self) -> Self {
        self.buffer.begin_device_use()
    }
}

impl<T: Pod> fmt::Debug for DeviceUse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceUse").field(&self.buffer).finish()
    }
}

impl<T: Pod> Drop for DeviceUse<T> {
    fn drop(&mut self) {
        let mut in_flight = self.buffer.fence.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.buffer.fence.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zeroed_allocation() {
        let buf = DeviceBuffer::<f32>::zeroed(16, MemoryKind::Device);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.size_bytes(), 64);
        assert_eq!(buf.kind(), MemoryKind::Device);
        assert!(buf.host_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_empty_allocation() {
        let buf = DeviceBuffer::<u64>::zeroed(0, MemoryKind::Staging);
        assert!(buf.is_empty());
        assert!(buf.to_vec().is_empty());
    }

    #[test]
    fn test_from_vec_round_trip() {
        let buf = DeviceBuffer::from_vec(vec![1i32, 2, 3], MemoryKind::Staging);
        assert_eq!(buf.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_copy_between_buffers() {
        let src = Arc::new(DeviceBuffer::from_vec(vec![4u32, 5, 6], MemoryKind::Staging));
        let dst = Arc::new(DeviceBuffer::<u32>::zeroed(3, MemoryKind::Device));

        {
            let s = src.begin_device_use();
            let d = dst.begin_device_use();
            assert_eq!(dst.in_flight(), 1);
            unsafe { d.copy_from(&s) };
        }

        assert_eq!(dst.in_flight(), 0);
        assert_eq!(dst.to_vec(), vec![4, 5, 6]);
    }

    #[test]
    fn test_cloned_guard_counts_separately() {
        let buf = Arc::new(DeviceBuffer::<u16>::zeroed(2, MemoryKind::Device));
        let first = buf.begin_device_use();
        let second = first.clone();
        assert_eq!(buf.in_flight(), 2);
        drop(first);
        assert_eq!(buf.in_flight(), 1);
        drop(second);
        assert_eq!(buf.in_flight(), 0);
    }

    #[test]
    fn test_host_access_waits_for_device_use() {
        let buf = Arc::new(DeviceBuffer::<u8>::zeroed(4, MemoryKind::Device));
        let guard = buf.begin_device_use();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            unsafe { *guard.buffer().as_ptr() = 9 };
            drop(guard);
        });

        assert_eq!(buf.host_slice()[0], 9);
        worker.join().unwrap();
    }
}
