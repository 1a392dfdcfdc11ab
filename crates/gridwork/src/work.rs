//! Work nodes: lineages of asynchronous device operations.
//!
//! A [`WorkNode`] owns one pooled stream. Every chaining method enqueues one
//! operation on that stream and returns the node again, so everything issued
//! through a node runs after everything issued before it. Lineages are joined
//! with [`when_all`] and forked with [`WorkNode::split`]; both insert device
//! events and never block the host. Only [`WorkNode::wait`] blocks.
//!
//! Operations that take a grid ([`WorkNode::for_each`] and the staging syncs)
//! are also ordered per buffer: a lineage touching a grid last used by
//! another lineage first waits for that lineage's work on it. Two lineages
//! may therefore share a grid without racing, though the order between them
//! follows the order the host enqueued in.
//!
//! ```
//! use gridwork::prelude::*;
//!
//! # fn main() -> gridwork::Result<()> {
//! let mut grid = Grid::<f32, 2, 1, 1>::new([8, 8]);
//! grid.staging_mds_mut().fill(7.0);
//!
//! let mut work = WorkNode::new()?;
//! work.sync_from_staging(&mut grid)?
//!     .for_each(&mut grid, |mut cell| cell[[0]] *= 6.0)?
//!     .sync_to_staging(&mut grid)?
//!     .wait()?;
//!
//! assert!(grid.staging_span().iter().all(|&v| v == 42.0));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::trace;

use gridwork_core::device::{same_runtime, DeviceOp, SharedRuntime, StreamId};
use gridwork_core::error::{GridworkError, Result};
use gridwork_core::index_space::IndexSpace;
use gridwork_core::memory::DeviceBuffer;

use crate::grid::Grid;
use crate::stream::{StreamHandle, StreamPool};
use crate::view::{ElementView, IndexDomain, ReadWrite};

/// Marker for kernels taking only the grid coordinate.
#[derive(Debug)]
pub struct GridIndexOnly;

/// Marker for kernels taking the grid and the element-local coordinate.
#[derive(Debug)]
pub struct WithElementIndex;

/// A per-cell kernel accepted by [`WorkNode::for_each_index`].
///
/// Implemented for `Fn([usize; G])`, invoked once per grid cell, and for
/// `Fn([usize; G], [usize; R])`, invoked once per element component of every
/// cell. The marker only selects the impl; closures need their argument
/// types spelled out so the shape can be inferred.
pub trait IndexKernel<const G: usize, const R: usize, Marker>: Send + Sync + 'static {
    /// Run the kernel for one grid cell.
    fn run_cell(&self, grid_idx: [usize; G], element: &IndexSpace<R>);
}

impl<F, const G: usize, const R: usize> IndexKernel<G, R, GridIndexOnly> for F
where
    F: Fn([usize; G]) + Send + Sync + 'static,
{
    #[inline]
    fn run_cell(&self, grid_idx: [usize; G], _element: &IndexSpace<R>) {
        self(grid_idx)
    }
}

impl<F, const G: usize, const R: usize> IndexKernel<G, R, WithElementIndex> for F
where
    F: Fn([usize; G], [usize; R]) + Send + Sync + 'static,
{
    #[inline]
    fn run_cell(&self, grid_idx: [usize; G], element: &IndexSpace<R>) {
        for element_idx in element {
            self(grid_idx, element_idx);
        }
    }
}

/// Ordered lineage of device work on one borrowed stream.
pub struct WorkNode {
    handle: StreamHandle,
    pool: Arc<StreamPool>,
}

impl WorkNode {
    /// Start a lineage on the global pool.
    pub fn new() -> Result<Self> {
        let pool = StreamPool::global()?;
        Self::from_pool(&pool)
    }

    /// Start a lineage on `pool`.
    pub fn from_pool(pool: &Arc<StreamPool>) -> Result<Self> {
        Ok(Self {
            handle: pool.get()?,
            pool: Arc::clone(pool),
        })
    }

    /// The borrowed stream.
    pub fn stream(&self) -> Result<StreamId> {
        self.handle.get()
    }

    /// Runtime executing this lineage.
    pub fn runtime(&self) -> &SharedRuntime {
        self.handle.runtime()
    }

    /// Pool the stream was borrowed from.
    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    /// Apply `f` to the element view of every cell of the device buffer.
    pub fn for_each<T, F, const G: usize, const R: usize, const D: usize>(
        &mut self,
        grid: &mut Grid<T, G, R, D>,
        f: F,
    ) -> Result<&mut Self>
    where
        T: Pod + Send + Sync,
        F: Fn(ElementView<'_, T, ReadWrite, R>) + Send + Sync + 'static,
    {
        let view = grid.device_view();
        let in_flight = grid.begin_device_use();
        let cells = IndexSpace::new(&view.grid_mapping());

        let op = DeviceOp::for_each(cells.len(), move |n| {
            let _fenced = &in_flight;
            if let Some(idx) = cells.get(n) {
                // SAFETY: each invocation gets a distinct cell of a unique
                // grid mapping, and `f` only sees that cell. Other guarded
                // operations on the buffer are ordered before or after this
                // one, and host access waits on `in_flight`.
                if let Some(cell) = unsafe { view.element_mut(idx) } {
                    f(cell);
                }
            }
        });
        let [device, _] = grid.storages();
        self.enqueue_ordered(&[device], op)?;

        trace!(stream = %self.handle.get()?, cells = cells.len(), "enqueued for_each");
        Ok(self)
    }

    /// Invoke `kernel` once per grid coordinate of `domain`.
    ///
    /// `domain` only supplies the index space; the kernel reaches data through
    /// views it captured, usually a [`DeviceGridView`](crate::DeviceGridView)
    /// sliced like `domain`.
    pub fn for_each_index<K, M, const G: usize, const R: usize>(
        &mut self,
        domain: &impl IndexDomain<G, R>,
        kernel: K,
    ) -> Result<&mut Self>
    where
        K: IndexKernel<G, R, M>,
    {
        let cells = IndexSpace::new(&domain.grid_mapping());
        let element = IndexSpace::new(&domain.element_mapping());

        self.handle.on_stream()?.for_each(cells.len(), move |n| {
            if let Some(idx) = cells.get(n) {
                kernel.run_cell(idx, &element);
            }
        })?;

        trace!(stream = %self.handle.get()?, cells = cells.len(), "enqueued for_each_index");
        Ok(self)
    }

    /// Copy the whole device buffer into the staging buffer.
    pub fn sync_to_staging<T, const G: usize, const R: usize, const D: usize>(
        &mut self,
        grid: &mut Grid<T, G, R, D>,
    ) -> Result<&mut Self>
    where
        T: Pod + Send + Sync,
    {
        let (device, staging) = grid.begin_sync();
        let op = DeviceOp::task(move || {
            // SAFETY: ordered against every guarded operation on either
            // buffer while holding both guards.
            unsafe { staging.copy_from(&device) }
        });
        self.enqueue_ordered(&grid.storages(), op)?;
        Ok(self)
    }

    /// Copy the whole staging buffer into the device buffer.
    pub fn sync_from_staging<T, const G: usize, const R: usize, const D: usize>(
        &mut self,
        grid: &mut Grid<T, G, R, D>,
    ) -> Result<&mut Self>
    where
        T: Pod + Send + Sync,
    {
        let (device, staging) = grid.begin_sync();
        let op = DeviceOp::task(move || {
            // SAFETY: as in `sync_to_staging`.
            unsafe { device.copy_from(&staging) }
        });
        self.enqueue_ordered(&grid.storages(), op)?;
        Ok(self)
    }

    /// Enqueue `op` after earlier work on `buffers` from any lineage, then
    /// mark this lineage as their last user.
    fn enqueue_ordered<T: Pod>(&self, buffers: &[Arc<DeviceBuffer<T>>], op: DeviceOp) -> Result<()> {
        let stream = self.handle.get()?;
        let runtime = self.handle.runtime();

        for buffer in buffers {
            buffer.order_after_last_use(runtime, stream)?;
        }
        self.handle.on_stream()?.launch(op)?;
        for buffer in buffers {
            buffer.mark_use(runtime, stream)?;
        }
        Ok(())
    }

    /// Block until everything enqueued on this lineage has completed.
    pub fn wait(&self) -> Result<()> {
        self.handle.wait()
    }

    /// Fork `N` new lineages that all start after the current frontier.
    ///
    /// The branches are not ordered among each other and this node stays
    /// usable. Branches are plain nodes and can be split again.
    pub fn split<const N: usize>(&mut self) -> Result<[WorkNode; N]> {
        const { assert!(N > 0, "split needs at least one branch") };

        let runtime = Arc::clone(self.runtime());
        let event = runtime.create_event()?;
        runtime.record_event(event, self.stream()?)?;

        let mut branches = Vec::with_capacity(N);
        for _ in 0..N {
            let branch = WorkNode::from_pool(&self.pool)?;
            runtime.stream_wait_event(branch.stream()?, event)?;
            branches.push(branch);
        }

        runtime.destroy_event(event)?;
        trace!(stream = %self.stream()?, branches = N, "split lineage");

        branches
            .try_into()
            .map_err(|_| GridworkError::Internal("split produced wrong branch count".to_string()))
    }
}

impl fmt::Debug for WorkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkNode")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Join lineages: afterwards, work continued on any of `nodes` first waits
/// for everything already enqueued on all of them.
///
/// Every node stays alive and keeps its own stream.
pub fn when_all<const N: usize>(nodes: [&mut WorkNode; N]) -> Result<()> {
    const { assert!(N > 0, "when_all needs at least one work node") };

    let runtime = Arc::clone(nodes[0].runtime());
    if nodes.iter().any(|node| !same_runtime(node.runtime(), &runtime)) {
        return Err(GridworkError::RuntimeMismatch);
    }

    let streams = nodes
        .iter()
        .map(|node| node.stream())
        .collect::<Result<Vec<_>>>()?;

    let events = streams
        .iter()
        .map(|_| runtime.create_event())
        .collect::<Result<Vec<_>>>()?;

    for (&event, &stream) in events.iter().zip(&streams) {
        runtime.record_event(event, stream)?;
    }
    for &stream in &streams {
        for &event in &events {
            runtime.stream_wait_event(stream, event)?;
        }
    }
    for event in events {
        runtime.destroy_event(event)?;
    }

    trace!(nodes = N, "joined lineages");
    Ok(())
}
