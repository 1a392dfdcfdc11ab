//! Device grid with a host staging mirror.

use std::sync::Arc;

use bytemuck::Pod;

use gridwork_core::error::Result;
use gridwork_core::layout::{Extents, LayoutPolicy, StridedMapping};
use gridwork_core::math::geometric_span;
use gridwork_core::memory::{DeviceBuffer, DeviceUse, MemoryKind};

use crate::buffer::GridBuffer;
use crate::view::{DeviceGridView, GridView, IndexDomain, ReadOnly, ReadWrite};

/// A grid of rank `G` whose cells are rank `R` elements with every axis of
/// size `D`, stored on the device and mirrored in a staging buffer.
///
/// Both buffers always have the same grid extents. Data moves between them
/// only through [`WorkNode::sync_to_staging`](crate::WorkNode::sync_to_staging)
/// and [`WorkNode::sync_from_staging`](crate::WorkNode::sync_from_staging).
///
/// ```
/// use gridwork::prelude::*;
///
/// // 4x4 grid of 3-vectors
/// let grid = Grid::<f32, 2, 1, 3>::new([4, 4]);
/// assert_eq!(grid.extents(), Extents::new([4, 4]));
/// assert_eq!(grid.element_extents(), Extents::new([3]));
/// ```
pub struct Grid<T: Pod, const G: usize, const R: usize, const D: usize> {
    device: GridBuffer<T, G, R>,
    staging: GridBuffer<T, G, R>,
}

impl<T: Pod, const G: usize, const R: usize, const D: usize> Grid<T, G, R, D> {
    /// Scalars per element: `D` to the power `R`.
    pub const ELEMENT_SPAN: usize = geometric_span(R, D);

    /// Create a zeroed grid with row-major grid layout.
    pub fn new(extents: impl Into<Extents<G>>) -> Self {
        Self::with_layout(extents, LayoutPolicy::Right)
    }

    /// Create a zeroed grid with the given grid layout.
    pub fn with_layout(extents: impl Into<Extents<G>>, policy: LayoutPolicy) -> Self {
        let extents = extents.into();
        let element = Extents::<R>::geometric(D);
        debug_assert_eq!(element.size(), Self::ELEMENT_SPAN);
        Self {
            device: GridBuffer::new(extents, element, policy, MemoryKind::Device),
            staging: GridBuffer::new(extents, element, policy, MemoryKind::Staging),
        }
    }

    /// Grid extents.
    pub fn extents(&self) -> Extents<G> {
        self.device.extents()
    }

    /// Element extents (`[D; R]`).
    pub fn element_extents(&self) -> Extents<R> {
        self.device.element_extents()
    }

    /// Scalars per buffer.
    pub fn len(&self) -> usize {
        self.device.len()
    }

    /// True when the grid holds no scalars.
    pub fn is_empty(&self) -> bool {
        self.device.is_empty()
    }

    /// Read-only view of the device buffer.
    pub fn mds(&self) -> GridView<'_, T, ReadOnly, G, R> {
        self.device.mds()
    }

    /// Read-write view of the device buffer.
    pub fn mds_mut(&mut self) -> GridView<'_, T, ReadWrite, G, R> {
        self.device.mds_mut()
    }

    /// Read-only view of the staging buffer.
    pub fn staging_mds(&self) -> GridView<'_, T, ReadOnly, G, R> {
        self.staging.mds()
    }

    /// Read-write view of the staging buffer.
    pub fn staging_mds_mut(&mut self) -> GridView<'_, T, ReadWrite, G, R> {
        self.staging.mds_mut()
    }

    /// Flat device storage.
    pub fn span(&self) -> &[T] {
        self.device.span()
    }

    /// Flat device storage, mutable.
    pub fn span_mut(&mut self) -> &mut [T] {
        self.device.span_mut()
    }

    /// Flat staging storage.
    pub fn staging_span(&self) -> &[T] {
        self.staging.span()
    }

    /// Flat staging storage, mutable.
    pub fn staging_span_mut(&mut self) -> &mut [T] {
        self.staging.span_mut()
    }

    /// Copy of the device storage.
    pub fn underlying_buffer(&self) -> Vec<T> {
        self.device.underlying_buffer()
    }

    /// Copy of the staging storage.
    pub fn underlying_staging_buffer(&self) -> Vec<T> {
        self.staging.underlying_buffer()
    }

    /// Replace the device storage. See [`GridBuffer::set_underlying_buffer`].
    pub fn set_underlying_buffer(&mut self, other: Vec<T>) -> Result<()> {
        self.device.set_underlying_buffer(other)
    }

    /// Replace the staging storage. See [`GridBuffer::set_underlying_buffer`].
    pub fn set_underlying_staging_buffer(&mut self, other: Vec<T>) -> Result<()> {
        self.staging.set_underlying_buffer(other)
    }

    /// Resize both buffers to `extents`; contents are reset to zero.
    pub fn invalidating_resize(&mut self, extents: impl Into<Extents<G>>) {
        let extents = extents.into();
        self.device.invalidating_resize(extents);
        self.staging.invalidating_resize(extents);
    }

    /// Owned view of the device buffer for capture in device operations.
    pub fn device_view(&mut self) -> DeviceGridView<T, G, R> {
        self.device.device_view()
    }

    /// Guards for a raw copy between the buffers, as `(device, staging)`.
    pub(crate) fn begin_sync(&mut self) -> (DeviceUse<T>, DeviceUse<T>) {
        (self.device.begin_device_use(), self.staging.begin_device_use())
    }

    /// Guard for an operation on the device buffer.
    pub(crate) fn begin_device_use(&mut self) -> DeviceUse<T> {
        self.device.begin_device_use()
    }

    /// Current device and staging allocations.
    pub(crate) fn storages(&self) -> [Arc<DeviceBuffer<T>>; 2] {
        [
            Arc::clone(self.device.storage()),
            Arc::clone(self.staging.storage()),
        ]
    }
}

impl<T: Pod, const G: usize, const R: usize, const D: usize> IndexDomain<G, R> for Grid<T, G, R, D> {
    fn grid_mapping(&self) -> StridedMapping<G> {
        self.device.grid_mapping()
    }

    fn element_mapping(&self) -> StridedMapping<R> {
        self.device.element_mapping()
    }
}

impl<T: Pod, const G: usize, const R: usize, const D: usize> std::fmt::Debug for Grid<T, G, R, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("device", &self.device)
            .field("staging", &self.staging)
            .finish()
    }
}
