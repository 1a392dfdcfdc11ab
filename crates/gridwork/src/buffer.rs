//! Grid buffers.
//!
//! A [`GridBuffer`] owns one flat allocation of
//! `element_span * grid_span` scalars together with the two layout mappings
//! that describe it. Host views borrow the buffer, so resizing or replacing
//! the storage (both need `&mut self`) statically ends every outstanding view.

use std::sync::Arc;

use bytemuck::Pod;
use tracing::trace;

use gridwork_core::error::{GridworkError, Result};
use gridwork_core::layout::{Extents, LayoutPolicy, StridedMapping};
use gridwork_core::memory::{DeviceBuffer, DeviceUse, MemoryKind};

use crate::view::{DeviceGridView, GridView, IndexDomain, ReadOnly, ReadWrite};

/// Flat storage for a grid of rank `G` whose cells are rank `R` elements.
pub struct GridBuffer<T: Pod, const G: usize, const R: usize> {
    storage: Arc<DeviceBuffer<T>>,
    grid: StridedMapping<G>,
    element: StridedMapping<R>,
    policy: LayoutPolicy,
}

impl<T: Pod, const G: usize, const R: usize> GridBuffer<T, G, R> {
    /// Allocate a zeroed buffer.
    ///
    /// The element layout is always row-major and therefore exhaustive.
    pub fn new(
        extents: impl Into<Extents<G>>,
        element_extents: impl Into<Extents<R>>,
        policy: LayoutPolicy,
        kind: MemoryKind,
    ) -> Self {
        let grid = StridedMapping::from_policy(extents, policy);
        let element = StridedMapping::layout_right(element_extents);
        debug_assert!(element.is_exhaustive());

        let len = element.required_span_size() * grid.required_span_size();
        Self {
            storage: Arc::new(DeviceBuffer::zeroed(len, kind)),
            grid,
            element,
            policy,
        }
    }

    /// Grid extents.
    pub fn extents(&self) -> Extents<G> {
        self.grid.extents()
    }

    /// Element extents.
    pub fn element_extents(&self) -> Extents<R> {
        self.element.extents()
    }

    /// Grid layout mapping.
    pub fn grid_mapping(&self) -> StridedMapping<G> {
        self.grid
    }

    /// Element layout mapping.
    pub fn element_mapping(&self) -> StridedMapping<R> {
        self.element
    }

    /// Grid layout policy.
    pub fn policy(&self) -> LayoutPolicy {
        self.policy
    }

    /// Storage length in scalars.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True for empty storage.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Memory kind of the storage.
    pub fn kind(&self) -> MemoryKind {
        self.storage.kind()
    }

    /// Read-only view.
    pub fn mds(&self) -> GridView<'_, T, ReadOnly, G, R> {
        let data = self.storage.host_slice();
        // SAFETY: `data` is borrowed from `self`. Host writers need `&mut self`,
        // guarded device operations are waited out by `host_slice`, and raw
        // device view access is excluded by its own contract.
        unsafe { GridView::from_raw(data.as_ptr() as *mut T, data.len(), self.grid, self.element) }
    }

    /// Read-write view.
    pub fn mds_mut(&mut self) -> GridView<'_, T, ReadWrite, G, R> {
        let (grid, element) = (self.grid, self.element);
        let data = self.span_mut();
        // SAFETY: `data` is an exclusive borrow of the whole storage.
        unsafe { GridView::from_raw(data.as_mut_ptr(), data.len(), grid, element) }
    }

    /// The whole storage as a slice.
    pub fn span(&self) -> &[T] {
        self.storage.host_slice()
    }

    /// The whole storage as a mutable slice.
    pub fn span_mut(&mut self) -> &mut [T] {
        // SAFETY: `&mut self` excludes other host views; guarded device
        // operations are waited out by `host_slice_mut`.
        unsafe { self.storage.host_slice_mut() }
    }

    /// Copy of the storage.
    pub fn underlying_buffer(&self) -> Vec<T> {
        self.storage.to_vec()
    }

    /// Replace the storage wholesale.
    ///
    /// Fails with [`GridworkError::LengthMismatch`] and leaves the buffer
    /// untouched when `other` has a different length.
    pub fn set_underlying_buffer(&mut self, other: Vec<T>) -> Result<()> {
        if other.len() != self.len() {
            return Err(GridworkError::LengthMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }

        self.storage.wait_idle();
        self.storage = Arc::new(DeviceBuffer::from_vec(other, self.kind()));
        trace!(len = self.len(), kind = %self.kind(), "replaced grid storage");
        Ok(())
    }

    /// Change the grid extents and reallocate zeroed storage to match.
    pub fn invalidating_resize(&mut self, extents: impl Into<Extents<G>>) {
        self.storage.wait_idle();
        self.grid = StridedMapping::from_policy(extents, self.policy);

        let len = self.element.required_span_size() * self.grid.required_span_size();
        self.storage = Arc::new(DeviceBuffer::zeroed(len, self.kind()));
        trace!(extents = %self.grid.extents(), len, "resized grid storage");
    }

    /// Owned view for capture by device operations.
    ///
    /// The view only keeps the allocation alive; host accessors do not wait
    /// for it. See [`DeviceGridView`] for the access contract.
    pub fn device_view(&mut self) -> DeviceGridView<T, G, R> {
        DeviceGridView::new(Arc::clone(&self.storage), self.grid, self.element)
    }

    /// Register a device operation touching the raw storage.
    pub(crate) fn begin_device_use(&mut self) -> DeviceUse<T> {
        self.storage.begin_device_use()
    }

    /// Current allocation.
    pub(crate) fn storage(&self) -> &Arc<DeviceBuffer<T>> {
        &self.storage
    }
}

impl<T: Pod, const G: usize, const R: usize> IndexDomain<G, R> for GridBuffer<T, G, R> {
    fn grid_mapping(&self) -> StridedMapping<G> {
        self.grid
    }

    fn element_mapping(&self) -> StridedMapping<R> {
        self.element
    }
}

impl<T: Pod, const G: usize, const R: usize> std::fmt::Debug for GridBuffer<T, G, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridBuffer")
            .field("extents", &self.extents())
            .field("element_extents", &self.element_extents())
            .field("policy", &self.policy)
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> GridBuffer<f32, 2, 1> {
        GridBuffer::new([3, 4], [2], LayoutPolicy::Right, MemoryKind::Staging)
    }

    #[test]
    fn test_storage_is_product_of_spans() {
        let buf = buffer();
        assert_eq!(buf.len(), 2 * 12);
        assert_eq!(buf.extents().as_array(), [3, 4]);
        assert_eq!(buf.element_extents().as_array(), [2]);
        assert!(buf.span().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_views_share_storage() {
        let mut buf = buffer();
        buf.mds_mut()[([2, 3], [1])] = 4.0;

        let view = buf.mds();
        assert_eq!(view[([2, 3], [1])], 4.0);
        assert_eq!(view.at([2, 3]).to_vec(), vec![0.0, 4.0]);
        assert_eq!(buf.span()[12 + 11], 4.0);
    }

    #[test]
    fn test_set_underlying_buffer() {
        let mut buf = buffer();
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        buf.set_underlying_buffer(data.clone()).unwrap();
        assert_eq!(buf.underlying_buffer(), data);
    }

    #[test]
    fn test_set_underlying_buffer_length_mismatch() {
        let mut buf = buffer();
        buf.span_mut()[0] = 1.0;

        let err = buf.set_underlying_buffer(vec![0.0; 5]).unwrap_err();
        assert!(matches!(
            err,
            GridworkError::LengthMismatch {
                expected: 24,
                actual: 5
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(buf.len(), 24);
        assert_eq!(buf.span()[0], 1.0);
    }

    #[test]
    fn test_invalidating_resize() {
        let mut buf = buffer();
        buf.invalidating_resize([5, 1]);
        assert_eq!(buf.extents().as_array(), [5, 1]);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.mds().extents().as_array(), [5, 1]);
    }

    #[test]
    fn test_device_view_does_not_block_host_access() {
        let mut buf = buffer();
        let view = buf.device_view();

        assert_eq!(buf.storage().in_flight(), 0);
        assert_eq!(buf.span().len(), 24);
        assert_eq!(buf.underlying_buffer().len(), 24);
        buf.invalidating_resize([1, 1]);
        assert_eq!(buf.len(), 2);

        // The view still owns the old allocation.
        assert_eq!(view.extents().as_array(), [3, 4]);
        drop(view);
    }

    #[test]
    fn test_column_major_grid() {
        let mut buf: GridBuffer<u8, 2, 0> =
            GridBuffer::new([2, 3], [], LayoutPolicy::Left, MemoryKind::Staging);
        buf.mds_mut()[([1, 0], [])] = 9;
        assert_eq!(buf.span()[1], 9);
        assert_eq!(buf.grid_mapping().strides(), [1, 2]);
    }
}
