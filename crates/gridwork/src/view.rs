//! Composed two-level grid views.
//!
//! A grid buffer stores one flat allocation for a grid of small
//! multi-dimensional elements. Indexing a [`GridView`] by a grid coordinate
//! yields an [`ElementView`]; indexing that by an element-local coordinate
//! yields a scalar. Components are interleaved: the scalar at `(g, e)` lives at
//!
//! ```text
//! element_offset(e) * grid_span + grid_offset(g)
//! ```
//!
//! so each element component is contiguous across the whole grid.
//!
//! Access rights are carried by a type parameter instead of separate const and
//! mutable view types: [`ReadOnly`] views hand out `&T`, [`ReadWrite`] views
//! also hand out `&mut T`.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut, Range};
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;

use gridwork_core::error::{GridworkError, Result};
use gridwork_core::index_space::IndexSpace;
use gridwork_core::layout::{Extents, StridedMapping};
use gridwork_core::memory::DeviceBuffer;

mod sealed {
    pub trait Sealed {}
}

/// Access capability of a view.
pub trait Access: sealed::Sealed + 'static {}

/// Shared, read-only access.
#[derive(Debug, Clone, Copy)]
pub struct ReadOnly;

/// Exclusive, read-write access.
#[derive(Debug, Clone, Copy)]
pub struct ReadWrite;

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for ReadWrite {}
impl Access for ReadOnly {}
impl Access for ReadWrite {}

/// Anything that describes a grid index space with per-cell elements.
pub trait IndexDomain<const G: usize, const R: usize> {
    /// Mapping of grid coordinates.
    fn grid_mapping(&self) -> StridedMapping<G>;

    /// Mapping of element-local coordinates.
    fn element_mapping(&self) -> StridedMapping<R>;
}

/// Flat placement of a (possibly sliced) grid inside its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement<const G: usize, const R: usize> {
    grid: StridedMapping<G>,
    element: StridedMapping<R>,
    /// Required span of the unsliced grid mapping; stride between components.
    grid_span: usize,
    /// Offset of the view's origin.
    base: usize,
}

impl<const G: usize, const R: usize> Placement<G, R> {
    /// Offset of component 0 of a cell. Cells of an empty element own no
    /// storage and all resolve to offset 0.
    fn cell_offset(&self, grid_idx: [usize; G]) -> Option<usize> {
        let offset = self.grid.checked_offset(grid_idx)?;
        if self.element.size() == 0 {
            return Some(0);
        }
        Some(self.base + offset)
    }

    fn offset(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> Option<usize> {
        let cell = self.cell_offset(grid_idx)?;
        let component = self.element.checked_offset(element_idx)?;
        Some(component * self.grid_span + cell)
    }

    fn slice(&self, dim: usize, range: Range<usize>) -> Result<Self> {
        let (grid, base) = self.grid.submapping(dim, range)?;
        Ok(Self {
            grid,
            base: self.base + base,
            ..*self
        })
    }
}

/// View of one grid cell's element.
pub struct ElementView<'a, T, A: Access, const R: usize> {
    /// Points at component 0 of this cell.
    ptr: NonNull<T>,
    element: StridedMapping<R>,
    grid_span: usize,
    _marker: PhantomData<(&'a T, A)>,
}

impl<'a, T, A: Access, const R: usize> ElementView<'a, T, A, R> {
    /// # Safety
    ///
    /// `ptr` must address component 0 of a cell such that every mapped
    /// component offset times `grid_span` stays inside the allocation for `'a`,
    /// and the access rights of `A` must be upheld for `'a`.
    unsafe fn from_raw(ptr: *mut T, element: StridedMapping<R>, grid_span: usize) -> Self {
        Self {
            // SAFETY: derived from a live allocation by the caller.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            element,
            grid_span,
            _marker: PhantomData,
        }
    }

    /// Element extents.
    pub fn extents(&self) -> Extents<R> {
        self.element.extents()
    }

    /// Element layout mapping.
    pub fn mapping(&self) -> StridedMapping<R> {
        self.element
    }

    /// Coordinates of the element in canonical order.
    pub fn index_space(&self) -> IndexSpace<R> {
        IndexSpace::new(&self.element)
    }

    fn component(&self, idx: [usize; R]) -> Option<*mut T> {
        let offset = self.element.checked_offset(idx)? * self.grid_span;
        // SAFETY: in bounds per the constructor contract.
        Some(unsafe { self.ptr.as_ptr().add(offset) })
    }

    /// Reference to a component, or `None` if out of bounds.
    pub fn get(&self, idx: [usize; R]) -> Option<&T> {
        // SAFETY: shared access is valid for every access mode.
        self.component(idx).map(|p| unsafe { &*p })
    }
}

impl<'a, T, const R: usize> ElementView<'a, T, ReadWrite, R> {
    /// Mutable reference to a component, or `None` if out of bounds.
    pub fn get_mut(&mut self, idx: [usize; R]) -> Option<&mut T> {
        // SAFETY: the view holds exclusive access to this cell.
        self.component(idx).map(|p| unsafe { &mut *p })
    }

    /// Downgrade to a read-only view.
    pub fn as_read_only(&self) -> ElementView<'_, T, ReadOnly, R> {
        // SAFETY: same cell, narrower rights, shorter lifetime.
        unsafe { ElementView::from_raw(self.ptr.as_ptr(), self.element, self.grid_span) }
    }
}

impl<T: Copy, A: Access, const R: usize> ElementView<'_, T, A, R> {
    /// Copy out every component in canonical order.
    pub fn to_vec(&self) -> Vec<T> {
        self.index_space().iter().map(|idx| self[idx]).collect()
    }
}

impl<T: Copy, const R: usize> ElementView<'_, T, ReadWrite, R> {
    /// Write `value` into every component.
    pub fn fill(&mut self, value: T) {
        for idx in self.index_space() {
            self[idx] = value;
        }
    }
}

impl<T, A: Access, const R: usize> Index<[usize; R]> for ElementView<'_, T, A, R> {
    type Output = T;

    fn index(&self, idx: [usize; R]) -> &T {
        match self.get(idx) {
            Some(v) => v,
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(idx, self.element.extents().as_array())
            ),
        }
    }
}

impl<T, const R: usize> IndexMut<[usize; R]> for ElementView<'_, T, ReadWrite, R> {
    fn index_mut(&mut self, idx: [usize; R]) -> &mut T {
        let extents = self.element.extents().as_array();
        match self.get_mut(idx) {
            Some(v) => v,
            None => panic!("{}", GridworkError::out_of_bounds(idx, extents)),
        }
    }
}

impl<T, const R: usize> Clone for ElementView<'_, T, ReadOnly, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const R: usize> Copy for ElementView<'_, T, ReadOnly, R> {}

impl<T, A: Access, const R: usize> fmt::Debug for ElementView<'_, T, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementView")
            .field("extents", &self.element.extents())
            .field("grid_span", &self.grid_span)
            .finish()
    }
}

/// Host view of a grid of elements.
pub struct GridView<'a, T, A: Access, const G: usize, const R: usize> {
    ptr: NonNull<T>,
    len: usize,
    placement: Placement<G, R>,
    _marker: PhantomData<(&'a T, A)>,
}

impl<'a, T, A: Access, const G: usize, const R: usize> GridView<'a, T, A, G, R> {
    /// # Safety
    ///
    /// `ptr` must be valid for `len` scalars for `'a` with the rights of `A`,
    /// and every offset of the placement must be below `len`.
    pub(crate) unsafe fn from_raw(
        ptr: *mut T,
        len: usize,
        grid: StridedMapping<G>,
        element: StridedMapping<R>,
    ) -> Self {
        Self {
            // SAFETY: derived from a live allocation by the caller.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            placement: Placement {
                grid,
                element,
                grid_span: grid.required_span_size(),
                base: 0,
            },
            _marker: PhantomData,
        }
    }

    /// Grid extents.
    pub fn extents(&self) -> Extents<G> {
        self.placement.grid.extents()
    }

    /// Element extents.
    pub fn element_extents(&self) -> Extents<R> {
        self.placement.element.extents()
    }

    /// Number of grid cells.
    pub fn len(&self) -> usize {
        self.placement.grid.size()
    }

    /// True when the view has no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid coordinates in canonical order.
    pub fn index_space(&self) -> IndexSpace<G> {
        IndexSpace::new(&self.placement.grid)
    }

    /// Restrict grid axis `dim` to `range`. Coordinates of the result are
    /// relative to `range.start`.
    pub fn slice(self, dim: usize, range: Range<usize>) -> Result<Self> {
        Ok(Self {
            placement: self.placement.slice(dim, range)?,
            ..self
        })
    }

    fn cell_ptr(&self, grid_idx: [usize; G]) -> Option<*mut T> {
        let offset = self.placement.cell_offset(grid_idx)?;
        debug_assert!(offset < self.len || self.placement.element.size() == 0);
        // SAFETY: the placement keeps cell offsets inside the allocation.
        Some(unsafe { self.ptr.as_ptr().add(offset) })
    }

    fn scalar_ptr(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> Option<*mut T> {
        let offset = self.placement.offset(grid_idx, element_idx)?;
        debug_assert!(offset < self.len);
        // SAFETY: as above.
        Some(unsafe { self.ptr.as_ptr().add(offset) })
    }

    /// Element view of one cell, or `None` if out of bounds.
    pub fn get(&self, grid_idx: [usize; G]) -> Option<ElementView<'_, T, ReadOnly, R>> {
        let p = self.cell_ptr(grid_idx)?;
        // SAFETY: the cell lies inside the viewed allocation.
        Some(unsafe {
            ElementView::from_raw(p, self.placement.element, self.placement.grid_span)
        })
    }

    /// Element view of one cell.
    ///
    /// # Panics
    ///
    /// Panics if `grid_idx` is out of bounds.
    pub fn at(&self, grid_idx: [usize; G]) -> ElementView<'_, T, ReadOnly, R> {
        match self.get(grid_idx) {
            Some(v) => v,
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(grid_idx, self.extents().as_array())
            ),
        }
    }

    /// Read-only reborrow.
    pub fn as_read_only(&self) -> GridView<'_, T, ReadOnly, G, R> {
        GridView {
            ptr: self.ptr,
            len: self.len,
            placement: self.placement,
            _marker: PhantomData,
        }
    }
}

impl<'a, T, const G: usize, const R: usize> GridView<'a, T, ReadWrite, G, R> {
    /// Mutable element view of one cell, or `None` if out of bounds.
    pub fn get_mut(&mut self, grid_idx: [usize; G]) -> Option<ElementView<'_, T, ReadWrite, R>> {
        let p = self.cell_ptr(grid_idx)?;
        // SAFETY: the cell lies inside the allocation this view borrows
        // exclusively, and the returned view borrows `self` mutably.
        Some(unsafe {
            ElementView::from_raw(p, self.placement.element, self.placement.grid_span)
        })
    }

    /// Mutable element view of one cell.
    ///
    /// # Panics
    ///
    /// Panics if `grid_idx` is out of bounds.
    pub fn at_mut(&mut self, grid_idx: [usize; G]) -> ElementView<'_, T, ReadWrite, R> {
        let extents = self.extents().as_array();
        match self.get_mut(grid_idx) {
            Some(v) => v,
            None => panic!("{}", GridworkError::out_of_bounds(grid_idx, extents)),
        }
    }

    /// Give up write access.
    pub fn into_read_only(self) -> GridView<'a, T, ReadOnly, G, R> {
        GridView {
            ptr: self.ptr,
            len: self.len,
            placement: self.placement,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy, const G: usize, const R: usize> GridView<'_, T, ReadWrite, G, R> {
    /// Write `value` into every component of every cell in the view.
    pub fn fill(&mut self, value: T) {
        for g in self.index_space() {
            self.at_mut(g).fill(value);
        }
    }
}

impl<T, A: Access, const G: usize, const R: usize> Index<([usize; G], [usize; R])>
    for GridView<'_, T, A, G, R>
{
    type Output = T;

    fn index(&self, (g, e): ([usize; G], [usize; R])) -> &T {
        match self.scalar_ptr(g, e) {
            // SAFETY: shared access is valid for every access mode.
            Some(p) => unsafe { &*p },
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(g, self.extents().as_array())
            ),
        }
    }
}

impl<T, const G: usize, const R: usize> IndexMut<([usize; G], [usize; R])>
    for GridView<'_, T, ReadWrite, G, R>
{
    fn index_mut(&mut self, (g, e): ([usize; G], [usize; R])) -> &mut T {
        match self.scalar_ptr(g, e) {
            // SAFETY: this view borrows the allocation exclusively.
            Some(p) => unsafe { &mut *p },
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(g, self.extents().as_array())
            ),
        }
    }
}

impl<T, const G: usize, const R: usize> Clone for GridView<'_, T, ReadOnly, G, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const G: usize, const R: usize> Copy for GridView<'_, T, ReadOnly, G, R> {}

impl<T, A: Access, const G: usize, const R: usize> IndexDomain<G, R> for GridView<'_, T, A, G, R> {
    fn grid_mapping(&self) -> StridedMapping<G> {
        self.placement.grid
    }

    fn element_mapping(&self) -> StridedMapping<R> {
        self.placement.element
    }
}

impl<T, A: Access, const G: usize, const R: usize> fmt::Debug for GridView<'_, T, A, G, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridView")
            .field("extents", &self.extents())
            .field("element_extents", &self.element_extents())
            .field("base", &self.placement.base)
            .finish()
    }
}

/// Owned grid view that can be moved into device operations.
///
/// Keeps the storage allocation alive but does not order anything: holding a
/// view never blocks host accessors, and the work graph cannot see which
/// operations use it. Scalar access is therefore `unsafe`. Callers must make
/// sure that, while an operation touches a cell through the view, no other
/// lineage and no host accessor writes that cell, and for writes that nothing
/// else reads it either. Ordering the operation with [`WorkNode::wait`],
/// [`when_all`] or [`WorkNode::split`] against other users of the grid
/// satisfies this.
///
/// [`WorkNode::wait`]: crate::WorkNode::wait
/// [`WorkNode::split`]: crate::WorkNode::split
/// [`when_all`]: crate::when_all
pub struct DeviceGridView<T: Pod, const G: usize, const R: usize> {
    storage: Arc<DeviceBuffer<T>>,
    placement: Placement<G, R>,
}

impl<T: Pod, const G: usize, const R: usize> DeviceGridView<T, G, R> {
    pub(crate) fn new(
        storage: Arc<DeviceBuffer<T>>,
        grid: StridedMapping<G>,
        element: StridedMapping<R>,
    ) -> Self {
        Self {
            storage,
            placement: Placement {
                grid,
                element,
                grid_span: grid.required_span_size(),
                base: 0,
            },
        }
    }

    /// Grid extents.
    pub fn extents(&self) -> Extents<G> {
        self.placement.grid.extents()
    }

    /// Element extents.
    pub fn element_extents(&self) -> Extents<R> {
        self.placement.element.extents()
    }

    /// Restrict grid axis `dim` to `range`.
    pub fn slice(self, dim: usize, range: Range<usize>) -> Result<Self> {
        Ok(Self {
            placement: self.placement.slice(dim, range)?,
            storage: self.storage,
        })
    }

    fn ptr(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> Option<*mut T> {
        let offset = self.placement.offset(grid_idx, element_idx)?;
        debug_assert!(offset < self.storage.len());
        // SAFETY: placement offsets stay inside the storage.
        Some(unsafe { self.storage.as_ptr().add(offset) })
    }

    /// Read one scalar, or `None` if out of bounds.
    ///
    /// # Safety
    ///
    /// Nothing may write the scalar concurrently: no unordered lineage, no
    /// host accessor and no invocation of the same operation.
    pub unsafe fn get(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> Option<T> {
        // SAFETY: Pod read; concurrent writers are excluded by the caller.
        self.ptr(grid_idx, element_idx).map(|p| unsafe { p.read() })
    }

    /// Read one scalar.
    ///
    /// # Safety
    ///
    /// Same contract as [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if either index is out of bounds.
    pub unsafe fn at(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> T {
        // SAFETY: forwarded to the caller.
        match unsafe { self.get(grid_idx, element_idx) } {
            Some(v) => v,
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(grid_idx, self.extents().as_array())
            ),
        }
    }

    /// Mutable reference to one scalar.
    ///
    /// # Safety
    ///
    /// Nothing else may read or write the scalar while the returned reference
    /// is used, on any thread and through any view or host accessor.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of bounds.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn at_mut(&self, grid_idx: [usize; G], element_idx: [usize; R]) -> &mut T {
        match self.ptr(grid_idx, element_idx) {
            // SAFETY: exclusivity is guaranteed by the caller.
            Some(p) => unsafe { &mut *p },
            None => panic!(
                "{}",
                GridworkError::out_of_bounds(grid_idx, self.extents().as_array())
            ),
        }
    }

    /// Write one scalar.
    ///
    /// # Safety
    ///
    /// Same contract as [`at_mut`](Self::at_mut).
    pub unsafe fn set(&self, grid_idx: [usize; G], element_idx: [usize; R], value: T) {
        // SAFETY: forwarded to the caller.
        unsafe { *self.at_mut(grid_idx, element_idx) = value };
    }

    /// Read-only element view of one cell.
    ///
    /// # Safety
    ///
    /// Nothing may write the cell while the returned view is used.
    pub unsafe fn element(&self, grid_idx: [usize; G]) -> Option<ElementView<'_, T, ReadOnly, R>> {
        let offset = self.placement.cell_offset(grid_idx)?;
        // SAFETY: the cell lies inside the storage held by `self`; writers are
        // excluded by the caller.
        Some(unsafe {
            ElementView::from_raw(
                self.storage.as_ptr().add(offset),
                self.placement.element,
                self.placement.grid_span,
            )
        })
    }

    /// Writable element view of one cell.
    ///
    /// # Safety
    ///
    /// No other view or reference to the same cell may be alive while the
    /// returned view is used.
    pub(crate) unsafe fn element_mut(
        &self,
        grid_idx: [usize; G],
    ) -> Option<ElementView<'_, T, ReadWrite, R>> {
        let offset = self.placement.cell_offset(grid_idx)?;
        // SAFETY: in bounds; exclusivity is guaranteed by the caller.
        Some(unsafe {
            ElementView::from_raw(
                self.storage.as_ptr().add(offset),
                self.placement.element,
                self.placement.grid_span,
            )
        })
    }
}

impl<T: Pod, const G: usize, const R: usize> Clone for DeviceGridView<T, G, R> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            placement: self.placement,
        }
    }
}

impl<T: Pod, const G: usize, const R: usize> IndexDomain<G, R> for DeviceGridView<T, G, R> {
    fn grid_mapping(&self) -> StridedMapping<G> {
        self.placement.grid
    }

    fn element_mapping(&self) -> StridedMapping<R> {
        self.placement.element
    }
}

impl<T: Pod, const G: usize, const R: usize> fmt::Debug for DeviceGridView<T, G, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGridView")
            .field("extents", &self.extents())
            .field("element_extents", &self.element_extents())
            .field("kind", &self.storage.kind())
            .finish()
    }
}
