//! Strided layout mappings.
//!
//! A layout mapping turns a multi-dimensional coordinate into an offset into
//! flat storage. Every mapping here is strided: `offset = Σ idx[d] * stride[d]`.
//! Row-major ([`LayoutPolicy::Right`]) and column-major ([`LayoutPolicy::Left`])
//! mappings are exhaustive; mappings produced by [`StridedMapping::submapping`]
//! or [`StridedMapping::with_strides`] may have gaps.

use std::fmt;
use std::ops::Range;

use crate::error::{GridworkError, Result};

/// Per-axis sizes of a rank `R` index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extents<const R: usize>([usize; R]);

impl<const R: usize> Extents<R> {
    /// Create extents from per-axis sizes.
    pub const fn new(extents: [usize; R]) -> Self {
        Self(extents)
    }

    /// Extents with every axis equal to `dim`.
    pub const fn geometric(dim: usize) -> Self {
        Self([dim; R])
    }

    /// Number of axes.
    pub const fn rank(&self) -> usize {
        R
    }

    /// Size of axis `d`.
    #[inline]
    pub fn extent(&self, d: usize) -> usize {
        self.0[d]
    }

    /// Total number of coordinates (1 for rank 0).
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Check whether a coordinate lies inside the extents.
    #[inline]
    pub fn contains(&self, idx: &[usize; R]) -> bool {
        idx.iter().zip(self.0.iter()).all(|(i, e)| i < e)
    }

    /// Extents as an array.
    pub const fn as_array(&self) -> [usize; R] {
        self.0
    }
}

impl<const R: usize> From<[usize; R]> for Extents<R> {
    fn from(extents: [usize; R]) -> Self {
        Self(extents)
    }
}

impl<const R: usize> fmt::Display for Extents<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", parts.join("x"))
    }
}

/// Ordering of strides for exhaustive mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutPolicy {
    /// Row-major: the last axis has stride 1.
    #[default]
    Right,
    /// Column-major: the first axis has stride 1.
    Left,
}

/// A strided mapping from rank `R` coordinates to flat offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedMapping<const R: usize> {
    extents: Extents<R>,
    strides: [usize; R],
}

impl<const R: usize> StridedMapping<R> {
    /// Row-major mapping over `extents`.
    pub fn layout_right(extents: impl Into<Extents<R>>) -> Self {
        let extents = extents.into();
        let mut strides = [0; R];
        let mut stride = 1;
        for d in (0..R).rev() {
            strides[d] = stride;
            stride *= extents.extent(d);
        }
        Self { extents, strides }
    }

    /// Column-major mapping over `extents`.
    pub fn layout_left(extents: impl Into<Extents<R>>) -> Self {
        let extents = extents.into();
        let mut strides = [0; R];
        let mut stride = 1;
        for (d, s) in strides.iter_mut().enumerate() {
            *s = stride;
            stride *= extents.extent(d);
        }
        Self { extents, strides }
    }

    /// Exhaustive mapping following `policy`.
    pub fn from_policy(extents: impl Into<Extents<R>>, policy: LayoutPolicy) -> Self {
        match policy {
            LayoutPolicy::Right => Self::layout_right(extents),
            LayoutPolicy::Left => Self::layout_left(extents),
        }
    }

    /// Mapping with explicit strides.
    pub fn with_strides(extents: impl Into<Extents<R>>, strides: [usize; R]) -> Self {
        Self {
            extents: extents.into(),
            strides,
        }
    }

    /// Extents of the mapped index space.
    #[inline]
    pub fn extents(&self) -> Extents<R> {
        self.extents
    }

    /// All strides.
    #[inline]
    pub fn strides(&self) -> [usize; R] {
        self.strides
    }

    /// Stride of axis `d`.
    #[inline]
    pub fn stride(&self, d: usize) -> usize {
        self.strides[d]
    }

    /// Number of coordinates in the mapped index space.
    #[inline]
    pub fn size(&self) -> usize {
        self.extents.size()
    }

    /// Smallest storage length that holds every mapped offset.
    pub fn required_span_size(&self) -> usize {
        if self.size() == 0 {
            return 0;
        }
        1 + self
            .extents
            .as_array()
            .iter()
            .zip(self.strides.iter())
            .map(|(e, s)| (e - 1) * s)
            .sum::<usize>()
    }

    /// Offset of `idx` without bounds checking.
    #[inline]
    pub fn offset(&self, idx: [usize; R]) -> usize {
        idx.iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Offset of `idx`, or `None` when it lies outside the extents.
    #[inline]
    pub fn checked_offset(&self, idx: [usize; R]) -> Option<usize> {
        self.extents.contains(&idx).then(|| self.offset(idx))
    }

    /// True when every offset below the required span is mapped to.
    pub fn is_exhaustive(&self) -> bool {
        self.required_span_size() == self.size()
    }

    /// True when distinct coordinates map to distinct offsets.
    pub fn is_unique(&self) -> bool {
        let mut axes: Vec<usize> = (0..R).filter(|&d| self.extents.extent(d) > 1).collect();
        if axes.is_empty() || self.size() == 0 {
            return true;
        }
        axes.sort_by_key(|&d| self.strides[d]);

        if self.strides[axes[0]] == 0 {
            return false;
        }
        axes.windows(2).all(|w| {
            let (inner, outer) = (w[0], w[1]);
            self.strides[outer] >= self.strides[inner] * self.extents.extent(inner)
        })
    }

    /// Restrict axis `dim` to `range`.
    ///
    /// Returns the narrowed mapping together with the offset of its origin in
    /// the parent mapping.
    pub fn submapping(&self, dim: usize, range: Range<usize>) -> Result<(Self, usize)> {
        let extent = if dim < R { self.extents.extent(dim) } else { 0 };
        if dim >= R || range.start > range.end || range.end > extent {
            return Err(GridworkError::InvalidSlice {
                dim,
                start: range.start,
                end: range.end,
                extent,
            });
        }

        let mut extents = self.extents.as_array();
        extents[dim] = range.end - range.start;
        let base = range.start * self.strides[dim];

        Ok((
            Self {
                extents: Extents::new(extents),
                strides: self.strides,
            },
            base,
        ))
    }
}
