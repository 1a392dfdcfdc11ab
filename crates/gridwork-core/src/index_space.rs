//! Canonical-order enumeration of a strided mapping's index space.
//!
//! For each axis `d` a divider is computed such that
//! `coordinate[d] = (n / divider[d]) % extent[d]` for the `n`-th coordinate.
//! Dividers come from sorting the axes by ascending stride and taking an
//! exclusive running product of their extents, so the enumeration order
//! follows memory order for any strided mapping, not only row-major ones.
//!
//! [`IndexSpace`] stores only dividers and extents. It is `Copy` and can be
//! moved into device operations and decoded there without a coordinate table.
//!
//! ```
//! use gridwork_core::index_space::IndexSpace;
//! use gridwork_core::layout::StridedMapping;
//!
//! let space = IndexSpace::new(&StridedMapping::layout_left([2, 2]));
//! let order: Vec<_> = space.iter().collect();
//! assert_eq!(order, vec![[0, 0], [1, 0], [0, 1], [1, 1]]);
//! ```

use std::cmp::Ordering;
use std::iter::FusedIterator;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use rayon::prelude::*;

use crate::layout::{Extents, StridedMapping};

/// Random-access sequence of every coordinate of a mapping, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpace<const R: usize> {
    dividers: [usize; R],
    extents: [usize; R],
    len: usize,
}

impl<const R: usize> IndexSpace<R> {
    /// Build the index space of `mapping`.
    pub fn new(mapping: &StridedMapping<R>) -> Self {
        let extents = mapping.extents().as_array();

        let mut ordinals: [usize; R] = std::array::from_fn(|d| d);
        ordinals.sort_by_key(|&d| mapping.stride(d));

        let mut dividers = [0; R];
        let mut running = 1;
        for &d in &ordinals {
            dividers[d] = running;
            running *= extents[d];
        }

        Self {
            dividers,
            extents,
            len: mapping.size(),
        }
    }

    /// Row-major index space over `extents`.
    pub fn from_extents(extents: impl Into<Extents<R>>) -> Self {
        Self::new(&StridedMapping::layout_right(extents))
    }

    /// Number of coordinates.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when some extent is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Dividers per axis.
    pub fn dividers(&self) -> [usize; R] {
        self.dividers
    }

    /// The `n`-th coordinate, or `None` past the end.
    #[inline]
    pub fn get(&self, n: usize) -> Option<[usize; R]> {
        (n < self.len).then(|| self.decode(n))
    }

    #[inline]
    fn decode(&self, n: usize) -> [usize; R] {
        std::array::from_fn(|d| (n / self.dividers[d]) % self.extents[d])
    }

    /// Iterate over all coordinates.
    pub fn iter(&self) -> Iter<R> {
        Iter {
            space: *self,
            front: 0,
            back: self.len,
        }
    }

    /// Parallel iteration over all coordinates.
    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = [usize; R]> {
        let space = *self;
        (0..self.len).into_par_iter().map(move |n| space.decode(n))
    }

    /// Cursor positioned at `n`.
    pub fn cursor(&self, n: usize) -> IndexCursor<R> {
        IndexCursor {
            space: *self,
            pos: n,
        }
    }

    /// Cursor at the first coordinate.
    pub fn begin(&self) -> IndexCursor<R> {
        self.cursor(0)
    }

    /// Cursor one past the last coordinate.
    pub fn end(&self) -> IndexCursor<R> {
        self.cursor(self.len)
    }
}

impl<const R: usize> IntoIterator for IndexSpace<R> {
    type Item = [usize; R];
    type IntoIter = Iter<R>;

    fn into_iter(self) -> Iter<R> {
        self.iter()
    }
}

impl<const R: usize> IntoIterator for &IndexSpace<R> {
    type Item = [usize; R];
    type IntoIter = Iter<R>;

    fn into_iter(self) -> Iter<R> {
        self.iter()
    }
}

/// Iterator over an [`IndexSpace`].
#[derive(Debug, Clone)]
pub struct Iter<const R: usize> {
    space: IndexSpace<R>,
    front: usize,
    back: usize,
}

impl<const R: usize> Iterator for Iter<R> {
    type Item = [usize; R];

    #[inline]
    fn next(&mut self) -> Option<[usize; R]> {
        if self.front < self.back {
            let idx = self.space.decode(self.front);
            self.front += 1;
            Some(idx)
        } else {
            None
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }

    fn nth(&mut self, n: usize) -> Option<[usize; R]> {
        self.front = self.front.saturating_add(n).min(self.back);
        self.next()
    }
}

impl<const R: usize> DoubleEndedIterator for Iter<R> {
    #[inline]
    fn next_back(&mut self) -> Option<[usize; R]> {
        if self.front < self.back {
            self.back -= 1;
            Some(self.space.decode(self.back))
        } else {
            None
        }
    }

    fn nth_back(&mut self, n: usize) -> Option<[usize; R]> {
        self.back = self.back.saturating_sub(n).max(self.front);
        self.next_back()
    }
}

impl<const R: usize> ExactSizeIterator for Iter<R> {}

impl<const R: usize> FusedIterator for Iter<R> {}

/// Random-access position inside an [`IndexSpace`].
///
/// Cursors step forward and backward, jump by arbitrary signed offsets and
/// subtract to a signed distance. Equality and ordering compare positions only.
#[derive(Debug, Clone, Copy)]
pub struct IndexCursor<const R: usize> {
    space: IndexSpace<R>,
    pos: usize,
}

impl<const R: usize> IndexCursor<R> {
    /// Position within the sequence.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Coordinate at the cursor, or `None` when outside the sequence.
    #[inline]
    pub fn get(&self) -> Option<[usize; R]> {
        self.space.get(self.pos)
    }

    /// Coordinate `n` positions away from the cursor.
    #[inline]
    pub fn at(&self, n: isize) -> Option<[usize; R]> {
        (*self + n).get()
    }
}

impl<const R: usize> PartialEq for IndexCursor<R> {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos
    }
}

impl<const R: usize> Eq for IndexCursor<R> {}

impl<const R: usize> PartialOrd for IndexCursor<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const R: usize> Ord for IndexCursor<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos.cmp(&other.pos)
    }
}

impl<const R: usize> Add<isize> for IndexCursor<R> {
    type Output = Self;

    fn add(mut self, rhs: isize) -> Self {
        self.pos = self.pos.wrapping_add_signed(rhs);
        self
    }
}

impl<const R: usize> Sub<isize> for IndexCursor<R> {
    type Output = Self;

    fn sub(self, rhs: isize) -> Self {
        self + rhs.wrapping_neg()
    }
}

impl<const R: usize> AddAssign<isize> for IndexCursor<R> {
    fn add_assign(&mut self, rhs: isize) {
        *self = *self + rhs;
    }
}

impl<const R: usize> SubAssign<isize> for IndexCursor<R> {
    fn sub_assign(&mut self, rhs: isize) {
        *self = *self - rhs;
    }
}

impl<const R: usize> Sub for IndexCursor<R> {
    type Output = isize;

    fn sub(self, rhs: Self) -> isize {
        if self.pos >= rhs.pos {
            (self.pos - rhs.pos) as isize
        } else {
            -((rhs.pos - self.pos) as isize)
        }
    }
}
