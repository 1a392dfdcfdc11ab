//! Integration tests for canonical-order index-space enumeration.

use std::collections::HashSet;

use gridwork::index_space::IndexSpace;
use gridwork::layout::StridedMapping;
use rayon::prelude::*;

fn assert_visits_each_once<const R: usize>(mapping: StridedMapping<R>) {
    let space = IndexSpace::new(&mapping);
    let seen: HashSet<[usize; R]> = space.iter().collect();

    assert_eq!(space.len(), mapping.size());
    assert_eq!(seen.len(), mapping.size());
    assert!(seen.iter().all(|idx| mapping.extents().contains(idx)));
}

#[test]
fn test_every_coordinate_once() {
    assert_visits_each_once(StridedMapping::layout_right([3, 4, 5]));
    assert_visits_each_once(StridedMapping::layout_left([3, 4, 5]));
    assert_visits_each_once(StridedMapping::with_strides([2, 3, 4], [1, 8, 2]));
    assert_visits_each_once(StridedMapping::layout_right([7]));
    assert_visits_each_once(StridedMapping::layout_right([1, 1, 9, 1]));
}

#[test]
fn test_order_follows_memory() {
    let mapping = StridedMapping::with_strides([2, 3, 4], [1, 8, 2]);
    let offsets: Vec<usize> = IndexSpace::new(&mapping)
        .iter()
        .map(|idx| mapping.offset(idx))
        .collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
}

#[test]
fn test_rank_zero_yields_single_empty_tuple() {
    let space = IndexSpace::new(&StridedMapping::<0>::layout_right([]));
    let all: Vec<[usize; 0]> = space.iter().collect();
    assert_eq!(all, vec![[]]);
}

#[test]
fn test_zero_extent_is_empty() {
    let space = IndexSpace::new(&StridedMapping::layout_right([3, 0, 2]));
    assert!(space.is_empty());
    assert_eq!(space.iter().next(), None);
}

#[test]
fn test_random_access_cursor() {
    let space = IndexSpace::from_extents([4, 5]);
    let begin = space.begin();
    let end = space.end();

    assert_eq!(end - begin, 20);
    assert_eq!((begin + 7).get(), Some([1, 2]));
    assert_eq!((end - 1).get(), Some([3, 4]));
    assert_eq!(end.get(), None);
    assert_eq!(begin.at(19), Some([3, 4]));
    assert!(begin < end);

    let mut cursor = begin;
    cursor += 12;
    cursor -= 2;
    assert_eq!(cursor.position(), 10);
    assert_eq!(cursor.get(), space.get(10));
}

#[test]
fn test_reverse_and_nth() {
    let space = IndexSpace::from_extents([3, 3]);
    let forward: Vec<_> = space.iter().collect();
    let mut backward: Vec<_> = space.iter().rev().collect();
    backward.reverse();
    assert_eq!(forward, backward);

    let mut iter = space.iter();
    assert_eq!(iter.nth(4), Some([1, 1]));
    assert_eq!(iter.len(), 4);
    assert_eq!(iter.nth_back(0), Some([2, 2]));
}

#[test]
fn test_parallel_matches_sequential() {
    let space = IndexSpace::new(&StridedMapping::layout_left([6, 7, 3]));
    let sequential: Vec<_> = space.iter().collect();
    let parallel: Vec<_> = space.par_iter().collect();
    assert_eq!(sequential, parallel);
}
