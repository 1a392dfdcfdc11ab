//! Integration tests for stream pooling and work-node lineages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridwork::prelude::*;

fn pool() -> Arc<StreamPool> {
    let config = GridworkConfig::builder()
        .with_backend(Backend::Cpu)
        .with_worker_threads(4)
        .build()
        .expect("valid config");
    Arc::new(StreamPool::with_config(&config.runtime).expect("cpu pool"))
}

#[test]
fn test_staging_round_trip_42() {
    let pool = pool();
    let mut grid = Grid::<f32, 3, 2, 3>::new([4, 5, 6]);
    grid.staging_mds_mut().fill(7.0);

    let mut work = pool.work().unwrap();
    work.sync_from_staging(&mut grid)
        .unwrap()
        .for_each(&mut grid, |mut tensor| {
            for idx in tensor.index_space() {
                tensor[idx] *= 3.0;
            }
        })
        .unwrap()
        .for_each(&mut grid, |mut tensor| {
            for idx in tensor.index_space() {
                tensor[idx] *= 2.0;
            }
        })
        .unwrap()
        .sync_to_staging(&mut grid)
        .unwrap();
    work.wait().unwrap();

    assert!(grid.staging_span().iter().all(|&v| v == 42.0));
    assert!(grid.span().iter().all(|&v| v == 42.0));
}

#[test]
fn test_host_access_waits_for_enqueued_work() {
    let pool = pool();
    let mut grid = Grid::<u64, 1, 0, 1>::new([256]);

    let mut work = pool.work().unwrap();
    work.for_each(&mut grid, |mut cell| {
        std::thread::sleep(Duration::from_micros(50));
        cell[[]] = 5;
    })
    .unwrap();

    // No explicit wait: host access blocks on the buffer fence.
    assert!(grid.span().iter().all(|&v| v == 5));
}

#[test]
fn test_for_each_index_grid_shape() {
    let pool = pool();
    let mut grid = Grid::<u32, 2, 1, 2>::new([3, 4]);
    let view = grid.device_view();

    let mut work = pool.work().unwrap();
    {
        let view = view.clone();
        work.for_each_index(&view.clone(), move |g: [usize; 2]| {
            let value = (g[0] * 4 + g[1]) as u32;
            // SAFETY: each invocation writes only its own cell.
            unsafe {
                view.set(g, [0], value);
                view.set(g, [1], value * 100);
            }
        })
        .unwrap();
    }
    drop(view);
    work.wait().unwrap();

    let mds = grid.mds();
    assert_eq!(mds.at([2, 3]).to_vec(), vec![11, 1100]);
    assert_eq!(mds.at([0, 1]).to_vec(), vec![1, 100]);
}

#[test]
fn test_for_each_index_element_shape() {
    let pool = pool();
    let mut grid = Grid::<i32, 1, 2, 2>::new([5]);
    let view = grid.device_view();

    let mut work = pool.work().unwrap();
    {
        let view = view.clone();
        work.for_each_index(&view.clone(), move |g: [usize; 1], e: [usize; 2]| {
            // SAFETY: each (cell, component) pair is visited exactly once.
            unsafe { view.set(g, e, (g[0] * 100 + e[0] * 10 + e[1]) as i32) };
        })
        .unwrap();
    }
    drop(view);
    work.wait().unwrap();

    assert_eq!(grid.mds().at([3]).to_vec(), vec![300, 301, 310, 311]);
}

#[test]
fn test_for_each_index_on_slice() {
    let pool = pool();
    let mut grid = Grid::<u8, 2, 0, 1>::new([4, 4]);
    let window = grid.device_view().slice(0, 1..3).unwrap().slice(1, 1..3).unwrap();

    let mut work = pool.work().unwrap();
    {
        let window_in_kernel = window.clone();
        work.for_each_index(&window, move |g: [usize; 2]| {
            // SAFETY: one invocation per cell of the window.
            unsafe { window_in_kernel.set(g, [], 1) };
        })
        .unwrap();
    }
    drop(window);
    work.wait().unwrap();

    #[rustfmt::skip]
    let expected = vec![
        0, 0, 0, 0,
        0, 1, 1, 0,
        0, 1, 1, 0,
        0, 0, 0, 0,
    ];
    assert_eq!(grid.underlying_buffer(), expected);
}

fn split_then_join<const N: usize>() {
    let pool = pool();
    let mut grid = Grid::<u32, 1, 0, 1>::new([64]);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut root = pool.work().unwrap();
    root.for_each(&mut grid, |mut c| c[[]] = 1).unwrap();

    let mut branches = root.split::<N>().unwrap();
    for branch in branches.iter_mut() {
        let counter = Arc::clone(&counter);
        let view = grid.device_view();
        branch
            .for_each_index(&view.clone(), move |g: [usize; 1]| {
                // Every branch observes the root's writes.
                // SAFETY: branches only read, and the root's write is ordered
                // before the split.
                assert_eq!(unsafe { view.at(g, []) }, 1);
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    let mut nodes: Vec<&mut WorkNode> = Vec::with_capacity(N + 1);
    nodes.push(&mut root);
    nodes.extend(branches.iter_mut());
    match nodes.len() {
        2 => {
            let [a, b]: [&mut WorkNode; 2] = nodes.try_into().unwrap();
            when_all([a, b]).unwrap();
        }
        3 => {
            let [a, b, c]: [&mut WorkNode; 3] = nodes.try_into().unwrap();
            when_all([a, b, c]).unwrap();
        }
        4 => {
            let [a, b, c, d]: [&mut WorkNode; 4] = nodes.try_into().unwrap();
            when_all([a, b, c, d]).unwrap();
        }
        n => unreachable!("unexpected node count {n}"),
    }

    root.for_each(&mut grid, |mut c| c[[]] += 1).unwrap();
    root.wait().unwrap();
    for branch in &branches {
        branch.wait().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 64 * N);
    assert!(grid.span().iter().all(|&v| v == 2));
}

#[test]
fn test_split_one_then_join() {
    split_then_join::<1>();
}

#[test]
fn test_split_two_then_join() {
    split_then_join::<2>();
}

#[test]
fn test_split_three_then_join() {
    split_then_join::<3>();
}

#[test]
fn test_split_multiple_times() {
    let pool = pool();
    let mut grid = Grid::<u32, 1, 0, 1>::new([16]);
    let visits = Arc::new(AtomicUsize::new(0));

    let mut w1 = pool.work().unwrap();
    w1.for_each(&mut grid, |mut c| c[[]] = 1).unwrap();

    let [mut w2a, mut w2b] = w1.split::<2>().unwrap();
    let [mut w3a, mut w3b] = w2a.split::<2>().unwrap();
    let [mut w3c, mut w3d] = w2b.split::<2>().unwrap();
    assert_eq!(pool.stream_count(), 7);

    for leaf in [&mut w3a, &mut w3b, &mut w3c, &mut w3d] {
        let visits = Arc::clone(&visits);
        let view = grid.device_view();
        leaf.for_each_index(&grid, move |g: [usize; 1]| {
            // SAFETY: leaves only read; the write happened before the splits.
            assert_eq!(unsafe { view.at(g, []) }, 1);
            visits.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    when_all([
        &mut w1, &mut w2a, &mut w2b, &mut w3a, &mut w3b, &mut w3c, &mut w3d,
    ])
    .unwrap();
    w3d.for_each(&mut grid, |mut c| c[[]] += 1).unwrap();

    for node in [&w1, &w2a, &w2b, &w3a, &w3b, &w3c, &w3d] {
        node.wait().unwrap();
    }
    assert_eq!(visits.load(Ordering::Relaxed), 4 * 16);
    assert!(grid.span().iter().all(|&v| v == 2));
}

#[test]
fn test_lineages_sharing_a_grid_do_not_race() {
    const ROUNDS: usize = 25;
    const ADDS: u64 = 2000;

    let pool = pool();
    let mut grid = Grid::<u64, 1, 0, 1>::new([64]);
    let mut a = pool.work().unwrap();
    let mut b = pool.work().unwrap();

    for _ in 0..ROUNDS {
        for node in [&mut a, &mut b] {
            node.for_each(&mut grid, |mut c| {
                for _ in 0..ADDS {
                    c[[]] += 1;
                }
            })
            .unwrap();
        }
    }
    a.wait().unwrap();
    b.wait().unwrap();

    let expected = 2 * ROUNDS as u64 * ADDS;
    assert!(
        grid.span().iter().all(|&v| v == expected),
        "expected {expected} per cell, got {:?}",
        grid.span()
    );
}

#[test]
fn test_lineages_sharing_a_grid_follow_enqueue_order() {
    let pool = pool();
    let mut grid = Grid::<i32, 2, 1, 2>::new([8, 8]);
    grid.staging_mds_mut().fill(5);

    let mut upload = pool.work().unwrap();
    let mut compute = pool.work().unwrap();
    upload.sync_from_staging(&mut grid).unwrap();
    compute
        .for_each(&mut grid, |mut v| {
            std::thread::sleep(Duration::from_micros(20));
            v[[0]] += 1;
            v[[1]] *= 2;
        })
        .unwrap();
    upload.sync_to_staging(&mut grid).unwrap();
    upload.wait().unwrap();

    assert!(grid
        .staging_mds()
        .index_space()
        .iter()
        .all(|g| grid.staging_mds().at(g).to_vec() == vec![6, 10]));
}

#[test]
fn test_concurrent_pool_get_hands_out_distinct_streams() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20;

    let pool = pool();
    let live = parking_lot::Mutex::new(std::collections::HashSet::new());

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let handle = pool.get().unwrap();
                    let stream = handle.get().unwrap();
                    assert!(live.lock().insert(stream), "{stream} handed out twice");
                    std::thread::sleep(Duration::from_micros(50));
                    assert!(live.lock().remove(&stream));
                    drop(handle);
                }
            });
        }
    });

    assert!(live.lock().is_empty());
    assert!(pool.stream_count() <= THREADS);
}

#[test]
fn test_when_all_orders_across_lineages() {
    let pool = pool();
    let mut grid = Grid::<u32, 1, 0, 1>::new([32]);

    let mut slow = pool.work().unwrap();
    slow.for_each(&mut grid, |mut c| {
        std::thread::sleep(Duration::from_micros(200));
        c[[]] = 3;
    })
    .unwrap();

    let mut fast = pool.work().unwrap();
    when_all([&mut slow, &mut fast]).unwrap();
    fast.for_each(&mut grid, |mut c| c[[]] *= 7).unwrap();
    fast.wait().unwrap();

    assert!(grid.span().iter().all(|&v| v == 21));
}

#[test]
fn test_released_stream_is_reused() {
    let pool = pool();
    let grid = Grid::<f32, 1, 0, 1>::new([16]);

    let mut nodes: Vec<WorkNode> = (0..4).map(|_| pool.work().unwrap()).collect();
    for node in nodes.iter_mut() {
        node.for_each_index(&grid, |_: [usize; 1]| {}).unwrap();
    }
    assert_eq!(pool.stream_count(), 4);

    let finished = nodes.pop().unwrap();
    finished.wait().unwrap();
    drop(finished);

    let _next = pool.work().unwrap();
    assert_eq!(pool.stream_count(), 4);
}

#[test]
fn test_node_dropped_without_wait_is_reused_after_drain() {
    let pool = pool();
    let mut grid = Grid::<u8, 1, 0, 1>::new([8]);

    let mut node = pool.work().unwrap();
    node.for_each(&mut grid, |mut c| {
        std::thread::sleep(Duration::from_millis(5));
        c[[]] = 1;
    })
    .unwrap();
    drop(node);

    while pool.idle_count() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    let _next = pool.work().unwrap();
    assert_eq!(pool.stream_count(), 1);
    assert!(grid.span().iter().all(|&v| v == 1));
}

#[test]
fn test_inactive_handle_errors() {
    let pool = pool();
    let mut handle = pool.get().unwrap();
    handle.release();

    assert!(matches!(handle.get(), Err(GridworkError::InactiveHandle)));
    assert!(matches!(handle.on_stream(), Err(GridworkError::InactiveHandle)));
    handle.wait().unwrap();
    handle.release();
}

#[test]
fn test_device_fault_surfaces_on_wait() {
    let pool = pool();
    let mut grid = Grid::<u32, 1, 0, 1>::new([4]);

    let mut work = pool.work().unwrap();
    work.for_each(&mut grid, |cell| {
        let _ = cell[[]];
        panic!("bad kernel");
    })
    .unwrap();

    let err = work.wait().unwrap_err();
    assert!(err.is_device_error());
    assert!(matches!(err, GridworkError::DeviceFault(_)));
}
