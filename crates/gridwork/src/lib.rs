//! # Gridwork
//!
//! Device-resident multi-dimensional grids and an asynchronous work graph for
//! operating on them.
//!
//! A [`Grid`] pairs a device buffer with a host staging mirror. Each buffer is
//! one flat allocation holding a grid of small multi-dimensional elements,
//! addressed through composed views: a grid coordinate selects an element
//! view, an element-local coordinate selects a scalar.
//!
//! Work on grids is expressed as [`WorkNode`] lineages. Each lineage owns a
//! stream borrowed from a [`StreamPool`]; operations chained on a node run in
//! order, lineages are joined with [`when_all`] and forked with
//! [`WorkNode::split`], and only [`WorkNode::wait`] blocks the host.
//!
//! ## Quick Start
//!
//! ```
//! use gridwork::prelude::*;
//!
//! # fn main() -> gridwork::Result<()> {
//! // 16x16 grid of 2x2 tensors
//! let mut grid = Grid::<f64, 2, 2, 2>::new([16, 16]);
//! grid.staging_mds_mut().fill(1.0);
//!
//! let mut work = WorkNode::new()?;
//! work.sync_from_staging(&mut grid)?
//!     .for_each(&mut grid, |mut tensor| {
//!         tensor[[0, 1]] = 0.0;
//!         tensor[[1, 0]] = 0.0;
//!     })?
//!     .sync_to_staging(&mut grid)?;
//! work.wait()?;
//!
//! let host = grid.staging_mds();
//! assert_eq!(host.at([3, 4]).to_vec(), vec![1.0, 0.0, 0.0, 1.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **CPU** - streams are host worker threads (always available)
//!
//! The backend and logging are configured through [`GridworkConfig`], either
//! explicitly with [`init`] or from defaults on first use.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(hidden_glob_reexports)]

pub mod buffer;
pub mod grid;
pub mod logging;
pub mod stream;
pub mod view;
pub mod work;

use std::sync::Arc;

// Re-export core types
pub use gridwork_core::*;

// Re-export CPU backend (always available)
pub use gridwork_cpu::CpuRuntime;

pub use buffer::GridBuffer;
pub use grid::Grid;
pub use stream::{StreamExecutor, StreamHandle, StreamPool};
pub use view::{Access, DeviceGridView, ElementView, GridView, IndexDomain, ReadOnly, ReadWrite};
pub use work::{when_all, GridIndexOnly, IndexKernel, WithElementIndex, WorkNode};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::buffer::GridBuffer;
    pub use crate::grid::Grid;
    pub use crate::stream::{StreamHandle, StreamPool};
    pub use crate::view::{DeviceGridView, ElementView, GridView, IndexDomain, ReadOnly, ReadWrite};
    pub use crate::work::{when_all, WorkNode};
    pub use gridwork_core::prelude::*;
}

/// Initialise logging and the global stream pool from `config`.
///
/// Must run before anything touches the global pool. Environment overrides
/// (`GRIDWORK_LOG`) are applied first.
pub fn init(config: GridworkConfig) -> Result<Arc<StreamPool>> {
    let config = config.apply_env_overrides();
    config.validate()?;

    logging::init_logging(&config.logging);
    let pool = StreamPool::install_global(StreamPool::with_config(&config.runtime)?)?;

    tracing::info!(
        backend = %pool.runtime().backend(),
        initial_streams = config.runtime.initial_streams,
        "gridwork initialized"
    );
    Ok(pool)
}
