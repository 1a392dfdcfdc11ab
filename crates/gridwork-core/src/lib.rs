//! # Gridwork Core
//!
//! Core types for device-resident grids and asynchronous work graphs.
//!
//! This crate holds everything that does not depend on a concrete device:
//!
//! - [`layout`] - extents and strided layout mappings
//! - [`index_space`] - enumeration of the coordinates of a mapping
//! - [`math`] - integer helpers used for geometric extents
//! - [`memory`] - flat device and staging allocations with access fences
//! - [`device`] - the [`DeviceRuntime`](device::DeviceRuntime) seam implemented by backends
//! - [`config`] - runtime and logging configuration
//! - [`error`] - the crate-wide error type

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod device;
pub mod error;
pub mod index_space;
pub mod layout;
pub mod math;
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{GridworkConfig, GridworkConfigBuilder, LoggingConfig, RuntimeConfig};
    pub use crate::device::{
        Backend, DeviceOp, DeviceRuntime, EventId, SharedRuntime, StreamId,
    };
    pub use crate::error::{GridworkError, Result};
    pub use crate::index_space::{IndexCursor, IndexSpace};
    pub use crate::layout::{Extents, LayoutPolicy, StridedMapping};
    pub use crate::math::{geometric_span, ipow};
    pub use crate::memory::{DeviceBuffer, DeviceUse, MemoryKind};
}

pub use config::GridworkConfig;
pub use error::{GridworkError, Result};
