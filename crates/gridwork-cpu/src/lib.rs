//! # Gridwork CPU Backend
//!
//! Host implementation of the device runtime. Streams are worker threads,
//! events are completion markers, and elementwise operations run on a rayon
//! pool. Always available; used by the test suite and as the fallback backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod event;
mod runtime;
mod worker;

pub use runtime::CpuRuntime;
