//! Error types for grid and work-graph operations.
//!
//! Errors fall into three groups:
//!
//! - **Logic errors**: programmer misuse such as touching a released stream
//!   handle or raising an integer to a negative power.
//! - **Device errors**: stream/event creation, launch or synchronization
//!   failures reported by the device runtime. These are never retried.
//! - **Contract violations**: caller-correctable input such as replacing a
//!   buffer with one of the wrong length.

use thiserror::Error;

/// Result type alias for gridwork operations.
pub type Result<T> = std::result::Result<T, GridworkError>;

/// Errors produced by the grid layer, the work graph and device runtimes.
#[derive(Error, Debug)]
pub enum GridworkError {
    /// A stream handle was used after it returned its stream to the pool.
    #[error("trying to use an inactive stream handle")]
    InactiveHandle,

    /// An integer power was requested with a negative exponent.
    #[error("integers can not be raised to negative power {exponent}")]
    NegativeExponent {
        /// The rejected exponent.
        exponent: i64,
    },

    /// A coordinate fell outside the extents of a view.
    #[error("index {index:?} out of bounds for extents {extents:?}")]
    IndexOutOfBounds {
        /// The offending coordinate.
        index: Vec<usize>,
        /// Extents of the view.
        extents: Vec<usize>,
    },

    /// A sub-selection did not fit the view it was taken from.
    #[error("invalid slice {start}..{end} of dimension {dim} with extent {extent}")]
    InvalidSlice {
        /// Sliced dimension.
        dim: usize,
        /// Requested start.
        start: usize,
        /// Requested end (exclusive).
        end: usize,
        /// Extent of the sliced dimension.
        extent: usize,
    },

    /// Work nodes driven by different device runtimes were combined.
    #[error("work nodes belong to different device runtimes")]
    RuntimeMismatch,

    /// Replacement buffer length differs from the current storage length.
    #[error("expected {expected} sized buffer, got: {actual}")]
    LengthMismatch {
        /// Current storage length.
        expected: usize,
        /// Length of the rejected buffer.
        actual: usize,
    },

    /// Device stream creation failed.
    #[error("failed to create stream: {0}")]
    StreamCreation(String),

    /// Device event creation, recording or waiting failed.
    #[error("event operation failed: {0}")]
    Event(String),

    /// Enqueueing device work failed.
    #[error("failed to enqueue device work: {0}")]
    Launch(String),

    /// Stream synchronization failed.
    #[error("stream synchronization failed: {0}")]
    Synchronization(String),

    /// An operation faulted while executing on a stream.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// Requested backend is not available.
    #[error("backend not available: {0}")]
    BackendUnavailable(String),

    /// Configuration values are invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GridworkError {
    /// Create an out-of-bounds error from fixed-rank coordinates.
    pub fn out_of_bounds<const R: usize>(index: [usize; R], extents: [usize; R]) -> Self {
        Self::IndexOutOfBounds {
            index: index.to_vec(),
            extents: extents.to_vec(),
        }
    }

    /// Check if the error was reported by the device runtime.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::StreamCreation(_)
                | Self::Event(_)
                | Self::Launch(_)
                | Self::Synchronization(_)
                | Self::DeviceFault(_)
                | Self::BackendUnavailable(_)
        )
    }

    /// Check if the caller can correct the input and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LengthMismatch { .. })
    }
}

impl From<toml::de::Error> for GridworkError {
    fn from(e: toml::de::Error) -> Self {
        GridworkError::Config(e.to_string())
    }
}
