//! Error taxonomy for the pyramid pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// The kinds of failure the pipeline can report to a host.
///
/// `Cancelled` is carried as a variant so workers and levels can thread it
/// through the same `Result` plumbing as real errors, but it is never
/// surfaced to `build_pyramid`'s caller as an `Err` (the scheduler
/// intercepts it and folds it into `PyramidResult::cancelled` instead).
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// Open/read/write failed at the OS level.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be parsed as an image or had an unsupported pixel mode.
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Dimension mismatch between paired inputs, or a zero-size derived level.
    #[error("dimension mismatch: expected {expected_w}x{expected_h}, got {got_w}x{got_h}")]
    Dim {
        expected_w: usize,
        expected_h: usize,
        got_w: usize,
        got_h: usize,
    },

    /// The directory holds fewer than two image files, or no consistent
    /// `<prefix><digits>.<ext>` pattern could be inferred.
    #[error("no usable image sequence found in {0}")]
    NoSequence(PathBuf),

    /// Path validation failed: traversal, reserved characters, or a symlink
    /// escaping the sandboxed directory.
    #[error("unsafe path rejected: {reason} ({path})")]
    Security { path: PathBuf, reason: &'static str },

    /// A worker reported a non-recoverable error that blocks level completion.
    #[error("worker failed for output index {out_index}: {source}")]
    Worker {
        out_index: u64,
        #[source]
        source: Box<ErrorKind>,
    },

    /// Cooperative cancellation was observed. Internal-only: never returned
    /// from the public API as `Err`.
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ErrorKind::Io { path: path.into(), source }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        ErrorKind::Decode { path: path.into(), source }
    }

    /// True for the sentinel `Cancelled` variant (see the type doc).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }
}
