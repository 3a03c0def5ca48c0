// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage store - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines all error conditions that can arise while operating on a stage
// file: open/close failures, out-of-range chunk reads, and read/write I/O
// failures. Every variant carries the stage file path so callers can tell
// which of several stages misbehaved.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while staging or reading chunks.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage file could not be opened (or reopened after a close).
    #[error("I/O error opening stage file {path}: {source}")]
    Open {
        /// Path of the stage file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: io::Error,
    },

    /// The stage file could not be flushed and closed cleanly.
    #[error("I/O error closing stage file {path}: {source}")]
    Close {
        /// Path of the stage file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: io::Error,
    },

    /// A chunk read extended past the end of the stage file. Chunk sizes
    /// are not recorded on disk, so this is the only signal a caller gets
    /// for passing a stale or miscalculated chunk ID.
    #[error("chunk offset {offset} is out of range in stage file {path}")]
    OffsetOutOfRange {
        /// Path of the stage file.
        path: PathBuf,
        /// The requested chunk offset.
        offset: u64,
    },

    /// An I/O error occurred while reading a chunk.
    #[error("I/O error reading chunk from stage file {path}: {source}")]
    Read {
        /// Path of the stage file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: io::Error,
    },

    /// An I/O error occurred while appending a chunk.
    #[error("I/O error writing chunk to stage file {path}: {source}")]
    Write {
        /// Path of the stage file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: io::Error,
    },
}

/// Convenience type alias for stage results.
pub type StageResult<T> = Result<T, StageError>;
