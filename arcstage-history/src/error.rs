// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage history - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// History never retries: stage failures bubble up unchanged, and argument
// or state violations are rejected at the API boundary before any part of
// the snapshot tree is mutated.

use arcstage_store::{ChunkId, StageError};
use thiserror::Error;

/// Errors that can occur while mutating or persisting a history.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A stage operation failed underneath a history operation.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A persistence operation was requested on a history that has no
    /// stage or no state codec attached.
    #[error("history is not attached to a stage")]
    Detached,

    /// `undo` was called on the initial snapshot.
    #[error("cannot undo past the initial snapshot")]
    UndoAtRoot,

    /// An undo target lies in the redo direction.
    #[error("stratum {requested} is not behind the current stratum {current}")]
    NotBehindCurrent {
        /// The stratum (or target snapshot's stratum) that was requested.
        requested: u64,
        /// The current snapshot's stratum.
        current: u64,
    },

    /// `redo` was given a chunk ID that matches no successor of the
    /// current snapshot.
    #[error("no successor with chunk id {id} under the current snapshot")]
    NoSuchChild {
        /// The chunk ID that was requested.
        id: ChunkId,
    },

    /// A snapshot handle from a different history was passed in.
    #[error("snapshot does not belong to this history")]
    ForeignSnapshot,

    /// A snapshot handle refers to a snapshot that is no longer cached in
    /// memory (it was elided and can only be reached again by undo/redo).
    #[error("snapshot is no longer cached in memory")]
    UnknownSnapshot,

    /// The snapshot tree does not connect the way a multi-step operation
    /// requires.
    #[error("snapshot tree inconsistency: {0}")]
    Inconsistent(String),
}

/// Convenience type alias for history results.
pub type HistoryResult<T> = Result<T, HistoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_behind() {
        let error = HistoryError::NotBehindCurrent {
            requested: 7,
            current: 3,
        };
        let message = format!("{error}");
        assert!(message.contains('7'));
        assert!(message.contains('3'));
    }

    #[test]
    fn test_stage_error_wraps_transparently() {
        let inner = StageError::OffsetOutOfRange {
            path: "stage.bin".into(),
            offset: 99,
        };
        let error = HistoryError::from(inner);
        assert!(format!("{error}").contains("99"));
    }
}
