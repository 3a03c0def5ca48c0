// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage history crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A branching undo/redo history over an arbitrary user state type,
// materialized onto an append-only stage. Mutations (`advance`, `undo`,
// `redo`) move the current snapshot around a tree: undoing and then
// advancing forks a new branch while the abandoned branch stays reachable.
// Attached histories keep a bounded window of snapshots in memory around
// the current one and elide the rest down to chunk IDs on the stage.
//
// # Modules
//
// - [`error`] -- The `HistoryError` enum and `HistoryResult` alias.
// - [`snapshot`] -- Snapshot node types, handles, and the chunk layout.
// - [`history`] -- The `History` tree and all of its operations.

pub mod error;
pub mod history;
pub mod snapshot;

// Re-export the primary public API for ergonomic imports.
pub use error::{HistoryError, HistoryResult};
pub use history::{History, DEFAULT_MAX_CACHED_STRATA};
pub use snapshot::{SnapshotId, SnapshotLink};
