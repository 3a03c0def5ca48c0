// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage history - Snapshot tree node types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A snapshot is one node of the branching history tree. Snapshots live in
// an arena owned by their `History`; "in memory" means "present in the
// arena", and elision removes a subtree from the arena while its chunk IDs
// remain recorded in the neighbouring links.
//
// On-disk snapshot chunk layout (big-endian; -1 for absent IDs):
//
//   +-------------------+---------+------------+------------+------------------+
//   | stratum (8 bytes) | prevID  | payload    | linkCount  | nextID[0..N]     |
//   |                   | (8 b.)  | (|payload|)| (4 bytes)  | (8 bytes each)   |
//   +-------------------+---------+------------+------------+------------------+
//
// The prevID is -1 when the node was written forward-only (the backward
// direction is reconnected in memory while descending). One nextID slot
// may be -1: the forward branch on the path to the then-current snapshot,
// which the loader reconnects from caller-supplied context.

use arcstage_store::ChunkId;

/// Size of the fixed prefix preceding the payload: stratum + prevID.
pub(crate) const STATIC_PREFIX_SIZE: usize = 8 + 8;

/// Size of the link-count field following the payload.
pub(crate) const LINK_COUNT_SIZE: usize = 4;

/// Arena key of a cached snapshot. Keys are never reused, so a stale key
/// simply stops resolving.
pub(crate) type NodeKey = u64;

/// Opaque handle to a cached snapshot of one particular [`History`].
///
/// Handles stay valid while the snapshot is cached; once the snapshot is
/// elided from memory the handle reports
/// [`UnknownSnapshot`](crate::HistoryError::UnknownSnapshot) and the
/// snapshot can only be reached again through `undo`/`redo`.
///
/// [`History`]: crate::History
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    pub(crate) history: u64,
    pub(crate) key: NodeKey,
}

/// Public view of one edge of the snapshot tree: the dual
/// `(chunk ID, cached snapshot)` representation. Either side may be
/// absent; both may be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLink {
    /// Chunk ID of the linked snapshot, if it has been persisted.
    pub chunk_id: Option<ChunkId>,

    /// Handle to the linked snapshot, if it is cached in memory.
    pub snapshot: Option<SnapshotId>,
}

/// One forward edge from a snapshot to a child, as stored in the arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NextLink {
    /// Chunk ID of the child, if persisted.
    pub(crate) next_id: Option<ChunkId>,

    /// Arena key of the child, if cached.
    pub(crate) next: Option<NodeKey>,
}

/// One node of the snapshot tree.
///
/// Beyond the structural fields, three marks track how the node relates to
/// its last-written chunk, implementing re-serialization on divergence:
/// `clean` (the chunk at `id` still reflects this node), `saved_backward`
/// (the chunk carries a real prevID), and `severed_child` (which forward
/// slot the chunk holds as -1). A save rewrites the node, minting a fresh
/// chunk ID, whenever the marks no longer match what the save needs.
pub(crate) struct SnapshotNode<S> {
    /// Depth from the root; the initial snapshot has stratum 0.
    pub(crate) stratum: u64,

    /// The user payload captured by this snapshot.
    pub(crate) state: S,

    /// Chunk ID of the last-written form, if any.
    pub(crate) id: Option<ChunkId>,

    /// Whether the chunk at `id` still reflects the in-memory node.
    pub(crate) clean: bool,

    /// Whether the chunk at `id` carries a real prevID.
    pub(crate) saved_backward: bool,

    /// The child whose slot the chunk at `id` holds as -1, if any.
    pub(crate) severed_child: Option<NodeKey>,

    /// Chunk ID of the parent, if known.
    pub(crate) previous_id: Option<ChunkId>,

    /// Arena key of the parent, if cached.
    pub(crate) previous: Option<NodeKey>,

    /// Forward edges, in creation order.
    pub(crate) next_links: Vec<NextLink>,
}

impl<S> SnapshotNode<S> {
    /// Whether a save in the given direction, severing `skip`, can keep
    /// the last-written chunk instead of minting a new one.
    pub(crate) fn needs_write(&self, backward: bool, skip: Option<NodeKey>) -> bool {
        self.id.is_none()
            || !self.clean
            || (backward && !self.saved_backward)
            || (self.severed_child.is_some() && self.severed_child != skip)
    }

    /// Index of the link whose cached child is `key`, if any.
    pub(crate) fn link_to(&self, key: NodeKey) -> Option<usize> {
        self.next_links.iter().position(|link| link.next == Some(key))
    }
}
