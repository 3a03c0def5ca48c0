// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage history - Branching snapshot tree
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A history tracks successive values of a user state type as a tree of
// snapshots: `advance` grows the tree, `undo`/`redo` move the current
// snapshot along it, and branches appear wherever a new advance follows an
// undo. When a stage and a state codec are attached, the tree materializes
// onto the stage: around the current snapshot a window of
// `max_cached_strata` strata stays in memory, and everything beyond it is
// elided down to chunk IDs, to be faulted back in on demand.
//
// The stage is append-only, so a snapshot whose forward set changes is
// never patched in place: the next save mints a fresh chunk for it and the
// stale chunk is orphaned. Ancestors are written before the path child
// they point to exists on disk, which is why the path slot is severed to
// -1 on disk and reconnected from context when the parent is reloaded
// during undo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arcstage_store::codec::{take_i32, take_i64};
use arcstage_store::{decode_chunk_id, encode_chunk_id, ChunkId, NodeIo, Stage, NIL_CHUNK_ID};
use tracing::{debug, info};

use crate::error::{HistoryError, HistoryResult};
use crate::snapshot::{
    NextLink, NodeKey, SnapshotId, SnapshotLink, SnapshotNode, LINK_COUNT_SIZE,
    STATIC_PREFIX_SIZE,
};

/// Default radius of the in-memory window around the current snapshot.
pub const DEFAULT_MAX_CACHED_STRATA: u32 = 1;

/// Distinguishes histories so a [`SnapshotId`] minted by one cannot be
/// replayed against another.
static NEXT_HISTORY_TAG: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A branching undo/redo tree over a user state type, optionally staged.
///
/// A history is *attached* while it has both a stage and a state codec;
/// only attached histories persist snapshots and enforce the cache window.
/// A detached history keeps the whole reachable tree in memory.
///
/// The mutation API takes `&mut self`; callers serialize access
/// externally, matching the single-writer model of the underlying stage.
pub struct History<S, IO> {
    /// Tag embedded in every handle this history mints.
    tag: u64,

    /// Backing stage, if any.
    stage: Option<Arc<Stage>>,

    /// Payload codec, if any.
    state_io: Option<IO>,

    /// Radius of the in-memory window around the current snapshot.
    max_cached_strata: u32,

    /// Arena of cached snapshots. Keys are never reused.
    nodes: HashMap<NodeKey, SnapshotNode<S>>,

    /// Next arena key to hand out.
    next_key: NodeKey,

    /// The snapshot the user is on.
    current: NodeKey,

    /// Reusable buffer for chunk encoding and decoding.
    scratch: Vec<u8>,

    /// Cached strata ahead of the current snapshot, capped at the radius;
    /// -1 while detached.
    forward_tail: i64,

    /// Cached strata behind the current snapshot, capped at the radius;
    /// -1 while detached.
    backward_tail: i64,
}

impl<S, IO: NodeIo<S>> History<S, IO> {
    /// Create a history whose root snapshot captures `initial_state`.
    ///
    /// Passing both `stage` and `state_io` attaches the history; passing
    /// `None` for either leaves it memory-only until a later
    /// [`set_stage`](History::set_stage) / [`set_state_io`](History::set_state_io).
    pub fn new(initial_state: S, stage: Option<Arc<Stage>>, state_io: Option<IO>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            0,
            SnapshotNode {
                stratum: 0,
                state: initial_state,
                id: None,
                clean: false,
                saved_backward: false,
                severed_child: None,
                previous_id: None,
                previous: None,
                next_links: Vec::new(),
            },
        );

        let mut history = Self {
            tag: NEXT_HISTORY_TAG.fetch_add(1, Ordering::Relaxed),
            stage,
            state_io,
            max_cached_strata: DEFAULT_MAX_CACHED_STRATA,
            nodes,
            next_key: 1,
            current: 0,
            scratch: Vec::new(),
            forward_tail: -1,
            backward_tail: -1,
        };
        if history.is_attached() {
            history.forward_tail = 0;
            history.backward_tail = 0;
        }
        history
    }

    /// Reopen a history from a snapshot chunk written by an earlier
    /// session (or earlier in this one).
    ///
    /// The chunk at `root_id` becomes the current snapshot. With
    /// `attach = false` the whole reachable tree is lifted into memory and
    /// the history detaches from the stage immediately.
    pub fn open(
        stage: Arc<Stage>,
        state_io: IO,
        root_id: ChunkId,
        max_cached_strata: u32,
        attach: bool,
    ) -> HistoryResult<Self> {
        let mut history = Self {
            tag: NEXT_HISTORY_TAG.fetch_add(1, Ordering::Relaxed),
            stage: Some(stage),
            state_io: Some(state_io),
            max_cached_strata,
            nodes: HashMap::new(),
            next_key: 0,
            current: 0,
            scratch: Vec::new(),
            forward_tail: 0,
            backward_tail: 0,
        };

        let current = history.load_snapshot(root_id, None, None)?;
        history.current = current;
        history.recompute_tails();
        info!(root_id, attach, "Opened history from stage");

        if !attach {
            history.set_stage(None)?;
        }
        Ok(history)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The state captured by the current snapshot.
    pub fn current_state(&self) -> &S {
        &self.node(self.current).state
    }

    /// The current snapshot's depth from the root.
    pub fn current_stratum(&self) -> u64 {
        self.node(self.current).stratum
    }

    /// The current snapshot's chunk ID, if its last-written form is still
    /// valid. A freshly mutated current snapshot reports `None`.
    pub fn current_id(&self) -> Option<ChunkId> {
        let node = self.node(self.current);
        if node.clean {
            node.id
        } else {
            None
        }
    }

    /// Handle to the current snapshot.
    pub fn current_snapshot(&self) -> SnapshotId {
        SnapshotId {
            history: self.tag,
            key: self.current,
        }
    }

    /// The backing stage, if any.
    pub fn stage(&self) -> Option<&Arc<Stage>> {
        self.stage.as_ref()
    }

    /// The state codec, if any.
    pub fn state_io(&self) -> Option<&IO> {
        self.state_io.as_ref()
    }

    /// Whether both a stage and a codec are attached.
    pub fn is_attached(&self) -> bool {
        self.stage.is_some() && self.state_io.is_some()
    }

    /// The radius of the in-memory window around the current snapshot.
    pub fn max_cached_strata(&self) -> u32 {
        self.max_cached_strata
    }

    /// Cached strata ahead of the current snapshot (capped at the radius),
    /// or -1 while detached.
    pub fn forward_tail(&self) -> i64 {
        self.forward_tail
    }

    /// Cached strata behind the current snapshot (capped at the radius),
    /// or -1 while detached.
    pub fn backward_tail(&self) -> i64 {
        self.backward_tail
    }

    /// Whether the snapshot behind `snapshot` is still cached in memory.
    pub fn is_cached(&self, snapshot: SnapshotId) -> bool {
        snapshot.history == self.tag && self.nodes.contains_key(&snapshot.key)
    }

    /// The stratum of a cached snapshot.
    pub fn stratum_of(&self, snapshot: SnapshotId) -> HistoryResult<u64> {
        Ok(self.node(self.check_handle(snapshot)?).stratum)
    }

    /// The state captured by a cached snapshot.
    pub fn state_of(&self, snapshot: SnapshotId) -> HistoryResult<&S> {
        Ok(&self.node(self.check_handle(snapshot)?).state)
    }

    /// The chunk ID of a cached snapshot's valid last-written form, if any.
    pub fn id_of(&self, snapshot: SnapshotId) -> HistoryResult<Option<ChunkId>> {
        let node = self.node(self.check_handle(snapshot)?);
        Ok(if node.clean { node.id } else { None })
    }

    /// The backward edge of a cached snapshot.
    pub fn parent_of(&self, snapshot: SnapshotId) -> HistoryResult<SnapshotLink> {
        let node = self.node(self.check_handle(snapshot)?);
        Ok(SnapshotLink {
            chunk_id: node.previous_id,
            snapshot: node.previous.map(|key| SnapshotId {
                history: self.tag,
                key,
            }),
        })
    }

    /// The forward edges of a cached snapshot, in creation order.
    pub fn children_of(&self, snapshot: SnapshotId) -> HistoryResult<Vec<SnapshotLink>> {
        let node = self.node(self.check_handle(snapshot)?);
        Ok(node
            .next_links
            .iter()
            .map(|link| SnapshotLink {
                chunk_id: link.next_id,
                snapshot: link.next.map(|key| SnapshotId {
                    history: self.tag,
                    key,
                }),
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Mutation: advance / undo / redo
    // -----------------------------------------------------------------------

    /// Create and move onto a successor snapshot capturing `state`.
    ///
    /// Any still-cached sibling branches under the departing current
    /// snapshot are flushed forward to the stage, since they leave the
    /// cache window the moment the window recenters on the new snapshot.
    pub fn advance(&mut self, state: S) -> HistoryResult<()> {
        let parent = self.current;
        let (stratum, parent_id) = {
            let node = self.node(parent);
            (node.stratum + 1, node.id)
        };

        let child = self.insert_node(SnapshotNode {
            stratum,
            state,
            id: None,
            clean: false,
            saved_backward: false,
            severed_child: None,
            previous_id: parent_id,
            previous: Some(parent),
            next_links: Vec::new(),
        });

        {
            let node = self.node_mut(parent);
            node.next_links.push(NextLink {
                next_id: None,
                next: Some(child),
            });
            // The last-written form no longer lists every forward edge.
            if node.id.is_some() {
                node.clean = false;
            }
        }

        if self.is_attached() {
            let sibling_count = self.node(parent).next_links.len() - 1;
            for index in 0..sibling_count {
                if self.node(parent).next_links[index].next.is_some() {
                    self.flush_link(parent, index)?;
                }
            }
        }

        self.current = child;
        debug!(stratum, "Advanced history");

        if self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    /// Move onto the current snapshot's parent, faulting it in from the
    /// stage when it has been elided.
    pub fn undo(&mut self) -> HistoryResult<()> {
        let (stratum, previous, previous_id, current_id) = {
            let node = self.node(self.current);
            (node.stratum, node.previous, node.previous_id, node.id)
        };
        if stratum == 0 {
            return Err(HistoryError::UndoAtRoot);
        }

        let parent = match previous {
            Some(parent) => parent,
            None => {
                let chunk = previous_id.ok_or_else(|| {
                    HistoryError::Inconsistent(
                        "non-root snapshot has neither a cached parent nor a parent chunk id"
                            .to_string(),
                    )
                })?;
                let loaded = self.load_snapshot(chunk, current_id, Some(self.current))?;
                self.node_mut(self.current).previous = Some(loaded);
                loaded
            }
        };

        self.current = parent;
        debug!(stratum = stratum - 1, "Undid history step");

        if self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    /// Undo until the current snapshot sits at `stratum`.
    pub fn undo_to_stratum(&mut self, stratum: u64) -> HistoryResult<()> {
        let current = self.current_stratum();
        if stratum > current {
            return Err(HistoryError::NotBehindCurrent {
                requested: stratum,
                current,
            });
        }
        while self.current_stratum() > stratum {
            self.undo()?;
        }
        Ok(())
    }

    /// Undo until `snapshot` is the current snapshot. The target must be a
    /// cached ancestor of the current snapshot.
    pub fn undo_to(&mut self, snapshot: SnapshotId) -> HistoryResult<()> {
        let target = self.check_handle(snapshot)?;
        let requested = self.node(target).stratum;
        let current = self.current_stratum();
        if requested > current {
            return Err(HistoryError::NotBehindCurrent { requested, current });
        }
        while self.current_stratum() > requested {
            self.undo()?;
        }
        if self.current != target {
            return Err(HistoryError::Inconsistent(
                "snapshot is not an ancestor of the current snapshot".to_string(),
            ));
        }
        Ok(())
    }

    /// Move onto the successor staged at `child_id`, loading it if it has
    /// been elided.
    pub fn redo(&mut self, child_id: ChunkId) -> HistoryResult<()> {
        let index = {
            let node = self.node(self.current);
            node.next_links.iter().position(|link| {
                link.next_id == Some(child_id)
                    || link
                        .next
                        .is_some_and(|key| self.node(key).id == Some(child_id))
            })
        };
        match index {
            Some(index) => self.redo_link(index, true),
            None => Err(HistoryError::NoSuchChild { id: child_id }),
        }
    }

    /// Redo step by step until `snapshot` is the current snapshot.
    ///
    /// The target must be a cached descendant of the current snapshot,
    /// connected to it by cached parent links; each level is redone
    /// through the matching forward edge.
    pub fn redo_to(&mut self, snapshot: SnapshotId) -> HistoryResult<()> {
        let target = self.check_handle(snapshot)?;
        if target == self.current {
            return Ok(());
        }

        // Collect the path target -> ... -> direct successor of current.
        let mut path = Vec::new();
        let mut walker = target;
        while walker != self.current {
            path.push(walker);
            walker = self.node(walker).previous.ok_or_else(|| {
                HistoryError::Inconsistent(
                    "no cached path from the current snapshot to the requested snapshot"
                        .to_string(),
                )
            })?;
        }

        for &step in path.iter().rev() {
            let index = self.node(self.current).link_to(step).ok_or_else(|| {
                HistoryError::Inconsistent(
                    "requested snapshot is not linked under its parent".to_string(),
                )
            })?;
            // Defer window enforcement to the end so intermediate steps
            // cannot evict the rest of the path.
            self.redo_link(index, false)?;
        }

        if self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    /// Single redo step through the forward edge at `index`.
    fn redo_link(&mut self, index: usize, enforce_window: bool) -> HistoryResult<()> {
        let parent = self.current;

        let child = match self.node(parent).next_links[index].next {
            Some(child) => child,
            None => {
                let chunk = self.node(parent).next_links[index].next_id.ok_or_else(|| {
                    HistoryError::Inconsistent(
                        "forward link holds neither a cached child nor a chunk id".to_string(),
                    )
                })?;
                let loaded = self.load_snapshot(chunk, None, None)?;
                let parent_id = self.node(parent).id;
                {
                    let node = self.node_mut(loaded);
                    node.previous = Some(parent);
                    if parent_id.is_some() {
                        node.previous_id = parent_id;
                    }
                }
                self.node_mut(parent).next_links[index].next = Some(loaded);
                loaded
            }
        };

        // The chosen link is live again; it will be rewritten on the next
        // save together with its parent.
        {
            let node = self.node_mut(parent);
            node.next_links[index].next_id = None;
            if node.id.is_some() {
                node.clean = false;
            }
        }

        if self.is_attached() {
            let link_count = self.node(parent).next_links.len();
            for sibling in 0..link_count {
                if sibling != index && self.node(parent).next_links[sibling].next.is_some() {
                    self.flush_link(parent, sibling)?;
                }
            }
        }

        self.current = child;
        debug!(stratum = self.node(child).stratum, "Redid history step");

        if enforce_window && self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence: save / lift / remap
    // -----------------------------------------------------------------------

    /// Materialize every unsaved reachable snapshot onto the stage and
    /// re-establish the cache window around the current snapshot.
    ///
    /// The current snapshot is written last, backward-linked, so its chunk
    /// ID is the natural handle to reopen the history from. Already
    /// persisted snapshots are skipped, which also makes a save retried
    /// after an I/O failure pick up where it left off.
    pub fn save(&mut self) -> HistoryResult<()> {
        if !self.is_attached() {
            return Err(HistoryError::Detached);
        }

        let current = self.current;
        let min_stratum = self
            .node(current)
            .stratum
            .saturating_sub(self.max_cached_strata as u64);
        self.save_backward(current, min_stratum, None)?;
        self.update_cache_level()?;

        info!(
            id = ?self.node(current).id,
            stratum = self.node(current).stratum,
            "Saved history"
        );
        Ok(())
    }

    /// Replace the backing stage.
    ///
    /// Attaching to a stage saves the tree onto it; detaching lifts the
    /// whole reachable tree into memory first; switching stages remaps the
    /// tree onto the new one with fresh chunk IDs.
    pub fn set_stage(&mut self, stage: Option<Arc<Stage>>) -> HistoryResult<()> {
        let unchanged = match (&self.stage, &stage) {
            (None, None) => true,
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if self.state_io.is_some() {
            if self.stage.is_none() {
                self.stage = stage;
                info!("Attached history to stage");
                self.save()?;
            } else if let Some(target) = stage {
                self.map_to_stage(target)?;
            } else {
                self.lift_all()?;
                self.stage = None;
                info!("Detached history from stage");
            }
        } else {
            self.stage = stage;
        }

        if !self.is_attached() {
            self.forward_tail = -1;
            self.backward_tail = -1;
        }
        Ok(())
    }

    /// Replace the state codec, following the same skeleton as
    /// [`set_stage`](History::set_stage): attach-save, lift on clearing,
    /// or re-materialize every snapshot through the new codec.
    pub fn set_state_io(&mut self, state_io: Option<IO>) -> HistoryResult<()> {
        if self.stage.is_some() {
            match (self.state_io.is_some(), state_io.is_some()) {
                (false, true) => {
                    self.state_io = state_io;
                    self.save()?;
                }
                (true, false) => {
                    self.lift_all()?;
                    self.state_io = None;
                }
                (true, true) => {
                    // Payload sizes may differ between codecs: lift with
                    // the old one, rewrite with the new one.
                    self.lift_all()?;
                    self.state_io = state_io;
                    self.save()?;
                }
                (false, false) => {}
            }
        } else {
            self.state_io = state_io;
        }

        if !self.is_attached() {
            self.forward_tail = -1;
            self.backward_tail = -1;
        }
        Ok(())
    }

    /// Change the cache window radius, evicting any snapshots the smaller
    /// window no longer covers.
    pub fn set_max_cached_strata(&mut self, max_cached_strata: u32) -> HistoryResult<()> {
        if max_cached_strata == self.max_cached_strata {
            return Ok(());
        }
        self.max_cached_strata = max_cached_strata;
        if self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    /// Fault the entire reachable tree into memory and drop every
    /// persistence mark, leaving a purely in-memory tree.
    fn lift_all(&mut self) -> HistoryResult<()> {
        // Climb to the root, faulting elided parents in as encountered.
        let mut top = self.current;
        loop {
            let (previous, previous_id, id) = {
                let node = self.node(top);
                (node.previous, node.previous_id, node.id)
            };
            match previous {
                Some(parent) => top = parent,
                None => match previous_id {
                    Some(chunk) => {
                        let loaded = self.load_snapshot(chunk, id, Some(top))?;
                        self.node_mut(top).previous = Some(loaded);
                        top = loaded;
                    }
                    None => break,
                },
            }
        }

        // Fault in every elided descendant, worklist from the root.
        let mut stack = vec![top];
        while let Some(key) = stack.pop() {
            let link_count = self.node(key).next_links.len();
            for index in 0..link_count {
                let link = self.node(key).next_links[index];
                match link.next {
                    Some(child) => stack.push(child),
                    None => {
                        if let Some(chunk) = link.next_id {
                            let parent_id = self.node(key).id;
                            let loaded = self.load_snapshot(chunk, None, None)?;
                            {
                                let child = self.node_mut(loaded);
                                child.previous = Some(key);
                                if parent_id.is_some() {
                                    child.previous_id = parent_id;
                                }
                            }
                            self.node_mut(key).next_links[index].next = Some(loaded);
                            stack.push(loaded);
                        }
                        // A slot with neither side is a branch severed
                        // without context at write time; nothing to lift.
                    }
                }
            }
        }

        for node in self.nodes.values_mut() {
            node.id = None;
            node.clean = false;
            node.saved_backward = false;
            node.severed_child = None;
            node.previous_id = None;
            for link in &mut node.next_links {
                link.next_id = None;
            }
        }
        self.forward_tail = -1;
        self.backward_tail = -1;

        info!(snapshots = self.nodes.len(), "Lifted history off the stage");
        Ok(())
    }

    /// Rewrite the reachable tree onto `target` with fresh chunk IDs.
    /// Chunk IDs are stage-specific offsets, so none can be reused.
    fn map_to_stage(&mut self, target: Arc<Stage>) -> HistoryResult<()> {
        self.lift_all()?;
        self.stage = Some(target);
        self.save()?;
        info!("Remapped history onto a different stage");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache window
    // -----------------------------------------------------------------------

    /// Re-establish the distance invariant around the current snapshot:
    /// persist and elide everything farther than `max_cached_strata` steps
    /// away, then refresh the tail counters. Hydration stays lazy; this
    /// only ever evicts.
    fn update_cache_level(&mut self) -> HistoryResult<()> {
        if !self.is_attached() {
            return Ok(());
        }
        self.evict_backward()?;
        self.evict_forward()?;
        self.recompute_tails();
        Ok(())
    }

    /// Persist and sever the ancestor chain beyond the window radius.
    fn evict_backward(&mut self) -> HistoryResult<()> {
        let radius = self.max_cached_strata as u64;

        let mut node = self.current;
        let mut below = None;
        for _ in 0..radius {
            match self.node(node).previous {
                Some(parent) => {
                    below = Some(node);
                    node = parent;
                }
                None => return Ok(()),
            }
        }

        if self.node(node).previous.is_some() {
            let boundary_stratum = self.node(node).stratum;
            self.save_backward(node, boundary_stratum, below)?;
        }
        Ok(())
    }

    /// Flush cached descendants (and cached side branches hanging off
    /// ancestors) that lie beyond the window radius.
    fn evict_forward(&mut self) -> HistoryResult<()> {
        let radius = self.max_cached_strata as i64;

        self.forward_prune(self.current, radius)?;

        // Side branches off the backward chain: a child of the ancestor at
        // distance d sits at distance d + 1 from the current snapshot.
        let mut node = self.current;
        let mut distance = 0i64;
        loop {
            let (previous, path_child) = (self.node(node).previous, node);
            let Some(parent) = previous else { break };
            distance += 1;

            let link_count = self.node(parent).next_links.len();
            for index in 0..link_count {
                let child = self.node(parent).next_links[index].next;
                let Some(child) = child else { continue };
                if child == path_child {
                    continue;
                }
                let budget = radius - distance - 1;
                if budget < 0 {
                    self.flush_link(parent, index)?;
                } else {
                    self.forward_prune(child, budget)?;
                }
            }

            if distance >= radius {
                break;
            }
            node = parent;
        }
        Ok(())
    }

    /// Ensure no cached descendant lies deeper than `budget` levels below
    /// `key`, flushing whole subtrees at the frontier.
    fn forward_prune(&mut self, key: NodeKey, budget: i64) -> HistoryResult<()> {
        let link_count = self.node(key).next_links.len();
        for index in 0..link_count {
            let child = self.node(key).next_links[index].next;
            let Some(child) = child else { continue };
            if budget <= 0 {
                self.flush_link(key, index)?;
            } else {
                self.forward_prune(child, budget - 1)?;
            }
        }
        Ok(())
    }

    /// Persist the subtree behind one forward edge, record its chunk ID in
    /// the link, and drop the subtree from memory.
    fn flush_link(&mut self, parent: NodeKey, index: usize) -> HistoryResult<()> {
        let Some(child) = self.node(parent).next_links[index].next else {
            return Ok(());
        };
        let parent_stratum = self.node(parent).stratum;
        self.save_forward(child, parent_stratum)?;

        let child_id = self.node(child).id;
        {
            let node = self.node_mut(parent);
            node.next_links[index].next_id = child_id;
            node.next_links[index].next = None;
        }
        self.prune_subtree(child);
        Ok(())
    }

    /// Refresh the tail counters from the cached tree.
    fn recompute_tails(&mut self) {
        if !self.is_attached() {
            self.forward_tail = -1;
            self.backward_tail = -1;
            return;
        }
        let radius = self.max_cached_strata as i64;

        let mut backward = 0i64;
        let mut node = self.current;
        while backward < radius {
            match self.node(node).previous {
                Some(parent) => {
                    node = parent;
                    backward += 1;
                }
                None => break,
            }
        }
        self.backward_tail = backward;
        self.forward_tail = self.forward_depth(self.current, radius);
    }

    /// Depth of the deepest cached descendant below `key`, capped.
    fn forward_depth(&self, key: NodeKey, cap: i64) -> i64 {
        if cap == 0 {
            return 0;
        }
        let mut deepest = 0;
        for link in &self.node(key).next_links {
            if let Some(child) = link.next {
                deepest = deepest.max(1 + self.forward_depth(child, cap - 1));
            }
        }
        deepest
    }

    // -----------------------------------------------------------------------
    // Recursive save helpers
    // -----------------------------------------------------------------------

    /// Persist `key` and its cached descendants, children first, writing
    /// each node forward-only (prevID severed on disk; the backward link
    /// is reconnected in memory while descending). At `max_stratum` the
    /// strong child references are dropped.
    fn save_forward(&mut self, key: NodeKey, max_stratum: u64) -> HistoryResult<()> {
        let link_count = self.node(key).next_links.len();
        for index in 0..link_count {
            let child = self.node(key).next_links[index].next;
            if let Some(child) = child {
                self.save_forward(child, max_stratum)?;
                let child_id = self.node(child).id;
                self.node_mut(key).next_links[index].next_id = child_id;
            }
        }

        if self.node(key).needs_write(false, None) {
            self.write_node_chunk(key, false, None)?;
        }

        if self.node(key).stratum >= max_stratum {
            for index in 0..link_count {
                let child = self.node(key).next_links[index].next;
                if let Some(child) = child {
                    self.node_mut(key).next_links[index].next = None;
                    self.prune_subtree(child);
                }
            }
        }
        Ok(())
    }

    /// Persist `key` and its cached ancestor chain, parents first so each
    /// node can record its parent's chunk ID, severing the forward slot
    /// toward `skip` (the path child, which does not exist on disk yet at
    /// the moment its parent is written). At `min_stratum` the strong
    /// parent reference is dropped and everything above leaves memory.
    fn save_backward(
        &mut self,
        key: NodeKey,
        min_stratum: u64,
        skip: Option<NodeKey>,
    ) -> HistoryResult<()> {
        // Side branches must be on disk before their slots are written.
        let link_count = self.node(key).next_links.len();
        for index in 0..link_count {
            let child = self.node(key).next_links[index].next;
            let Some(child) = child else { continue };
            if Some(child) == skip {
                continue;
            }
            self.save_forward(child, u64::MAX)?;
            let child_id = self.node(child).id;
            self.node_mut(key).next_links[index].next_id = child_id;
        }

        if let Some(parent) = self.node(key).previous {
            self.save_backward(parent, min_stratum, Some(key))?;
            let parent_id = self.node(parent).id;
            self.node_mut(key).previous_id = parent_id;
        }

        if self.node(key).needs_write(true, skip) {
            self.write_node_chunk(key, true, skip)?;
        }

        if self.node(key).stratum == min_stratum {
            if let Some(parent) = self.node_mut(key).previous.take() {
                self.prune_ancestors(parent, key);
            }
        }
        Ok(())
    }

    /// Drop `key` and its cached descendants from the arena.
    fn prune_subtree(&mut self, key: NodeKey) {
        let mut stack = vec![key];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                for link in node.next_links {
                    if let Some(child) = link.next {
                        stack.push(child);
                    }
                }
            }
        }
    }

    /// Drop `key` and its cached ancestors from the arena, together with
    /// any side subtrees hanging off them, leaving the path child
    /// `exclude` (and everything below it) untouched.
    fn prune_ancestors(&mut self, key: NodeKey, mut exclude: NodeKey) {
        let mut next = Some(key);
        while let Some(current) = next {
            let Some(node) = self.nodes.remove(&current) else {
                break;
            };
            next = node.previous;
            for link in node.next_links {
                if let Some(child) = link.next {
                    if child != exclude {
                        self.prune_subtree(child);
                    }
                }
            }
            exclude = current;
        }
    }

    // -----------------------------------------------------------------------
    // Chunk I/O
    // -----------------------------------------------------------------------

    /// Serialize one node and append it to the stage, minting its chunk
    /// ID. `backward` selects whether the real prevID is written; `skip`
    /// names the forward slot severed to -1.
    fn write_node_chunk(
        &mut self,
        key: NodeKey,
        backward: bool,
        skip: Option<NodeKey>,
    ) -> HistoryResult<ChunkId> {
        let stage = self.stage.clone().ok_or(HistoryError::Detached)?;

        // Encode into the scratch buffer. Field-disjoint borrows: the
        // codec and node are read while scratch is written.
        let io = self.state_io.as_ref().ok_or(HistoryError::Detached)?;
        let node = self
            .nodes
            .get(&key)
            .expect("cached snapshot disappeared during save");
        let scratch = &mut self.scratch;

        scratch.clear();
        scratch.extend_from_slice(&(node.stratum as i64).to_be_bytes());
        let prev_raw = if backward {
            encode_chunk_id(node.previous_id)
        } else {
            NIL_CHUNK_ID
        };
        scratch.extend_from_slice(&prev_raw.to_be_bytes());
        io.write_node(&node.state, scratch);
        scratch.extend_from_slice(&(node.next_links.len() as i32).to_be_bytes());
        for link in &node.next_links {
            let raw = if skip.is_some() && link.next == skip {
                NIL_CHUNK_ID
            } else {
                encode_chunk_id(link.next_id)
            };
            scratch.extend_from_slice(&raw.to_be_bytes());
        }

        let id = stage.append(&self.scratch)?;

        let previous = {
            let node = self.node_mut(key);
            node.id = Some(id);
            node.clean = true;
            node.saved_backward = backward;
            node.severed_child = skip;
            node.previous
        };

        // A fresh chunk ID invalidates a parent form that referenced this
        // node through a real slot; a severed path slot absorbs the churn.
        if let Some(parent) = previous {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                if let Some(index) = parent_node.link_to(key) {
                    parent_node.next_links[index].next_id = Some(id);
                }
                if parent_node.id.is_some() && parent_node.severed_child != Some(key) {
                    parent_node.clean = false;
                }
            }
        }

        debug!(id, backward, "Wrote snapshot chunk");
        Ok(id)
    }

    /// Load the snapshot chunk at `id` into the arena.
    ///
    /// `elided_forward` / `elided_forward_id` name the in-memory successor
    /// that corresponds to the severed (-1) forward slot, if the caller
    /// has one; the loader substitutes the pair wherever it sees the
    /// sentinel, and also reconnects the successor when its slot was
    /// written with a real chunk ID that still matches.
    fn load_snapshot(
        &mut self,
        id: ChunkId,
        elided_forward_id: Option<ChunkId>,
        elided_forward: Option<NodeKey>,
    ) -> HistoryResult<NodeKey> {
        let stage = self.stage.clone().ok_or(HistoryError::Detached)?;

        let (stratum, previous_id, state, link_count) = {
            let io = self.state_io.as_ref().ok_or(HistoryError::Detached)?;
            let payload_size = io.node_buffer_size();
            let prefix_size = STATIC_PREFIX_SIZE + payload_size + LINK_COUNT_SIZE;
            self.scratch.resize(prefix_size, 0);
            stage.read(&mut self.scratch[..prefix_size], id)?;

            let mut cursor = &self.scratch[..prefix_size];
            let stratum = take_i64(&mut cursor) as u64;
            let previous_id = decode_chunk_id(take_i64(&mut cursor));
            let state = io.read_node(&mut cursor);
            let link_count = take_i32(&mut cursor).max(0) as usize;
            (stratum, previous_id, state, link_count)
        };

        // Read the nextID slots in batches bounded by the scratch size.
        let mut raw_links = Vec::with_capacity(link_count);
        let batch_capacity = (self.scratch.len() / 8).max(1);
        let mut remaining = link_count;
        let mut position = id + (STATIC_PREFIX_SIZE + LINK_COUNT_SIZE) as u64
            + self.state_io.as_ref().map_or(0, |io| io.node_buffer_size()) as u64;
        while remaining > 0 {
            let batch = remaining.min(batch_capacity);
            let bytes = batch * 8;
            self.scratch.resize(bytes, 0);
            stage.read(&mut self.scratch[..bytes], position)?;
            let mut cursor = &self.scratch[..bytes];
            for _ in 0..batch {
                raw_links.push(take_i64(&mut cursor));
            }
            position += bytes as u64;
            remaining -= batch;
        }

        let next_links: Vec<NextLink> = raw_links
            .iter()
            .map(|&raw| match decode_chunk_id(raw) {
                Some(chunk) if elided_forward_id == Some(chunk) => NextLink {
                    next_id: Some(chunk),
                    next: elided_forward,
                },
                Some(chunk) => NextLink {
                    next_id: Some(chunk),
                    next: None,
                },
                None => NextLink {
                    next_id: elided_forward_id,
                    next: elided_forward,
                },
            })
            .collect();

        let severed = raw_links.iter().any(|&raw| raw < 0);
        let key = self.insert_node(SnapshotNode {
            stratum,
            state,
            id: Some(id),
            // A severed slot with no context is unrecoverable from this
            // form; force a rewrite if the node is ever saved again.
            clean: !(severed && elided_forward.is_none()),
            saved_backward: previous_id.is_some() || stratum == 0,
            severed_child: if severed { elided_forward } else { None },
            previous_id,
            previous: None,
            next_links,
        });

        debug!(id, stratum, links = link_count, "Loaded snapshot chunk");
        Ok(key)
    }

    // -----------------------------------------------------------------------
    // Arena plumbing
    // -----------------------------------------------------------------------

    fn node(&self, key: NodeKey) -> &SnapshotNode<S> {
        self.nodes.get(&key).expect("cached snapshot disappeared")
    }

    fn node_mut(&mut self, key: NodeKey) -> &mut SnapshotNode<S> {
        self.nodes
            .get_mut(&key)
            .expect("cached snapshot disappeared")
    }

    fn insert_node(&mut self, node: SnapshotNode<S>) -> NodeKey {
        let key = self.next_key;
        self.next_key += 1;
        self.nodes.insert(key, node);
        key
    }

    fn check_handle(&self, snapshot: SnapshotId) -> HistoryResult<NodeKey> {
        if snapshot.history != self.tag {
            return Err(HistoryError::ForeignSnapshot);
        }
        if !self.nodes.contains_key(&snapshot.key) {
            return Err(HistoryError::UnknownSnapshot);
        }
        Ok(snapshot.key)
    }
}

impl<S, IO> std::fmt::Debug for History<S, IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("attached", &(self.stage.is_some() && self.state_io.is_some()))
            .field("max_cached_strata", &self.max_cached_strata)
            .field("cached_snapshots", &self.nodes.len())
            .finish()
    }
}
